//! Turns offer/answer events into transfer jobs.
//!
//! Outbound: `offer_file` sends a FILE_TRANSFER_REQUEST and remembers the
//! file under its transfer id. When the matching ACCEPT arrives the job is
//! started against the endpoint in the answer.
//!
//! Inbound: with [`TransferPolicy::AutoAccept`] every offer gets a fresh
//! listen socket and an ACCEPT carrying its address and port.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};
use uuid::Uuid;

use rendezvous_shared::{FileOffer, TransferAnswer, TransferDecision, TransferEndpoint};
use rendezvous_transfer::{TransferHandle, TransferJob, TransferService};

use crate::client::RendezvousClient;
use crate::error::ClientError;
use crate::events::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPolicy {
    AutoAccept,
    RejectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// A job started by the negotiator.
pub struct StartedTransfer {
    pub transfer_id: Uuid,
    pub peer: String,
    pub file_name: String,
    pub direction: TransferDirection,
    pub handle: TransferHandle,
}

struct PendingOffer {
    receiver: String,
    path: PathBuf,
    offer: FileOffer,
}

pub struct Negotiator {
    service: TransferService,
    policy: TransferPolicy,
    pending: HashMap<Uuid, PendingOffer>,
}

impl Negotiator {
    pub fn new(service: TransferService, policy: TransferPolicy) -> Self {
        Self {
            service,
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn service(&self) -> &TransferService {
        &self.service
    }

    /// Offers sent but not yet answered.
    pub fn pending_offers(&self) -> usize {
        self.pending.len()
    }

    /// Forget an unanswered offer. A late ACCEPT for it is then ignored.
    pub fn cancel_offer(&mut self, transfer_id: &Uuid) -> bool {
        self.pending.remove(transfer_id).is_some()
    }

    /// Offer one file to `receiver`. Each file is its own offer.
    pub async fn offer_file(
        &mut self,
        client: &RendezvousClient,
        receiver: &str,
        path: impl Into<PathBuf>,
    ) -> Result<Uuid, ClientError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ClientError::InvalidFile(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::InvalidFile(format!("{} has no usable file name", path.display()))
            })?;

        let offer = FileOffer {
            transfer_id: Uuid::new_v4(),
            file_name,
            file_size: metadata.len(),
        };
        client.offer_file(receiver, offer.clone())?;

        info!(
            transfer = %offer.transfer_id,
            to = %receiver,
            file = %offer.file_name,
            size = offer.file_size,
            "File offered"
        );
        let transfer_id = offer.transfer_id;
        self.pending.insert(
            transfer_id,
            PendingOffer {
                receiver: receiver.to_string(),
                path,
                offer,
            },
        );
        Ok(transfer_id)
    }

    /// React to a client event. Returns the job it started, if any.
    pub async fn handle_event(
        &mut self,
        client: &RendezvousClient,
        event: &ClientEvent,
    ) -> Result<Option<StartedTransfer>, ClientError> {
        match event {
            ClientEvent::IncomingOffer { from, offer } => self.on_offer(client, from, offer).await,
            ClientEvent::OfferAnswered {
                from,
                decision,
                answer,
            } => Ok(self.on_answer(client, from, *decision, answer)),
            _ => Ok(None),
        }
    }

    async fn on_offer(
        &mut self,
        client: &RendezvousClient,
        from: &str,
        offer: &FileOffer,
    ) -> Result<Option<StartedTransfer>, ClientError> {
        if self.policy == TransferPolicy::RejectAll {
            info!(transfer = %offer.transfer_id, from = %from, "Offer rejected by policy");
            client.respond_to_offer(from, offer.transfer_id, TransferDecision::Reject, None)?;
            return Ok(None);
        }

        let inbound = self.service.start_transfer_server(0).await?;
        let endpoint = TransferEndpoint {
            address: client.local_ip().to_string(),
            port: inbound.port,
        };

        if let Err(e) = client.respond_to_offer(
            from,
            offer.transfer_id,
            TransferDecision::Accept,
            Some(endpoint),
        ) {
            inbound.handle.abort();
            return Err(e);
        }

        info!(
            transfer = %offer.transfer_id,
            from = %from,
            file = %offer.file_name,
            port = inbound.port,
            "Offer accepted"
        );
        Ok(Some(StartedTransfer {
            transfer_id: offer.transfer_id,
            peer: from.to_string(),
            file_name: offer.file_name.clone(),
            direction: TransferDirection::Inbound,
            handle: inbound.handle,
        }))
    }

    fn on_answer(
        &mut self,
        client: &RendezvousClient,
        from: &str,
        decision: TransferDecision,
        answer: &TransferAnswer,
    ) -> Option<StartedTransfer> {
        let Some(pending) = self.pending.remove(&answer.transfer_id) else {
            warn!(transfer = %answer.transfer_id, from = %from, "Answer for unknown offer");
            return None;
        };
        if pending.receiver != from {
            warn!(
                transfer = %answer.transfer_id,
                from = %from,
                expected = %pending.receiver,
                "Answer from the wrong peer"
            );
            self.pending.insert(answer.transfer_id, pending);
            return None;
        }

        let endpoint = match (decision, &answer.endpoint) {
            (TransferDecision::Accept, Some(endpoint)) => endpoint,
            (TransferDecision::Accept, None) => {
                warn!(transfer = %answer.transfer_id, "Accepted without an endpoint");
                return None;
            }
            (TransferDecision::Reject, _) => {
                info!(transfer = %answer.transfer_id, from = %from, "Offer declined");
                return None;
            }
        };

        let job = TransferJob {
            transfer_id: pending.offer.transfer_id,
            sender: client.username().unwrap_or_default().to_string(),
            receiver: pending.receiver.clone(),
            file_name: pending.offer.file_name.clone(),
            file_size: pending.offer.file_size,
            peer_address: endpoint.address.clone(),
            peer_port: endpoint.port,
        };
        let handle = self.service.send_file(job, pending.path);

        Some(StartedTransfer {
            transfer_id: pending.offer.transfer_id,
            peer: pending.receiver,
            file_name: pending.offer.file_name,
            direction: TransferDirection::Outbound,
            handle,
        })
    }
}
