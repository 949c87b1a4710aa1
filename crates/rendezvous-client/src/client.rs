//! Control connection to the rendezvous server.
//!
//! The socket is split into a writer task draining an outbox and a reader
//! task that turns inbound envelopes into [`ClientEvent`]s. Requests that
//! expect an answer (register, login, logout) park a oneshot in the reply
//! slot together with the request kind. The reader hands it the matching
//! reply, or an ERROR naming that request kind; every other envelope becomes
//! an event. Only one such request runs at a time.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rendezvous_shared::constants::SERVER_NAME;
use rendezvous_shared::{
    read_envelope, write_envelope, Credentials, Envelope, EnvelopeKind, FileOffer,
    TransferDecision, TransferEndpoint,
};

use crate::error::ClientError;
use crate::events::ClientEvent;

/// A request waiting for the server's answer.
struct PendingReply {
    request: EnvelopeKind,
    reply: oneshot::Sender<Envelope>,
}

type ReplySlot = Arc<Mutex<Option<PendingReply>>>;

#[derive(Debug)]
struct Identity {
    username: String,
    /// Address the server observed at login.
    observed_address: String,
}

pub struct RendezvousClient {
    outbox: mpsc::UnboundedSender<Envelope>,
    reply_slot: ReplySlot,
    request_lock: Mutex<()>,
    identity: OnceLock<Identity>,
    local_ip: IpAddr,
    server_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RendezvousClient {
    /// Connect to the server, bounded by `connect_timeout`.
    pub async fn connect(
        server_addr: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let stream =
            connect_with_timeout(server_addr, connect_timeout, TcpStream::connect(server_addr))
                .await?;

        let local_ip = stream.local_addr()?.ip();
        let peer = stream.peer_addr()?;
        info!(server = %peer, local_ip = %local_ip, "Connected to rendezvous server");

        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reply_slot: ReplySlot = Arc::new(Mutex::new(None));

        let writer_task = tokio::spawn(write_loop(writer, outbox_rx));
        let reader_task = tokio::spawn(read_loop(reader, reply_slot.clone(), events_tx));

        let client = Self {
            outbox,
            reply_slot,
            request_lock: Mutex::new(()),
            identity: OnceLock::new(),
            local_ip,
            server_addr: peer,
            tasks: vec![writer_task, reader_task],
        };
        Ok((client, events_rx))
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Username bound by a successful login.
    pub fn username(&self) -> Result<&str, ClientError> {
        self.identity
            .get()
            .map(|identity| identity.username.as_str())
            .ok_or(ClientError::NotLoggedIn)
    }

    pub fn observed_address(&self) -> Option<&str> {
        self.identity
            .get()
            .map(|identity| identity.observed_address.as_str())
    }

    // -- Requests with a reply -------------------------------------------------

    pub async fn register(&self, username: &str, secret: &str) -> Result<(), ClientError> {
        let credentials = Credentials::new(username, secret);
        self.request(Envelope::register(&credentials), EnvelopeKind::Register)
            .await?;
        info!(username = %username, "Registered");
        Ok(())
    }

    /// Log in and return the address the server advertises for us.
    pub async fn login(&self, username: &str, secret: &str) -> Result<String, ClientError> {
        let credentials = Credentials::new(username, secret);
        let reply = self
            .request(Envelope::login(&credentials), EnvelopeKind::Login)
            .await?;

        let observed_address = reply
            .address()
            .map(str::to_string)
            .unwrap_or_else(|| self.local_ip.to_string());
        let _ = self.identity.set(Identity {
            username: username.to_string(),
            observed_address: observed_address.clone(),
        });

        info!(username = %username, address = %observed_address, "Logged in");
        Ok(observed_address)
    }

    /// Log out. The server closes the connection afterwards.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let me = self.username()?;
        self.request(Envelope::logout(me), EnvelopeKind::Logout).await?;
        info!(username = %me, "Logged out");
        Ok(())
    }

    async fn request(
        &self,
        envelope: Envelope,
        expected: EnvelopeKind,
    ) -> Result<Envelope, ClientError> {
        let _guard = self.request_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.reply_slot.lock().await = Some(PendingReply {
            request: envelope.kind(),
            reply: tx,
        });
        self.send(envelope)?;

        let reply = rx.await.map_err(|_| ClientError::Disconnected)?;
        match reply.kind() {
            kind if kind == expected => Ok(reply),
            EnvelopeKind::Error => Err(ClientError::Refused(reply.content().to_string())),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    // -- Fire-and-forget -------------------------------------------------------
    //
    // Failures of these come back later as `ClientEvent::ServerError`.

    fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.outbox
            .send(envelope)
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn send_friend_request(&self, target: &str) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::new(
            EnvelopeKind::FriendRequest,
            me,
            target,
            format!("{} wants to be your friend", me),
        ))
    }

    pub fn accept_friend_request(&self, requester: &str) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::new(EnvelopeKind::FriendAccept, me, requester, ""))
    }

    pub fn reject_friend_request(&self, requester: &str) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::new(EnvelopeKind::FriendReject, me, requester, ""))
    }

    pub fn remove_friend(&self, friend: &str) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::new(EnvelopeKind::FriendRemove, me, friend, ""))
    }

    /// Ask for an immediate presence snapshot.
    pub fn request_presence(&self) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::new(EnvelopeKind::FriendListUpdate, me, SERVER_NAME, ""))
    }

    pub fn offer_file(&self, receiver: &str, offer: FileOffer) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::file_offer(me, receiver, offer))
    }

    pub fn respond_to_offer(
        &self,
        requester: &str,
        transfer_id: Uuid,
        decision: TransferDecision,
        endpoint: Option<TransferEndpoint>,
    ) -> Result<(), ClientError> {
        let me = self.username()?;
        self.send(Envelope::file_answer(me, requester, decision, transfer_id, endpoint))
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            warn!(error = %e, "Write to server failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    reply_slot: ReplySlot,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        let envelope = match read_envelope(&mut reader).await {
            Ok(envelope) => envelope,
            Err(e) if e.is_fatal() => {
                debug!(error = %e, "Server stream closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed envelope");
                continue;
            }
        };

        if let Some(request) = answered_request(&envelope) {
            let mut slot = reply_slot.lock().await;
            match slot.take() {
                Some(pending) if pending.request == request => {
                    let _ = pending.reply.send(envelope);
                    continue;
                }
                other => *slot = other,
            }
        }

        if let Some(event) = to_event(envelope) {
            if events.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }
    }

    // Wakes a pending request with `Disconnected`.
    reply_slot.lock().await.take();
    let _ = events.send(ClientEvent::Disconnected);
}

/// Request kind `envelope` answers, if it is a reply at all.
fn answered_request(envelope: &Envelope) -> Option<EnvelopeKind> {
    match envelope.kind() {
        kind @ (EnvelopeKind::Register | EnvelopeKind::Login | EnvelopeKind::Logout) => Some(kind),
        EnvelopeKind::Error => envelope.in_reply_to(),
        _ => None,
    }
}

/// Bound `connect` by `timeout`.
async fn connect_with_timeout<F, T>(
    addr: &str,
    timeout: Duration,
    connect: F,
) -> Result<T, ClientError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClientError::ConnectTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

pub(crate) fn to_event(envelope: Envelope) -> Option<ClientEvent> {
    let message = envelope.content().to_string();
    let from = envelope.sender().to_string();

    match envelope.kind() {
        EnvelopeKind::FriendRequest => Some(ClientEvent::FriendRequest { from, message }),
        EnvelopeKind::FriendAccept => Some(ClientEvent::FriendAdded {
            friend: from,
            message,
        }),
        EnvelopeKind::FriendReject => Some(ClientEvent::FriendRejected { by: from, message }),
        EnvelopeKind::FriendRemove => Some(ClientEvent::FriendRemoved { message }),
        EnvelopeKind::FriendListUpdate => match envelope.presence() {
            Some(snapshot) => Some(ClientEvent::Presence(snapshot.clone())),
            None => {
                warn!("FRIEND_LIST_UPDATE without snapshot");
                None
            }
        },
        EnvelopeKind::FileTransferRequest => match envelope.offer() {
            Some(offer) => Some(ClientEvent::IncomingOffer {
                from,
                offer: offer.clone(),
            }),
            None => {
                warn!(from = %from, "Transfer request without offer");
                None
            }
        },
        EnvelopeKind::FileTransferResponse => match (envelope.decision(), envelope.answer()) {
            (Some(decision), Some(answer)) => Some(ClientEvent::OfferAnswered {
                from,
                decision,
                answer: answer.clone(),
            }),
            _ => {
                warn!(from = %from, content = %message, "Unreadable transfer response");
                None
            }
        },
        EnvelopeKind::Error => Some(ClientEvent::ServerError(message)),
        EnvelopeKind::Register | EnvelopeKind::Login | EnvelopeKind::Logout => {
            debug!(kind = %envelope.kind(), "Unsolicited reply ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_shared::{Attachment, PresenceSnapshot};

    #[test]
    fn test_to_event_mapping() {
        let request = Envelope::new(EnvelopeKind::FriendRequest, "alice", "bob", "hi");
        assert_eq!(
            to_event(request),
            Some(ClientEvent::FriendRequest {
                from: "alice".into(),
                message: "hi".into()
            })
        );

        let mut snapshot = PresenceSnapshot::default();
        snapshot.status.insert("alice".into(), false);
        let update = Envelope::from_server(EnvelopeKind::FriendListUpdate, "bob", "")
            .with_attachment(Attachment::Presence(snapshot.clone()));
        assert_eq!(to_event(update), Some(ClientEvent::Presence(snapshot)));

        let bare = Envelope::from_server(EnvelopeKind::FriendListUpdate, "bob", "");
        assert_eq!(to_event(bare), None);

        let id = Uuid::new_v4();
        let answer = Envelope::file_answer("bob", "alice", TransferDecision::Reject, id, None);
        match to_event(answer) {
            Some(ClientEvent::OfferAnswered { decision, answer, .. }) => {
                assert_eq!(decision, TransferDecision::Reject);
                assert_eq!(answer.transfer_id, id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_answered_request() {
        let logout = Envelope::from_server(EnvelopeKind::Logout, "alice", "Logged out");
        assert_eq!(answered_request(&logout), Some(EnvelopeKind::Logout));

        let refused = Envelope::error_reply(EnvelopeKind::FriendRequest, "alice", "Unknown user");
        assert_eq!(answered_request(&refused), Some(EnvelopeKind::FriendRequest));

        let removed = Envelope::error("alice", "Your account has been removed");
        assert_eq!(answered_request(&removed), None);

        let update = Envelope::from_server(EnvelopeKind::FriendListUpdate, "alice", "");
        assert_eq!(answered_request(&update), None);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let never = std::future::pending::<std::io::Result<()>>();
        let result = connect_with_timeout("peer:1", Duration::from_millis(20), never).await;
        match result {
            Err(ClientError::ConnectTimeout { addr, timeout }) => {
                assert_eq!(addr, "peer:1");
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("unexpected {:?}", other),
        }

        let refused = async {
            Err::<(), _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        };
        let result = connect_with_timeout("peer:1", Duration::from_secs(1), refused).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn test_fire_and_forget_requires_login() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, _events) = RendezvousClient::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            client.send_friend_request("bob"),
            Err(ClientError::NotLoggedIn)
        ));
        assert!(client.observed_address().is_none());
    }
}
