use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rendezvous_client::{
    ClientConfig, ClientError, ClientEvent, Negotiator, RendezvousClient, StartedTransfer,
    TransferDirection, TransferPolicy,
};
use rendezvous_transfer::{TransferError, TransferReport, TransferService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,rendezvous_client=debug,rendezvous_transfer=debug")
        }))
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let (Some(username), Some(secret)) = (config.username.clone(), config.secret.clone()) else {
        anyhow::bail!("CLIENT_USERNAME and CLIENT_SECRET must be set");
    };

    // -----------------------------------------------------------------------
    // 3. Connect and authenticate
    // -----------------------------------------------------------------------
    let (client, mut events) =
        RendezvousClient::connect(&config.server_addr, config.connect_timeout).await?;

    if config.register {
        match client.register(&username, &secret).await {
            Ok(()) => {}
            Err(ClientError::Refused(reason)) => {
                warn!(reason = %reason, "Registration refused, trying to log in")
            }
            Err(e) => return Err(e.into()),
        }
    }
    client.login(&username, &secret).await?;

    // -----------------------------------------------------------------------
    // 4. Offer configured files
    // -----------------------------------------------------------------------
    let mut negotiator = Negotiator::new(
        TransferService::new(config.transport_config()),
        TransferPolicy::AutoAccept,
    );

    if let Some(target) = &config.send_to {
        for path in &config.send_files {
            if let Err(e) = negotiator.offer_file(&client, target, path.clone()).await {
                warn!(path = %path.display(), error = %e, "Could not offer file");
            }
        }
    }

    // -----------------------------------------------------------------------
    // 5. Event loop (runs until Ctrl+C or disconnect)
    // -----------------------------------------------------------------------
    let mut transfers = FuturesUnordered::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                if event == ClientEvent::Disconnected {
                    break;
                }
                match negotiator.handle_event(&client, &event).await {
                    Ok(Some(started)) => transfers.push(track(started)),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Negotiation failed"),
                }
            }
            Some((id, direction, result)) = transfers.next(), if !transfers.is_empty() => {
                match result {
                    Ok(report) => info!(
                        transfer = %id,
                        ?direction,
                        peer = %report.peer,
                        bytes = report.bytes,
                        path = %report.path.display(),
                        "Transfer complete"
                    ),
                    Err(e) => warn!(transfer = %id, ?direction, error = %e, "Transfer failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, logging out");
                if let Err(e) = client.logout().await {
                    warn!(error = %e, "Logout failed");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn track(
    started: StartedTransfer,
) -> (Uuid, TransferDirection, Result<TransferReport, TransferError>) {
    info!(
        transfer = %started.transfer_id,
        direction = ?started.direction,
        peer = %started.peer,
        file = %started.file_name,
        "Transfer started"
    );
    let result = started.handle.wait().await;
    (started.transfer_id, started.direction, result)
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::FriendRequest { from, message } => {
            info!(from = %from, message = %message, "Friend request")
        }
        ClientEvent::FriendAdded { friend, .. } => info!(friend = %friend, "Friend added"),
        ClientEvent::FriendRejected { by, message } => {
            info!(by = %by, message = %message, "Friend request rejected")
        }
        ClientEvent::FriendRemoved { message } => info!(message = %message, "Friend removed"),
        ClientEvent::Presence(snapshot) => {
            for (friend, online) in &snapshot.status {
                info!(
                    friend = %friend,
                    online = *online,
                    address = snapshot.address(friend).unwrap_or("-"),
                    "Presence"
                );
            }
        }
        ClientEvent::IncomingOffer { from, offer } => info!(
            from = %from,
            file = %offer.file_name,
            size = offer.file_size,
            "Incoming file offer"
        ),
        ClientEvent::OfferAnswered { from, decision, .. } => {
            info!(from = %from, decision = %decision.as_str(), "Offer answered")
        }
        ClientEvent::ServerError(message) => warn!(message = %message, "Server error"),
        ClientEvent::Disconnected => warn!("Disconnected from server"),
    }
}
