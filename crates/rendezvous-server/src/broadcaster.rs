//! Periodic presence broadcast.
//!
//! Every interval each online user receives a FRIEND_LIST_UPDATE carrying a
//! full snapshot of their friends: an online flag for each, plus the
//! advertised address of those that are online. Users without friends still
//! get an (empty) snapshot. A failed delivery to one user never affects the
//! others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rendezvous_shared::{Attachment, Envelope, EnvelopeKind, PresenceSnapshot};

use crate::actor::RegistryHandle;
use crate::registry::{try_deliver, PresenceTarget};
use crate::resolver::AddressResolver;

/// Outcome of one broadcast cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Snapshot of `target`'s friends as seen by `target`.
pub fn build_snapshot(
    target: &PresenceTarget,
    resolver: &dyn AddressResolver,
) -> PresenceSnapshot {
    let mut snapshot = PresenceSnapshot::default();
    for friend in &target.friends {
        snapshot.status.insert(friend.username.clone(), friend.online);
        if let (true, Some(addr)) = (friend.online, friend.peer_addr) {
            snapshot
                .addresses
                .insert(friend.username.clone(), resolver.advertised_address(addr));
        }
    }
    snapshot
}

pub fn presence_envelope(target: &PresenceTarget, resolver: &dyn AddressResolver) -> Envelope {
    let snapshot = build_snapshot(target, resolver);
    Envelope::from_server(
        EnvelopeKind::FriendListUpdate,
        target.username.as_str(),
        "Friend list update",
    )
    .with_attachment(Attachment::Presence(snapshot))
}

/// Run a single broadcast cycle.
pub async fn broadcast_once(
    registry: &RegistryHandle,
    resolver: &dyn AddressResolver,
) -> BroadcastStats {
    let targets = match registry.presence_targets().await {
        Ok(targets) => targets,
        Err(e) => {
            warn!(error = %e, "Presence snapshot unavailable");
            return BroadcastStats::default();
        }
    };

    let mut stats = BroadcastStats::default();
    for target in &targets {
        let envelope = presence_envelope(target, resolver);
        match try_deliver(&target.outbox, envelope) {
            Ok(()) => stats.delivered += 1,
            Err(failure) => {
                stats.failed += 1;
                debug!(username = %target.username, ?failure, "Presence update dropped");
            }
        }
    }
    stats
}

/// Spawn the broadcast loop. Notifying `trigger` runs a cycle immediately.
pub fn spawn_broadcaster(
    registry: RegistryHandle,
    resolver: Arc<dyn AddressResolver>,
    period: Duration,
    trigger: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = trigger.notified() => {}
            }
            let stats = broadcast_once(&registry, resolver.as_ref()).await;
            debug!(
                delivered = stats.delivered,
                failed = stats.failed,
                "Presence broadcast complete"
            );
        }
    })
}
