//! Account registry and live session table.
//!
//! `Registry` is plain synchronous state. It is owned by the registry actor
//! (see [`crate::actor`]), which serializes every mutation and persists the
//! account table afterwards. Keeping the core synchronous lets the friendship
//! and presence rules be tested without a runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use rendezvous_shared::constants::SERVER_NAME;
use rendezvous_shared::{Credentials, Envelope, EnvelopeKind};

use crate::account::{Account, AccountSummary};
use crate::error::ServerError;
use crate::store::AccountTable;

/// Envelopes a connection may have queued before deliveries to it fail.
pub const OUTBOX_CAPACITY: usize = 256;

/// Outbound queue of one connection. Drained by the connection's writer task.
pub type Outbox = mpsc::Sender<Envelope>;

pub fn outbox_channel() -> (Outbox, mpsc::Receiver<Envelope>) {
    mpsc::channel(OUTBOX_CAPACITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The peer stopped reading and its queue is full.
    Full,
    /// The writer task is gone.
    Closed,
}

/// Queue an envelope without waiting.
pub fn try_deliver(outbox: &Outbox, envelope: Envelope) -> Result<(), DeliveryFailure> {
    match outbox.try_send(envelope) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(envelope)) => {
            warn!(
                kind = %envelope.kind(),
                receiver = %envelope.receiver(),
                "Outbox full, envelope dropped"
            );
            Err(DeliveryFailure::Full)
        }
        Err(TrySendError::Closed(_)) => Err(DeliveryFailure::Closed),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A live authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub outbox: Outbox,
    /// Signalled when the registry wants the connection closed.
    pub terminate: Arc<Notify>,
}

impl Session {
    pub fn new(connection_id: u64, peer_addr: SocketAddr, outbox: Outbox) -> Self {
        Self {
            connection_id,
            peer_addr,
            outbox,
            terminate: Arc::new(Notify::new()),
        }
    }

    /// Queue an envelope. Returns false if the connection is gone or not
    /// keeping up.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        try_deliver(&self.outbox, envelope).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Presence views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FriendPresence {
    pub username: String,
    pub online: bool,
    pub peer_addr: Option<SocketAddr>,
}

/// One online user together with the state of each of their friends.
#[derive(Debug, Clone)]
pub struct PresenceTarget {
    pub username: String,
    pub outbox: Outbox,
    pub friends: Vec<FriendPresence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub online_users: usize,
    pub total_users: usize,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    accounts: AccountTable,
    sessions: HashMap<String, Session>,
    registration_open: bool,
}

impl Registry {
    /// Build a registry from a loaded table. Nobody is online after a load.
    pub fn new(mut accounts: AccountTable, registration_open: bool) -> Self {
        for account in accounts.values_mut() {
            account.online = false;
        }
        Self {
            accounts,
            sessions: HashMap::new(),
            registration_open,
        }
    }

    pub fn accounts(&self) -> &AccountTable {
        &self.accounts
    }

    pub fn account(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    pub fn session(&self, username: &str) -> Option<&Session> {
        self.sessions.get(username)
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            online_users: self.sessions.len(),
            total_users: self.accounts.len(),
        }
    }

    pub fn summaries(&self) -> Vec<AccountSummary> {
        self.accounts.values().map(Account::summary).collect()
    }

    // -- Accounts -----------------------------------------------------------

    pub fn register(&mut self, credentials: &Credentials) -> Result<(), ServerError> {
        if !self.registration_open {
            return Err(ServerError::RegistrationClosed);
        }
        if credentials.username == SERVER_NAME {
            return Err(ServerError::MalformedEnvelope(format!(
                "username {} is reserved",
                SERVER_NAME
            )));
        }
        if self.accounts.contains_key(&credentials.username) {
            return Err(ServerError::AlreadyExists(credentials.username.clone()));
        }

        self.accounts.insert(
            credentials.username.clone(),
            Account::new(&credentials.username, &credentials.secret),
        );
        info!(username = %credentials.username, "Account registered");
        Ok(())
    }

    /// Authenticate and bind `session` to the account. `advertised` is the
    /// address recorded for presence broadcasts.
    pub fn login(
        &mut self,
        credentials: &Credentials,
        session: Session,
        advertised: String,
    ) -> Result<(), ServerError> {
        let account = self
            .accounts
            .get_mut(&credentials.username)
            .ok_or(ServerError::InvalidCredentials)?;

        let matches: bool = account
            .secret
            .as_bytes()
            .ct_eq(credentials.secret.as_bytes())
            .into();
        if !matches {
            return Err(ServerError::InvalidCredentials);
        }

        if self.sessions.contains_key(&credentials.username) {
            return Err(ServerError::AlreadyOnline(credentials.username.clone()));
        }

        account.online = true;
        account.last_address = Some(advertised);
        account.last_login = Some(Utc::now());
        self.sessions.insert(credentials.username.clone(), session);

        info!(username = %credentials.username, "User logged in");
        Ok(())
    }

    /// Drop the user's session if any. Returns whether anything changed.
    pub fn logout(&mut self, username: &str) -> bool {
        let had_session = self.sessions.remove(username).is_some();
        let was_online = match self.accounts.get_mut(username) {
            Some(account) => std::mem::replace(&mut account.online, false),
            None => false,
        };
        if had_session || was_online {
            info!(username = %username, "User logged out");
        }
        had_session || was_online
    }

    /// Logout performed by a closing connection. Only removes the session if
    /// it still belongs to that connection.
    pub fn end_session(&mut self, username: &str, connection_id: u64) -> bool {
        match self.sessions.get(username) {
            Some(session) if session.connection_id == connection_id => self.logout(username),
            _ => false,
        }
    }

    /// Remove an account, notify its online friends and disconnect it.
    pub fn delete_account(&mut self, username: &str) -> Result<(), ServerError> {
        let account = self
            .accounts
            .remove(username)
            .ok_or_else(|| ServerError::TargetUnknown(username.to_string()))?;

        for friend in &account.friends {
            if let Some(other) = self.accounts.get_mut(friend) {
                other.friends.remove(username);
            }
            self.notify(
                friend,
                Envelope::from_server(
                    EnvelopeKind::FriendRemove,
                    friend.as_str(),
                    format!(
                        "{} has been removed from the system and is no longer your friend",
                        username
                    ),
                ),
            );
        }

        if let Some(session) = self.sessions.remove(username) {
            session.deliver(Envelope::error(username, "Your account has been removed"));
            session.terminate.notify_one();
        }

        info!(username = %username, friends = account.friends.len(), "Account deleted");
        Ok(())
    }

    // -- Friendship ---------------------------------------------------------

    /// Deliver a FRIEND_REQUEST to an online target. No state changes.
    pub fn send_friend_request(&self, requester: &str, target: &str) -> Result<(), ServerError> {
        if requester == target {
            return Err(ServerError::MalformedEnvelope(
                "cannot send a friend request to yourself".to_string(),
            ));
        }
        if !self.accounts.contains_key(target) {
            return Err(ServerError::TargetUnknown(target.to_string()));
        }
        let envelope = Envelope::new(
            EnvelopeKind::FriendRequest,
            requester,
            target,
            format!("{} wants to be your friend", requester),
        );
        self.route(target, envelope)?;
        debug!(from = %requester, to = %target, "Friend request delivered");
        Ok(())
    }

    /// `user` accepts the pending request from `friend`.
    pub fn accept_friend_request(&mut self, user: &str, friend: &str) -> Result<(), ServerError> {
        self.check_parties(user, friend)?;
        self.link(user, friend);

        self.notify(
            user,
            Envelope::new(
                EnvelopeKind::FriendAccept,
                friend,
                user,
                format!("{} is now your friend", friend),
            ),
        );
        self.notify(
            friend,
            Envelope::new(
                EnvelopeKind::FriendAccept,
                user,
                friend,
                format!("{} accepted your friend request", user),
            ),
        );
        info!(user = %user, friend = %friend, "Friendship created");
        Ok(())
    }

    /// `user` rejects the request from `friend`. Any existing edge is dropped.
    pub fn reject_friend_request(&mut self, user: &str, friend: &str) -> Result<(), ServerError> {
        self.check_parties(user, friend)?;
        self.unlink(user, friend);

        self.notify(
            friend,
            Envelope::new(
                EnvelopeKind::FriendReject,
                user,
                friend,
                format!("{} rejected your friend request", user),
            ),
        );
        self.notify(
            user,
            Envelope::new(
                EnvelopeKind::FriendReject,
                friend,
                user,
                format!("You rejected the friend request from {}", friend),
            ),
        );
        debug!(user = %user, friend = %friend, "Friend request rejected");
        Ok(())
    }

    pub fn remove_friend(&mut self, user: &str, friend: &str) -> Result<(), ServerError> {
        self.check_parties(user, friend)?;
        self.unlink(user, friend);

        for (receiver, other) in [(user, friend), (friend, user)] {
            self.notify(
                receiver,
                Envelope::from_server(
                    EnvelopeKind::FriendRemove,
                    receiver,
                    format!("You are no longer friends with {}", other),
                ),
            );
        }
        info!(user = %user, friend = %friend, "Friendship removed");
        Ok(())
    }

    fn check_parties(&self, user: &str, friend: &str) -> Result<(), ServerError> {
        if user == friend {
            return Err(ServerError::UnknownParty(friend.to_string()));
        }
        for name in [user, friend] {
            if !self.accounts.contains_key(name) {
                return Err(ServerError::UnknownParty(name.to_string()));
            }
        }
        Ok(())
    }

    fn link(&mut self, a: &str, b: &str) {
        if let Some(account) = self.accounts.get_mut(a) {
            account.friends.insert(b.to_string());
        }
        if let Some(account) = self.accounts.get_mut(b) {
            account.friends.insert(a.to_string());
        }
    }

    fn unlink(&mut self, a: &str, b: &str) {
        if let Some(account) = self.accounts.get_mut(a) {
            account.friends.remove(b);
        }
        if let Some(account) = self.accounts.get_mut(b) {
            account.friends.remove(a);
        }
    }

    // -- Routing ------------------------------------------------------------

    /// True when both users are online and mutual friends.
    pub fn can_transfer_file(&self, sender: &str, receiver: &str) -> bool {
        let (Some(a), Some(b)) = (self.accounts.get(sender), self.accounts.get(receiver)) else {
            return false;
        };
        self.is_online(sender)
            && self.is_online(receiver)
            && a.is_friend(receiver)
            && b.is_friend(sender)
    }

    /// Forward a FILE_TRANSFER_REQUEST if the pair may transfer.
    pub fn forward_transfer_request(
        &self,
        sender: &str,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        if !self.can_transfer_file(sender, envelope.receiver()) {
            return Err(ServerError::NotFriendsOrOffline);
        }
        let receiver = envelope.receiver().to_string();
        self.route(&receiver, envelope)
    }

    /// Deliver an envelope to an online user.
    pub fn route(&self, receiver: &str, envelope: Envelope) -> Result<(), ServerError> {
        if !self.accounts.contains_key(receiver) {
            return Err(ServerError::TargetUnknown(receiver.to_string()));
        }
        let Some(session) = self.sessions.get(receiver) else {
            return Err(ServerError::TargetOffline(receiver.to_string()));
        };
        try_deliver(&session.outbox, envelope).map_err(|failure| match failure {
            DeliveryFailure::Full => ServerError::Congested(receiver.to_string()),
            DeliveryFailure::Closed => ServerError::TargetOffline(receiver.to_string()),
        })
    }

    fn notify(&self, username: &str, envelope: Envelope) {
        match self.sessions.get(username) {
            Some(session) => {
                if !session.deliver(envelope) {
                    debug!(username = %username, "Notification dropped, connection closing");
                }
            }
            None => debug!(
                username = %username,
                kind = %envelope.kind(),
                "User offline, notification skipped"
            ),
        }
    }

    // -- Presence -----------------------------------------------------------

    pub fn presence_targets(&self) -> Vec<PresenceTarget> {
        self.sessions
            .keys()
            .filter_map(|username| self.presence_target(username))
            .collect()
    }

    pub fn presence_target(&self, username: &str) -> Option<PresenceTarget> {
        let session = self.sessions.get(username)?;
        let account = self.accounts.get(username)?;

        let friends = account
            .friends
            .iter()
            .map(|friend| {
                let peer = self.sessions.get(friend);
                FriendPresence {
                    username: friend.clone(),
                    online: peer.is_some(),
                    peer_addr: peer.map(|s| s.peer_addr),
                }
            })
            .collect();

        Some(PresenceTarget {
            username: username.to_string(),
            outbox: session.outbox.clone(),
            friends,
        })
    }
}
