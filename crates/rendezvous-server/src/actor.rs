//! Registry actor.
//!
//! One task owns the [`Registry`] and its [`AccountStore`]. Everything else
//! (connections, the broadcaster, the admin API) talks to it through a
//! cloneable [`RegistryHandle`]: each call sends a [`RegistryCommand`] and
//! awaits the reply on a oneshot channel. Successful mutations are persisted
//! before the caller is answered.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use rendezvous_shared::{Credentials, Envelope};

use crate::account::AccountSummary;
use crate::error::ServerError;
use crate::registry::{PresenceTarget, Registry, RegistryStats, Session};
use crate::store::AccountStore;

type Reply<T> = oneshot::Sender<Result<T, ServerError>>;

/// Requests handled by the registry task.
pub enum RegistryCommand {
    Register {
        credentials: Credentials,
        reply: Reply<()>,
    },
    Login {
        credentials: Credentials,
        session: Session,
        advertised: String,
        reply: Reply<()>,
    },
    Logout {
        username: String,
        reply: oneshot::Sender<bool>,
    },
    /// Logout issued by a closing connection.
    EndSession {
        username: String,
        connection_id: u64,
        reply: oneshot::Sender<bool>,
    },
    FriendRequest {
        requester: String,
        target: String,
        reply: Reply<()>,
    },
    AcceptFriend {
        user: String,
        friend: String,
        reply: Reply<()>,
    },
    RejectFriend {
        user: String,
        friend: String,
        reply: Reply<()>,
    },
    RemoveFriend {
        user: String,
        friend: String,
        reply: Reply<()>,
    },
    CanTransfer {
        sender: String,
        receiver: String,
        reply: oneshot::Sender<bool>,
    },
    /// Check-and-forward of a FILE_TRANSFER_REQUEST as one step.
    ForwardTransferRequest {
        sender: String,
        envelope: Envelope,
        reply: Reply<()>,
    },
    Route {
        receiver: String,
        envelope: Envelope,
        reply: Reply<()>,
    },
    DeleteAccount {
        username: String,
        reply: Reply<()>,
    },
    PresenceTargets(oneshot::Sender<Vec<PresenceTarget>>),
    PresenceTarget {
        username: String,
        reply: oneshot::Sender<Option<PresenceTarget>>,
    },
    ListAccounts(oneshot::Sender<Vec<AccountSummary>>),
    Stats(oneshot::Sender<RegistryStats>),
}

/// Spawn the registry task.
pub fn spawn_registry(
    registry: Registry,
    store: AccountStore,
) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<RegistryCommand>(256);
    let task = tokio::spawn(run(registry, store, rx));
    (RegistryHandle { tx }, task)
}

async fn run(
    mut registry: Registry,
    store: AccountStore,
    mut rx: mpsc::Receiver<RegistryCommand>,
) {
    info!(path = %store.path().display(), "Registry started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCommand::Register { credentials, reply } => {
                let result = registry.register(&credentials);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::Login {
                credentials,
                session,
                advertised,
                reply,
            } => {
                let result = registry.login(&credentials, session, advertised);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::Logout { username, reply } => {
                let changed = registry.logout(&username);
                if changed {
                    persist(&store, &registry).await;
                }
                let _ = reply.send(changed);
            }
            RegistryCommand::EndSession {
                username,
                connection_id,
                reply,
            } => {
                let changed = registry.end_session(&username, connection_id);
                if changed {
                    persist(&store, &registry).await;
                }
                let _ = reply.send(changed);
            }
            RegistryCommand::FriendRequest {
                requester,
                target,
                reply,
            } => {
                let _ = reply.send(registry.send_friend_request(&requester, &target));
            }
            RegistryCommand::AcceptFriend { user, friend, reply } => {
                let result = registry.accept_friend_request(&user, &friend);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::RejectFriend { user, friend, reply } => {
                let result = registry.reject_friend_request(&user, &friend);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::RemoveFriend { user, friend, reply } => {
                let result = registry.remove_friend(&user, &friend);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::CanTransfer {
                sender,
                receiver,
                reply,
            } => {
                let _ = reply.send(registry.can_transfer_file(&sender, &receiver));
            }
            RegistryCommand::ForwardTransferRequest {
                sender,
                envelope,
                reply,
            } => {
                let _ = reply.send(registry.forward_transfer_request(&sender, envelope));
            }
            RegistryCommand::Route {
                receiver,
                envelope,
                reply,
            } => {
                let _ = reply.send(registry.route(&receiver, envelope));
            }
            RegistryCommand::DeleteAccount { username, reply } => {
                let result = registry.delete_account(&username);
                persist_if_ok(&store, &registry, &result).await;
                let _ = reply.send(result);
            }
            RegistryCommand::PresenceTargets(reply) => {
                let _ = reply.send(registry.presence_targets());
            }
            RegistryCommand::PresenceTarget { username, reply } => {
                let _ = reply.send(registry.presence_target(&username));
            }
            RegistryCommand::ListAccounts(reply) => {
                let _ = reply.send(registry.summaries());
            }
            RegistryCommand::Stats(reply) => {
                let _ = reply.send(registry.stats());
            }
        }
    }

    info!("Command channel closed, registry stopped");
}

async fn persist_if_ok<T>(
    store: &AccountStore,
    registry: &Registry,
    result: &Result<T, ServerError>,
) {
    if result.is_ok() {
        persist(store, registry).await;
    }
}

/// The in-memory state stays authoritative if a save fails; the next
/// successful save catches the file up.
async fn persist(store: &AccountStore, registry: &Registry) {
    if let Err(e) = store.save(registry.accounts()).await {
        error!(path = %store.path().display(), error = %e, "Failed to persist accounts");
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable client of the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ServerError::RegistryUnavailable)?;
        rx.await.map_err(|_| ServerError::RegistryUnavailable)
    }

    pub async fn register(&self, credentials: Credentials) -> Result<(), ServerError> {
        self.request(|reply| RegistryCommand::Register { credentials, reply })
            .await?
    }

    pub async fn login(
        &self,
        credentials: Credentials,
        session: Session,
        advertised: String,
    ) -> Result<(), ServerError> {
        self.request(|reply| RegistryCommand::Login {
            credentials,
            session,
            advertised,
            reply,
        })
        .await?
    }

    /// Idempotent. Returns whether the user was online.
    pub async fn logout(&self, username: &str) -> Result<bool, ServerError> {
        let username = username.to_string();
        self.request(|reply| RegistryCommand::Logout { username, reply })
            .await
    }

    pub async fn end_session(
        &self,
        username: &str,
        connection_id: u64,
    ) -> Result<bool, ServerError> {
        let username = username.to_string();
        self.request(|reply| RegistryCommand::EndSession {
            username,
            connection_id,
            reply,
        })
        .await
    }

    pub async fn send_friend_request(
        &self,
        requester: &str,
        target: &str,
    ) -> Result<(), ServerError> {
        let (requester, target) = (requester.to_string(), target.to_string());
        self.request(|reply| RegistryCommand::FriendRequest {
            requester,
            target,
            reply,
        })
        .await?
    }

    pub async fn accept_friend_request(&self, user: &str, friend: &str) -> Result<(), ServerError> {
        let (user, friend) = (user.to_string(), friend.to_string());
        self.request(|reply| RegistryCommand::AcceptFriend { user, friend, reply })
            .await?
    }

    pub async fn reject_friend_request(&self, user: &str, friend: &str) -> Result<(), ServerError> {
        let (user, friend) = (user.to_string(), friend.to_string());
        self.request(|reply| RegistryCommand::RejectFriend { user, friend, reply })
            .await?
    }

    pub async fn remove_friend(&self, user: &str, friend: &str) -> Result<(), ServerError> {
        let (user, friend) = (user.to_string(), friend.to_string());
        self.request(|reply| RegistryCommand::RemoveFriend { user, friend, reply })
            .await?
    }

    pub async fn can_transfer_file(
        &self,
        sender: &str,
        receiver: &str,
    ) -> Result<bool, ServerError> {
        let (sender, receiver) = (sender.to_string(), receiver.to_string());
        self.request(|reply| RegistryCommand::CanTransfer {
            sender,
            receiver,
            reply,
        })
        .await
    }

    pub async fn forward_transfer_request(
        &self,
        sender: &str,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        let sender = sender.to_string();
        self.request(|reply| RegistryCommand::ForwardTransferRequest {
            sender,
            envelope,
            reply,
        })
        .await?
    }

    pub async fn route(&self, receiver: &str, envelope: Envelope) -> Result<(), ServerError> {
        let receiver = receiver.to_string();
        self.request(|reply| RegistryCommand::Route {
            receiver,
            envelope,
            reply,
        })
        .await?
    }

    pub async fn delete_account(&self, username: &str) -> Result<(), ServerError> {
        let username = username.to_string();
        self.request(|reply| RegistryCommand::DeleteAccount { username, reply })
            .await?
    }

    pub async fn presence_targets(&self) -> Result<Vec<PresenceTarget>, ServerError> {
        self.request(RegistryCommand::PresenceTargets).await
    }

    pub async fn presence_target(
        &self,
        username: &str,
    ) -> Result<Option<PresenceTarget>, ServerError> {
        let username = username.to_string();
        self.request(|reply| RegistryCommand::PresenceTarget { username, reply })
            .await
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountSummary>, ServerError> {
        self.request(RegistryCommand::ListAccounts).await
    }

    pub async fn stats(&self) -> Result<RegistryStats, ServerError> {
        self.request(RegistryCommand::Stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_session;
    use crate::store::AccountTable;

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("users.json"));
        let (handle, _task) =
            spawn_registry(Registry::new(AccountTable::new(), true), store.clone());

        let alice = Credentials::new("alice", "a");
        let bob = Credentials::new("bob", "b");
        handle.register(alice.clone()).await.unwrap();
        handle.register(bob.clone()).await.unwrap();

        let (session, _rx) = test_session(1);
        handle
            .login(alice.clone(), session, "10.1.1.1".into())
            .await
            .unwrap();
        handle.accept_friend_request("alice", "bob").await.unwrap();

        let saved = store.load().await.unwrap();
        assert!(saved["alice"].is_friend("bob"));
        assert!(saved["bob"].is_friend("alice"));
        assert_eq!(saved["alice"].last_address.as_deref(), Some("10.1.1.1"));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.online_users, 1);
        assert_eq!(stats.total_users, 2);

        assert!(handle.logout("alice").await.unwrap());
        assert!(!handle.logout("alice").await.unwrap());
        assert!(!handle.can_transfer_file("alice", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_mutation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("users.json"));
        let (handle, _task) = spawn_registry(Registry::new(AccountTable::new(), true), store);

        let creds = Credentials::new("alice", "a");
        handle.register(creds.clone()).await.unwrap();
        assert!(matches!(
            handle.register(creds).await,
            Err(ServerError::AlreadyExists(_))
        ));
        assert!(matches!(
            handle.delete_account("ghost").await,
            Err(ServerError::TargetUnknown(_))
        ));
    }
}
