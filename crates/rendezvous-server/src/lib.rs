//! # rendezvous-server
//!
//! Rendezvous server for peer-to-peer file exchange between friends.
//!
//! The server never carries file data. It provides:
//! - **Accounts** with username/secret login, persisted as JSON
//! - **Friendship** requests, acceptance, rejection and removal
//! - **Presence** snapshots pushed periodically to every online user
//! - **Transfer negotiation**: offers and answers are relayed between online
//!   friends so that they can connect to each other directly
//! - **Admin API** (axum) for health checks and account management

pub mod account;
pub mod actor;
pub mod api;
pub mod broadcaster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

pub use crate::actor::RegistryHandle;
pub use crate::config::ServerConfig;
pub use crate::error::ServerError;

use crate::actor::spawn_registry;
use crate::broadcaster::spawn_broadcaster;
use crate::dispatcher::ConnectionContext;
use crate::registry::Registry;
use crate::resolver::resolver_from_config;
use crate::store::AccountStore;

/// Background tasks of a started server. Dropping it stops them.
pub struct RunningServer {
    pub rendezvous_addr: SocketAddr,
    pub registry: RegistryHandle,
    pub broadcast_trigger: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Load the account table, then start the registry, the broadcaster and the
/// rendezvous listener.
pub async fn start(config: &ServerConfig) -> anyhow::Result<RunningServer> {
    let store = AccountStore::new(config.accounts_path.clone());
    let accounts = store.load().await?;
    let registry = Registry::new(accounts, config.registration_open);
    let (handle, registry_task) = spawn_registry(registry, store);

    let resolver = resolver_from_config(config);
    let broadcast_trigger = Arc::new(Notify::new());
    let broadcaster_task = spawn_broadcaster(
        handle.clone(),
        resolver.clone(),
        config.broadcast_interval,
        broadcast_trigger.clone(),
    );

    let listener = TcpListener::bind(config.listen_addr).await?;
    let rendezvous_addr = listener.local_addr()?;
    let ctx = Arc::new(ConnectionContext {
        registry: handle.clone(),
        resolver,
    });
    let accept_task = tokio::spawn(dispatcher::serve(listener, ctx));

    info!(addr = %rendezvous_addr, "Rendezvous listener running");

    Ok(RunningServer {
        rendezvous_addr,
        registry: handle,
        broadcast_trigger,
        tasks: vec![accept_task, broadcaster_task, registry_task],
    })
}
