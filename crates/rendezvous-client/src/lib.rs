//! # rendezvous-client
//!
//! Headless client for the rendezvous server: logs in, follows presence and
//! friendship events, and negotiates direct peer-to-peer file transfers.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod negotiator;

pub use client::RendezvousClient;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::ClientEvent;
pub use negotiator::{Negotiator, StartedTransfer, TransferDirection, TransferPolicy};
