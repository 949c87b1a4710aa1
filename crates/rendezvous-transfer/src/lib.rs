//! # rendezvous-transfer
//!
//! Direct peer-to-peer file transport. Once two peers have agreed on a
//! transfer through the rendezvous server, the receiver opens a one-shot
//! listen socket and the sender streams the file to it in fixed-size chunks.
//! The server is never on this data path.

pub mod error;
pub mod job;
pub mod naming;
pub mod transport;

pub use error::TransferError;
pub use job::{TransferJob, TransferMetadata, TransferMetrics, TransferReport};
pub use transport::{InboundTransfer, TransferHandle, TransferService, TransportConfig};
