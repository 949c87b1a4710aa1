use std::time::Duration;

use thiserror::Error;

use rendezvous_shared::ProtocolError;

/// Errors that abort a single transfer job.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connect to {address}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        address: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Transfer incomplete: received {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Transfer worker pool is shut down")]
    PoolClosed,

    #[error("Transfer task aborted: {0}")]
    Aborted(String),
}
