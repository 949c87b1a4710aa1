use std::time::Duration;

use thiserror::Error;

use rendezvous_shared::{EnvelopeKind, ProtocolError};
use rendezvous_transfer::TransferError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The server answered with an ERROR envelope.
    #[error("Server refused: {0}")]
    Refused(String),

    #[error("Unexpected reply from server: {0}")]
    UnexpectedReply(EnvelopeKind),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Connection to server closed")]
    Disconnected,

    #[error("Invalid file: {0}")]
    InvalidFile(String),
}
