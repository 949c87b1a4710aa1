use thiserror::Error;

/// Errors raised while reading, writing or interpreting wire records.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// `true` when the stream can no longer be trusted to be in sync:
    /// either the transport failed or a length prefix was out of range.
    /// A record that was fully read but did not decode is not fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::FrameTooLarge { .. }
        )
    }
}
