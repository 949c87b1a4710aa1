use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One negotiated file copy. Lives only for the duration of the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub transfer_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    pub file_size: u64,
    pub peer_address: String,
    pub peer_port: u16,
}

/// Record written at the head of a peer-to-peer transfer stream, followed
/// immediately by exactly `file_size` raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub transfer_id: Uuid,
    pub sender: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Progress counters for one job. Observable while the copy runs, never
/// used for flow control.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    pub bytes_transferred: AtomicU64,
    pub chunks_transferred: AtomicU64,
}

impl TransferMetrics {
    pub(crate) fn record_chunk(&self, len: usize) {
        self.bytes_transferred.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn chunks(&self) -> u64 {
        self.chunks_transferred.load(Ordering::Relaxed)
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: Uuid,
    /// The other side: receiver for outbound jobs, sender for inbound.
    pub peer: String,
    pub file_name: String,
    pub bytes: u64,
    /// Local file that was read (outbound) or written (inbound).
    pub path: PathBuf,
}
