//! Resume interrupted transfers
//!
//! Tracks, per session, how many chunks of each transfer the other side has
//! acknowledged. When a chunk fails on a recoverable error the transfer is
//! marked interrupted; repeating the same transfer later in the same process
//! continues from the first unacknowledged chunk. State lives in memory only
//! and does not survive a restart.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Client to server
    Upload,
    /// Server to client
    Download,
}

/// Identity of a transfer
///
/// A changed length or chunk length makes earlier acknowledgements
/// meaningless, so both are part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    /// Direction
    pub direction: TransferDirection,
    /// Remote path
    pub remote: String,
    /// Total length in bytes
    pub total_length: u64,
    /// Chunk length used on the wire
    pub chunk_length: u64,
}

impl TransferKey {
    /// Key for an upload
    pub fn upload(remote: impl Into<String>, total_length: u64, chunk_length: u64) -> Self {
        Self {
            direction: TransferDirection::Upload,
            remote: remote.into(),
            total_length,
            chunk_length,
        }
    }

    /// Key for a download
    pub fn download(remote: impl Into<String>, total_length: u64, chunk_length: u64) -> Self {
        Self {
            direction: TransferDirection::Download,
            remote: remote.into(),
            total_length,
            chunk_length,
        }
    }
}

/// Status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer in progress
    InProgress,
    /// Transfer stopped on a recoverable error or cancellation
    Interrupted,
    /// Transfer completed successfully
    Completed,
    /// Transfer failed and cannot be resumed
    Failed,
}

/// State of one transfer
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Number of chunks in the transfer
    pub chunk_count: u64,
    /// Chunks acknowledged by the other side, in order
    pub chunks_acknowledged: u64,
    /// Bytes covered by the acknowledged chunks
    pub bytes_acknowledged: u64,
    /// Current status
    pub status: TransferStatus,
    /// When the transfer was first started
    pub started_at: DateTime<Utc>,
    /// Last acknowledgement or status change
    pub last_checkpoint: DateTime<Utc>,
}

/// Where a (re)started transfer begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Whether earlier progress is being reused
    pub resumed: bool,
    /// First chunk to send or fetch
    pub next_chunk: u64,
    /// Bytes skipped because they were already acknowledged
    pub bytes_skipped: u64,
}

/// In-memory transfer recovery table
#[derive(Debug, Default)]
pub struct TransferRecovery {
    transfers: HashMap<TransferKey, TransferState>,
}

impl TransferRecovery {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or resume a transfer
    ///
    /// Only an interrupted transfer is resumed; anything else starts over.
    pub fn begin(&mut self, key: &TransferKey, chunk_count: u64) -> ResumePoint {
        let now = Utc::now();

        if let Some(state) = self.transfers.get_mut(key) {
            if state.status == TransferStatus::Interrupted
                && state.chunk_count == chunk_count
                && state.chunks_acknowledged < chunk_count
            {
                state.status = TransferStatus::InProgress;
                state.last_checkpoint = now;
                return ResumePoint {
                    resumed: state.chunks_acknowledged > 0,
                    next_chunk: state.chunks_acknowledged,
                    bytes_skipped: state.bytes_acknowledged,
                };
            }
        }

        self.transfers.insert(
            key.clone(),
            TransferState {
                chunk_count,
                chunks_acknowledged: 0,
                bytes_acknowledged: 0,
                status: TransferStatus::InProgress,
                started_at: now,
                last_checkpoint: now,
            },
        );

        ResumePoint {
            resumed: false,
            next_chunk: 0,
            bytes_skipped: 0,
        }
    }

    /// Record that chunk `index` of `length` bytes was acknowledged
    pub fn acknowledge(&mut self, key: &TransferKey, index: u64, length: u64) {
        if let Some(state) = self.transfers.get_mut(key) {
            if index == state.chunks_acknowledged {
                state.chunks_acknowledged += 1;
                state.bytes_acknowledged += length;
                state.last_checkpoint = Utc::now();
            }
        }
    }

    /// Mark a transfer as resumable
    pub fn interrupt(&mut self, key: &TransferKey) {
        self.set_status(key, TransferStatus::Interrupted);
    }

    /// Mark a transfer as failed; it will start over next time
    pub fn fail(&mut self, key: &TransferKey) {
        self.set_status(key, TransferStatus::Failed);
    }

    /// Finish a transfer and drop its state
    pub fn complete(&mut self, key: &TransferKey) {
        self.transfers.remove(key);
    }

    /// Look up a transfer
    pub fn state(&self, key: &TransferKey) -> Option<&TransferState> {
        self.transfers.get(key)
    }

    /// Interrupted transfers
    pub fn interrupted(&self) -> impl Iterator<Item = (&TransferKey, &TransferState)> {
        self.transfers
            .iter()
            .filter(|(_, state)| state.status == TransferStatus::Interrupted)
    }

    /// Drop everything except interrupted transfers
    pub fn cleanup(&mut self) -> usize {
        let before = self.transfers.len();
        self.transfers
            .retain(|_, state| state.status == TransferStatus::Interrupted);
        before - self.transfers.len()
    }

    fn set_status(&mut self, key: &TransferKey, status: TransferStatus) {
        if let Some(state) = self.transfers.get_mut(key) {
            state.status = status;
            state.last_checkpoint = Utc::now();
        }
    }
}
