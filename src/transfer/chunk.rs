//! Chunk planning
//!
//! A transfer is split only when chunking is enabled and the content is
//! strictly longer than one chunk. Every chunk but the last is exactly
//! `chunk_length` bytes.

use crate::error::{FilegateError, Result};

/// One slice of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferChunk {
    /// Length of the whole transfer
    pub total_length: u64,
    /// Negotiated chunk length, 0 when chunking is disabled
    pub chunk_length: u64,
    /// Zero-based position of this chunk
    pub index: u64,
    /// Byte offset of this chunk
    pub offset: u64,
    /// Bytes in this chunk
    pub length: u64,
}

impl TransferChunk {
    /// Whether this is the final chunk
    pub fn is_last(&self) -> bool {
        self.offset + self.length >= self.total_length
    }
}

/// How a transfer of known length is cut into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_length: u64,
    chunk_length: u64,
}

impl ChunkPlan {
    /// Plan a transfer. A `chunk_length` of 0 disables chunking.
    pub fn new(total_length: u64, chunk_length: u64) -> Self {
        Self {
            total_length,
            chunk_length,
        }
    }

    /// Total length
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Whether the transfer is split
    pub fn is_chunked(&self) -> bool {
        self.chunk_length > 0 && self.total_length > self.chunk_length
    }

    /// Chunk length sent on the wire: 0 for single-request transfers
    pub fn wire_chunk_length(&self) -> u64 {
        if self.is_chunked() {
            self.chunk_length
        } else {
            0
        }
    }

    /// Number of requests needed; an empty transfer still takes one
    pub fn chunk_count(&self) -> u64 {
        if self.is_chunked() {
            self.total_length.div_ceil(self.chunk_length)
        } else {
            1
        }
    }

    /// Chunk at `index`
    pub fn chunk(&self, index: u64) -> Result<TransferChunk> {
        if index >= self.chunk_count() {
            return Err(FilegateError::invalid(format!(
                "chunk {} out of range (count {})",
                index,
                self.chunk_count()
            )));
        }

        let (offset, length) = if self.is_chunked() {
            let offset = index * self.chunk_length;
            (offset, self.chunk_length.min(self.total_length - offset))
        } else {
            (0, self.total_length)
        };

        Ok(TransferChunk {
            total_length: self.total_length,
            chunk_length: self.wire_chunk_length(),
            index,
            offset,
            length,
        })
    }

    /// All chunks from `start` on
    pub fn chunks_from(&self, start: u64) -> impl Iterator<Item = TransferChunk> + '_ {
        (start..self.chunk_count()).filter_map(move |i| self.chunk(i).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_25mb_in_10mb_chunks() {
        let plan = ChunkPlan::new(25 * MB, 10 * MB);
        assert!(plan.is_chunked());
        assert_eq!(plan.chunk_count(), 3);

        let chunks: Vec<_> = plan.chunks_from(0).collect();
        assert_eq!(chunks.iter().map(|c| c.length).collect::<Vec<_>>(), vec![10 * MB, 10 * MB, 5 * MB]);
        assert_eq!(chunks.iter().map(|c| c.length).sum::<u64>(), 25 * MB);
        assert!(chunks[2].is_last() && !chunks[1].is_last());
        assert_eq!(chunks[2].offset, 20 * MB);
    }

    #[test]
    fn test_disabled_or_small_transfers_are_single() {
        for plan in [ChunkPlan::new(25 * MB, 0), ChunkPlan::new(10 * MB, 10 * MB), ChunkPlan::new(0, 10 * MB)] {
            assert!(!plan.is_chunked());
            assert_eq!(plan.chunk_count(), 1);
            assert_eq!(plan.wire_chunk_length(), 0);
            let only = plan.chunk(0).unwrap();
            assert_eq!(only.length, plan.total_length());
            assert!(only.is_last());
        }
    }

    #[test]
    fn test_exact_multiple() {
        let plan = ChunkPlan::new(30, 10);
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.chunk(2).unwrap().length, 10);
        assert!(plan.chunk(3).is_err());
    }

    #[test]
    fn test_resume_iteration() {
        let plan = ChunkPlan::new(35, 10);
        let indices: Vec<u64> = plan.chunks_from(2).map(|c| c.index).collect();
        assert_eq!(indices, vec![2, 3]);
    }
}
