//! WAL error types.

use strata_core::Offset;
use thiserror::Error;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Entry payload exceeds the maximum size.
    #[error("entry too large: {size} bytes exceeds max {max} bytes")]
    EntryTooLarge {
        /// Actual size in bytes.
        size: u32,
        /// Maximum allowed size.
        max: u32,
    },

    /// An appended entry did not carry the expected next offset.
    #[error("non-contiguous append: expected offset {expected}, got {actual}")]
    OffsetGap {
        /// The offset the log expected (head + 1).
        expected: Offset,
        /// The offset the entry carried.
        actual: Offset,
    },

    /// The requested offset is not present in the log.
    #[error("offset {offset} out of bounds (retained range: {first}..={last})")]
    OffsetOutOfBounds {
        /// Requested offset.
        offset: Offset,
        /// Oldest retained offset.
        first: Offset,
        /// Head offset.
        last: Offset,
    },

    /// CRC checksum mismatch indicates corruption.
    #[error("checksum mismatch at file offset {file_offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset within the segment file.
        file_offset: u64,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value computed.
        actual: u32,
    },

    /// Entry or segment header is invalid.
    #[error("invalid header at file offset {file_offset}: {reason}")]
    InvalidHeader {
        /// Byte offset of the header within the file.
        file_offset: u64,
        /// Why the header is invalid.
        reason: &'static str,
    },

    /// Recovery found a record cut short by a crash. Recoverable: the tail
    /// is discarded and the head adjusted.
    #[error("truncated entry at file offset {file_offset}: expected {expected} bytes, found {found} bytes")]
    TruncatedEntry {
        /// Byte offset of the truncated entry.
        file_offset: u64,
        /// Expected entry size.
        expected: u32,
        /// Actual bytes found.
        found: u32,
    },

    /// Segment is full.
    #[error("segment full: {reason}")]
    SegmentFull {
        /// Why the segment is full.
        reason: &'static str,
    },

    /// The log has been closed.
    #[error("wal for shard {shard} is closed")]
    Closed {
        /// The shard whose log was used after close.
        shard: i64,
    },

    /// I/O error from the underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl WalError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidHeader { .. }
        )
    }
}
