//! Strata WAL - per-shard segmented write-ahead log.
//!
//! Each shard owns one log. Entries carry dense offsets starting at 0 and
//! the epoch of the leader that produced them; every record is CRC-framed so
//! torn writes at the tail are detected and discarded on reopen.
//!
//! # File Layout
//!
//! ```text
//! <shard-dir>/wal/
//!   segment-00000001.wal   # Sealed segment
//!   segment-00000002.wal   # Sealed segment
//!   segment-00000003.wal   # Active segment (current writes)
//! ```
//!
//! # Durability
//!
//! With `sync_on_append` enabled every append fsyncs before returning.
//! Otherwise appends are buffered and `sync()` flushes them in one fsync
//! (group commit): the leader batches several pending writes under one
//! sync window before acking any of them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;
mod error;
mod reader;
mod segment;
mod storage;
mod wal;

pub use entry::{Entry, FRAME_PROLOGUE_SIZE};
pub use error::{WalError, WalResult};
pub use reader::{WalReader, WalReverseReader};
pub use segment::{Segment, SegmentConfig, SegmentHeader, SegmentId, SEGMENT_HEADER_SIZE};
pub use storage::{Storage, StorageFile, TokioStorage};
pub use wal::{Wal, WalConfig};

/// WAL configuration limits.
pub mod limits {
    /// Maximum size of a single entry payload in bytes (16 MB).
    pub const ENTRY_PAYLOAD_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum size of a segment in bytes (256 MB).
    pub const SEGMENT_SIZE_BYTES_MAX: u64 = 256 * 1024 * 1024;

    /// Maximum number of entries per segment.
    pub const ENTRIES_PER_SEGMENT_MAX: u64 = 1_000_000;
}
