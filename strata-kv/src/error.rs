//! KV engine and database error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur in the engine and database layers.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// A second open was attempted on a shard database already open in this
    /// process. The engine handle is exclusive per (namespace, shard).
    #[error("database already open: {path}")]
    AlreadyOpen {
        /// The shard database path.
        path: PathBuf,
    },

    /// The store has been closed.
    #[error("database for shard {shard} is closed")]
    Closed {
        /// The shard whose store was used after close.
        shard: i64,
    },

    /// A tablet file failed its checksum or structural validation.
    #[error("tablet corruption in {path}: {reason}")]
    Corruption {
        /// The corrupt file.
        path: PathBuf,
        /// What was wrong.
        reason: &'static str,
    },

    /// A snapshot chunk arrived out of order or failed validation.
    #[error("invalid snapshot chunk for {file_name}: {reason}")]
    InvalidChunk {
        /// File the chunk belongs to.
        file_name: String,
        /// What was wrong.
        reason: &'static str,
    },

    /// A stored value failed to decode.
    #[error("value decode failed: {0}")]
    ValueDecode(#[from] strata_core::CodecError),

    /// I/O error from the filesystem.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl KvError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true for the not-found result of a lookup.
    #[must_use]
    pub const fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }
}
