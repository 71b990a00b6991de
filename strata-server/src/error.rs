//! Server error types.

use strata_core::{Epoch, Offset, ShardId};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by shard controllers and the director.
#[derive(Debug, Error)]
pub enum ServerError {
    /// This node does not hold the leader role for the shard.
    #[error("node is not leader for shard {shard}")]
    NotLeader {
        /// The shard.
        shard: ShardId,
    },

    /// This node does not hold the follower role for the shard.
    #[error("node is not follower for shard {shard}")]
    NotFollower {
        /// The shard.
        shard: ShardId,
    },

    /// The component has been closed.
    #[error("already closed")]
    AlreadyClosed,

    /// A request carried a stale or un-fenced epoch.
    #[error("invalid epoch for shard {shard}: current {current}, received {received}")]
    InvalidEpoch {
        /// The shard.
        shard: ShardId,
        /// The epoch the controller is fenced at.
        current: Epoch,
        /// The epoch the request carried.
        received: Epoch,
    },

    /// Replicated entries did not continue the log contiguously.
    #[error("invalid offset for shard {shard}: expected {expected}, received {received}")]
    InvalidOffset {
        /// The shard.
        shard: ShardId,
        /// The offset the log expected next.
        expected: Offset,
        /// The offset the request carried.
        received: Offset,
    },

    /// A client deadline elapsed before the write committed.
    #[error("request timed out before commit")]
    Timeout,

    /// A request failed structural validation.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong.
        reason: &'static str,
    },

    /// The shard hit a fatal fault and was taken out of service on this
    /// node; other shards keep serving.
    #[error("shard {shard} failed: {reason}")]
    ShardFailed {
        /// The shard.
        shard: ShardId,
        /// Description of the fault.
        reason: String,
    },

    /// The replication stream or provider failed.
    #[error("replication rpc failed: {message}")]
    Rpc {
        /// Error message.
        message: String,
    },

    /// Write-ahead log failure.
    #[error(transparent)]
    Wal(#[from] strata_wal::WalError),

    /// Engine or database failure.
    #[error(transparent)]
    Kv(#[from] strata_kv::KvError),

    /// A log payload failed to decode after passing CRC checks.
    #[error(transparent)]
    Codec(#[from] strata_core::CodecError),

    /// Several errors from a multi-step shutdown; every close was attempted.
    #[error("multiple errors: {0:?}")]
    Multiple(Vec<ServerError>),
}

impl ServerError {
    /// Creates an RPC error from any displayable cause.
    pub fn rpc(err: impl std::fmt::Display) -> Self {
        Self::Rpc {
            message: err.to_string(),
        }
    }

    /// Collapses a list of close errors: empty means success.
    ///
    /// # Errors
    /// Returns the single error, or `Multiple` when more than one occurred.
    pub fn aggregate(mut errors: Vec<Self>) -> ServerResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}
