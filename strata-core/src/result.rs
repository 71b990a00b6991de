//! Per-operation results returned for a write batch.

use bytes::Bytes;

use crate::status::OpStatus;
use crate::version::VersionInfo;

/// The outcome of one operation in an applied write batch, in the position
/// the operation occupied in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Outcome of a put.
    Put {
        /// `Ok` or `BadVersion`.
        status: OpStatus,
        /// Version of the written value when the put succeeded.
        version: Option<VersionInfo>,
    },
    /// Outcome of a point delete.
    Delete {
        /// `Ok`, `BadVersion`, or `KeyNotFound`.
        status: OpStatus,
    },
    /// Outcome of a range delete.
    DeleteRange {
        /// Always `Ok` for a well-formed range.
        status: OpStatus,
    },
    /// Outcome of a batched get.
    Get {
        /// `Ok` or `KeyNotFound`.
        status: OpStatus,
        /// The value when found.
        value: Option<Bytes>,
        /// Version of the value when found.
        version: Option<VersionInfo>,
    },
}

impl OpResult {
    /// Returns the status of the operation.
    #[must_use]
    pub const fn status(&self) -> OpStatus {
        match self {
            Self::Put { status, .. }
            | Self::Delete { status }
            | Self::DeleteRange { status }
            | Self::Get { status, .. } => *status,
        }
    }
}
