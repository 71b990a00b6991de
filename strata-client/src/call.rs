//! User call types.
//!
//! Every call carries a one-shot completion sink resolved exactly once:
//! with the op's result once its batch commits, or with an error if the
//! batch fails or the batcher shuts down first.

use bytes::Bytes;
use strata_core::{DeleteOp, DeleteRangeOp, GetOp, OpResult, PutOp, WriteOp};
use tokio::sync::oneshot;

use crate::error::ClientResult;

/// Completion payload: the per-op result from the applied batch.
pub type CallResult = OpResult;

type Completion = oneshot::Sender<ClientResult<CallResult>>;

/// A pending put.
#[derive(Debug)]
pub struct PutCall {
    /// The key to write.
    pub key: String,
    /// The value payload.
    pub value: Bytes,
    /// Optional expected version; `-1` means the key must not exist.
    pub expected_version_id: Option<i64>,
    /// Owning session for ephemeral records.
    pub session_id: Option<i64>,
    /// Identity of the writing client.
    pub client_identity: Option<String>,
    /// Completion sink.
    pub callback: Completion,
}

/// A pending point delete.
#[derive(Debug)]
pub struct DeleteCall {
    /// The key to remove.
    pub key: String,
    /// Optional expected version.
    pub expected_version_id: Option<i64>,
    /// Completion sink.
    pub callback: Completion,
}

/// A pending range delete.
#[derive(Debug)]
pub struct DeleteRangeCall {
    /// Lower bound, inclusive.
    pub min_key_inclusive: String,
    /// Upper bound, exclusive.
    pub max_key_exclusive: String,
    /// Completion sink.
    pub callback: Completion,
}

/// A pending batched get.
#[derive(Debug)]
pub struct GetCall {
    /// The key to read.
    pub key: String,
    /// Completion sink.
    pub callback: Completion,
}

/// Any pending user call.
#[derive(Debug)]
pub enum WriteCall {
    /// A put.
    Put(PutCall),
    /// A point delete.
    Delete(DeleteCall),
    /// A range delete.
    DeleteRange(DeleteRangeCall),
    /// A batched get.
    Get(GetCall),
}

impl WriteCall {
    /// Splits the call into its wire op and its completion sink.
    #[must_use]
    pub fn into_parts(self) -> (WriteOp, Completion) {
        match self {
            Self::Put(call) => (
                WriteOp::Put(PutOp {
                    key: call.key,
                    value: call.value,
                    expected_version_id: call.expected_version_id,
                    session_id: call.session_id,
                    client_identity: call.client_identity,
                }),
                call.callback,
            ),
            Self::Delete(call) => (
                WriteOp::Delete(DeleteOp {
                    key: call.key,
                    expected_version_id: call.expected_version_id,
                }),
                call.callback,
            ),
            Self::DeleteRange(call) => (
                WriteOp::DeleteRange(DeleteRangeOp {
                    min_key_inclusive: call.min_key_inclusive,
                    max_key_exclusive: call.max_key_exclusive,
                }),
                call.callback,
            ),
            Self::Get(call) => (
                WriteOp::Get(GetOp { key: call.key }),
                call.callback,
            ),
        }
    }

    /// Approximate wire size of the call, for the byte threshold.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Put(call) => call.key.len() + call.value.len() + 32,
            Self::Delete(call) => call.key.len() + 16,
            Self::DeleteRange(call) => {
                call.min_key_inclusive.len() + call.max_key_exclusive.len() + 16
            }
            Self::Get(call) => call.key.len() + 8,
        }
    }
}
