//! The replication RPC surface.
//!
//! Plain request/response structs plus the [`ReplicationRpcProvider`] trait
//! the leader uses to reach its followers. The real transport (gRPC, TCP,
//! in-process) lives outside this crate; tests wire the trait straight to
//! follower controllers.
//!
//! Streams are modeled as paired bounded channels: the leader pushes
//! [`AppendRequest`] frames and pulls [`AppendAck`] frames. The follower
//! side of a stream sends one initial ack carrying its durable head, which
//! is how the leader learns where to resume a cursor.

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::{
    Epoch, Namespace, NodeId, Offset, OpResult, ShardId, VersionInfo, WriteOp,
};
use strata_kv::SnapshotChunk;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ServerError, ServerResult};

/// One log entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Epoch of the leader that produced the entry.
    pub epoch: Epoch,
    /// Log offset.
    pub offset: Offset,
    /// Encoded write-batch payload.
    pub payload: Bytes,
}

/// A client write batch submitted to the leader.
#[derive(Debug)]
pub struct WriteRequest {
    /// Operations in submission order.
    pub ops: Vec<WriteOp>,
    /// Optional deadline; pending ops expire with `Timeout` if commit has
    /// not covered them by then.
    pub deadline: Option<Instant>,
}

/// Per-op results for an applied write batch.
#[derive(Debug)]
pub struct WriteResponse {
    /// Results in the order the ops were submitted.
    pub results: Vec<OpResult>,
}

/// A committed read served by the leader.
#[derive(Debug)]
pub struct ReadRequest {
    /// The key to read.
    pub key: String,
}

/// Response to a [`ReadRequest`].
#[derive(Debug)]
pub struct ReadResponse {
    /// The stored value.
    pub value: Bytes,
    /// Version metadata of the value.
    pub version: VersionInfo,
}

/// Coordinator fence: seals the current epoch before a new leader opens.
#[derive(Debug, Clone, Copy)]
pub struct NewTermRequest {
    /// The shard being fenced.
    pub shard: ShardId,
    /// The new epoch.
    pub epoch: Epoch,
}

/// Response to a fence.
#[derive(Debug, Clone, Copy)]
pub struct NewTermResponse {
    /// The fenced epoch.
    pub epoch: Epoch,
    /// Durable head offset of this node's log for the shard.
    pub head_offset: Offset,
    /// Epoch of the head entry (`Epoch::INITIAL` on an empty log); lets the
    /// coordinator rank members by `(head_epoch, head_offset)`.
    pub head_epoch: Epoch,
}

/// Coordinator instruction to assume shard leadership.
#[derive(Debug, Clone)]
pub struct BecomeLeaderRequest {
    /// The shard.
    pub shard: ShardId,
    /// The epoch granted at fence time.
    pub epoch: Epoch,
    /// Every member of the shard, this node included.
    pub members: Vec<NodeId>,
}

/// Leader-to-follower replication frame.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Epoch of the sending leader.
    pub epoch: Epoch,
    /// Entries contiguous from the follower's head; may be empty when only
    /// the commit watermark advanced.
    pub entries: Vec<LogEntry>,
    /// The leader's commit offset.
    pub commit_offset: Offset,
}

/// Follower acknowledgment: the highest contiguous durable offset.
#[derive(Debug, Clone, Copy)]
pub struct AppendAck {
    /// Highest offset persisted without gaps.
    pub head_offset: Offset,
}

/// Truncate instruction: drop the log tail strictly above `offset`.
#[derive(Debug, Clone, Copy)]
pub struct TruncateRequest {
    /// The shard.
    pub shard: ShardId,
    /// Epoch of the requesting leader.
    pub epoch: Epoch,
    /// Last offset to keep.
    pub offset: Offset,
}

/// Response to a truncate: the resulting head.
#[derive(Debug, Clone, Copy)]
pub struct TruncateResponse {
    /// Head offset after truncation.
    pub head_offset: Offset,
}

/// Follower response after installing a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotResponse {
    /// Offset the installed snapshot covers; replication resumes above it.
    pub acked_offset: Offset,
}

/// Coordinator instruction to remove a shard's state from this node.
#[derive(Debug, Clone)]
pub struct DeleteShardRequest {
    /// Namespace of the shard.
    pub namespace: Namespace,
    /// The shard.
    pub shard: ShardId,
}

/// Response to a shard deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteShardResponse {}

/// The leader half of an open replicate stream.
///
/// Frames are pushed with [`send`](Self::send); acks (including the
/// follower's initial head ack) are pulled with
/// [`next_ack`](Self::next_ack). Dropping the stream closes it.
#[derive(Debug)]
pub struct ReplicateStream {
    requests: mpsc::Sender<AppendRequest>,
    acks: mpsc::Receiver<AppendAck>,
}

impl ReplicateStream {
    /// Builds the leader half from its channel ends.
    #[must_use]
    pub const fn new(
        requests: mpsc::Sender<AppendRequest>,
        acks: mpsc::Receiver<AppendAck>,
    ) -> Self {
        Self { requests, acks }
    }

    /// Sends one replication frame.
    ///
    /// # Errors
    /// Returns an RPC error if the stream is closed.
    pub async fn send(&self, request: AppendRequest) -> ServerResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ServerError::rpc("replicate stream closed"))
    }

    /// Waits for the next ack, or `None` when the follower closed the
    /// stream.
    pub async fn next_ack(&mut self) -> Option<AppendAck> {
        self.acks.recv().await
    }

    /// Returns an already-buffered ack without waiting.
    pub fn try_next_ack(&mut self) -> Option<AppendAck> {
        self.acks.try_recv().ok()
    }
}

/// Opens replication channels from the leader to its followers.
///
/// One provider instance serves every shard on a node; implementations
/// resolve `NodeId` to a connection.
#[async_trait]
pub trait ReplicationRpcProvider: Send + Sync + 'static {
    /// Opens a replicate stream to a follower for one shard and epoch.
    ///
    /// The follower sends an initial [`AppendAck`] with its durable head
    /// before any frames flow.
    ///
    /// # Errors
    /// Returns an error if the follower is unreachable or rejects the
    /// epoch.
    async fn replicate(
        &self,
        follower: &NodeId,
        namespace: &str,
        shard: ShardId,
        epoch: Epoch,
    ) -> ServerResult<ReplicateStream>;

    /// Asks a follower to drop its log tail strictly above `offset`.
    ///
    /// # Errors
    /// Returns an error if the follower is unreachable or rejects the
    /// epoch.
    async fn truncate(
        &self,
        follower: &NodeId,
        namespace: &str,
        request: TruncateRequest,
    ) -> ServerResult<TruncateResponse>;

    /// Transfers a full snapshot to a follower and waits for installation.
    ///
    /// # Errors
    /// Returns an error if the transfer fails or the follower rejects the
    /// epoch.
    async fn send_snapshot(
        &self,
        follower: &NodeId,
        namespace: &str,
        shard: ShardId,
        epoch: Epoch,
        chunks: Vec<SnapshotChunk>,
    ) -> ServerResult<SnapshotResponse>;
}

/// Validates a client write request against the wire limits.
///
/// # Errors
/// Returns `InvalidRequest` naming the violated constraint.
pub fn validate_write(request: &WriteRequest) -> ServerResult<()> {
    use strata_core::limits::{KEY_SIZE_BYTES_MAX, VALUE_SIZE_BYTES_MAX, WRITE_BATCH_OPS_MAX};

    if request.ops.is_empty() {
        return Err(ServerError::InvalidRequest {
            reason: "write batch is empty",
        });
    }
    if request.ops.len() > WRITE_BATCH_OPS_MAX as usize {
        return Err(ServerError::InvalidRequest {
            reason: "write batch has too many ops",
        });
    }

    let check_key = |key: &str| -> ServerResult<()> {
        if key.is_empty() {
            return Err(ServerError::InvalidRequest {
                reason: "empty key",
            });
        }
        if key.len() > KEY_SIZE_BYTES_MAX as usize {
            return Err(ServerError::InvalidRequest {
                reason: "key exceeds size limit",
            });
        }
        if key.starts_with(strata_kv::INTERNAL_KEY_PREFIX) {
            return Err(ServerError::InvalidRequest {
                reason: "key uses reserved prefix",
            });
        }
        Ok(())
    };

    for op in &request.ops {
        match op {
            WriteOp::Put(put) => {
                check_key(&put.key)?;
                if put.value.len() > VALUE_SIZE_BYTES_MAX as usize {
                    return Err(ServerError::InvalidRequest {
                        reason: "value exceeds size limit",
                    });
                }
            }
            WriteOp::Delete(delete) => check_key(&delete.key)?,
            WriteOp::DeleteRange(range) => {
                check_key(&range.min_key_inclusive)?;
                check_key(&range.max_key_exclusive)?;
            }
            WriteOp::Get(get) => check_key(&get.key)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::PutOp;

    fn put_op(key: &str) -> WriteOp {
        WriteOp::Put(PutOp {
            key: key.to_string(),
            value: Bytes::from_static(b"v"),
            expected_version_id: None,
            session_id: None,
            client_identity: None,
        })
    }

    #[test]
    fn test_validate_write_accepts_normal_batch() {
        let request = WriteRequest {
            ops: vec![put_op("/a"), put_op("/b")],
            deadline: None,
        };
        assert!(validate_write(&request).is_ok());
    }

    #[test]
    fn test_validate_write_rejects_empty_batch() {
        let request = WriteRequest {
            ops: vec![],
            deadline: None,
        };
        assert!(matches!(
            validate_write(&request),
            Err(ServerError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_validate_write_rejects_reserved_prefix() {
        let request = WriteRequest {
            ops: vec![put_op("__strata/commit-offset")],
            deadline: None,
        };
        assert!(matches!(
            validate_write(&request),
            Err(ServerError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_replicate_stream_pairing() {
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let mut stream = ReplicateStream::new(req_tx, ack_rx);

        ack_tx
            .send(AppendAck {
                head_offset: Offset::new(3),
            })
            .await
            .unwrap();
        assert_eq!(stream.next_ack().await.unwrap().head_offset, Offset::new(3));

        stream
            .send(AppendRequest {
                epoch: Epoch::new(1),
                entries: vec![],
                commit_offset: Offset::INVALID,
            })
            .await
            .unwrap();
        assert!(req_rx.recv().await.is_some());
    }
}
