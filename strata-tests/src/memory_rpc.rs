//! In-process replication transport.
//!
//! Routes replicate streams, truncates, and snapshot transfers straight to
//! the follower controllers of registered directors, with no network in
//! between. Unregistering a node makes it unreachable, which is how tests
//! simulate node failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strata_core::{Epoch, NodeId, ShardId};
use strata_kv::SnapshotChunk;
use strata_server::{
    ReplicateStream, ReplicationRpcProvider, ServerError, ServerResult, ShardsDirector,
    SnapshotResponse, TruncateRequest, TruncateResponse,
};
use tokio::sync::mpsc;

/// Capacity of each in-process stream channel.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Transport registry: node id to director.
#[derive(Default)]
pub struct InProcessReplication {
    nodes: Mutex<HashMap<NodeId, Arc<ShardsDirector>>>,
}

impl InProcessReplication {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a node reachable.
    pub fn register(&self, node: NodeId, director: Arc<ShardsDirector>) {
        self.nodes
            .lock()
            .expect("node registry poisoned")
            .insert(node, director);
    }

    /// Makes a node unreachable; streams to it break on next use.
    pub fn unregister(&self, node: &NodeId) {
        self.nodes
            .lock()
            .expect("node registry poisoned")
            .remove(node);
    }

    fn director(&self, node: &NodeId) -> ServerResult<Arc<ShardsDirector>> {
        self.nodes
            .lock()
            .expect("node registry poisoned")
            .get(node)
            .cloned()
            .ok_or_else(|| ServerError::rpc(format!("node {node} unreachable")))
    }
}

#[async_trait]
impl ReplicationRpcProvider for InProcessReplication {
    async fn replicate(
        &self,
        follower: &NodeId,
        namespace: &str,
        shard: ShardId,
        epoch: Epoch,
    ) -> ServerResult<ReplicateStream> {
        let director = self.director(follower)?;
        let controller = director.get_or_create_follower(namespace, shard).await?;

        let (request_tx, request_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // Errors terminate the stream; the leader redials.
            let _ = controller
                .accept_replicate_stream(epoch, request_rx, ack_tx)
                .await;
        });

        Ok(ReplicateStream::new(request_tx, ack_rx))
    }

    async fn truncate(
        &self,
        follower: &NodeId,
        namespace: &str,
        request: TruncateRequest,
    ) -> ServerResult<TruncateResponse> {
        let director = self.director(follower)?;
        let controller = director
            .get_or_create_follower(namespace, request.shard)
            .await?;
        controller.truncate(request).await
    }

    async fn send_snapshot(
        &self,
        follower: &NodeId,
        namespace: &str,
        shard: ShardId,
        epoch: Epoch,
        chunks: Vec<SnapshotChunk>,
    ) -> ServerResult<SnapshotResponse> {
        let director = self.director(follower)?;
        let controller = director.get_or_create_follower(namespace, shard).await?;
        controller.install_snapshot(epoch, chunks).await
    }
}
