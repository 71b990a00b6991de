//! Multi-node test fixture.
//!
//! A [`TestCluster`] owns a temp data root, one director per node, and the
//! in-process transport connecting them. Nodes can be killed (unregistered
//! and closed) and restarted on the same data directory to exercise
//! recovery and catch-up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_core::{Epoch, NodeId, ShardId};
use strata_kv::{KvFactory, KvFactoryOptions};
use strata_server::{
    BecomeLeaderRequest, ControllerConfig, DirectorContext, LeaderController, NewTermRequest,
    ServerResult, ShardsDirector,
};
use strata_wal::TokioStorage;

use crate::memory_rpc::InProcessReplication;

/// A set of in-process nodes sharing one transport.
pub struct TestCluster {
    root: tempfile::TempDir,
    provider: Arc<InProcessReplication>,
    directors: Mutex<HashMap<NodeId, Arc<ShardsDirector>>>,
    config: ControllerConfig,
}

impl TestCluster {
    /// Starts a cluster with default controller tuning.
    ///
    /// # Panics
    /// Panics if the temp root cannot be created.
    #[must_use]
    pub fn new(nodes: &[&str]) -> Self {
        Self::with_config(nodes, ControllerConfig::default())
    }

    /// Starts a cluster with custom controller tuning.
    ///
    /// # Panics
    /// Panics if the temp root cannot be created.
    #[must_use]
    pub fn with_config(nodes: &[&str], config: ControllerConfig) -> Self {
        let cluster = Self {
            root: tempfile::tempdir().expect("create cluster temp root"),
            provider: Arc::new(InProcessReplication::new()),
            directors: Mutex::new(HashMap::new()),
            config,
        };
        for node in nodes {
            cluster.start_node(node);
        }
        cluster
    }

    /// Returns the transport.
    #[must_use]
    pub fn provider(&self) -> Arc<InProcessReplication> {
        Arc::clone(&self.provider)
    }

    /// Returns a node's data directory.
    #[must_use]
    pub fn data_dir(&self, node: &str) -> std::path::PathBuf {
        self.root.path().join(node)
    }

    /// Returns a node's director.
    ///
    /// # Panics
    /// Panics if the node is not running.
    #[must_use]
    pub fn director(&self, node: &str) -> Arc<ShardsDirector> {
        self.directors
            .lock()
            .expect("director map poisoned")
            .get(&NodeId::new(node))
            .cloned()
            .unwrap_or_else(|| panic!("node {node} is not running"))
    }

    /// Starts (or restarts) a node on its data directory.
    pub fn start_node(&self, node: &str) {
        let node_id = NodeId::new(node);
        let data_dir = self.root.path().join(node);
        let director = Arc::new(ShardsDirector::new(DirectorContext {
            node_id: node_id.clone(),
            wal_storage: Arc::new(TokioStorage::new()),
            kv_factory: KvFactory::new(KvFactoryOptions::new(data_dir)),
            provider: self.provider.clone(),
            config: self.config,
        }));
        self.provider.register(node_id.clone(), Arc::clone(&director));
        self.directors
            .lock()
            .expect("director map poisoned")
            .insert(node_id, director);
    }

    /// Stops a node: unreachable from the transport and all controllers
    /// closed.
    ///
    /// # Errors
    /// Returns controller close errors.
    ///
    /// # Panics
    /// Panics if the node is not running.
    pub async fn kill_node(&self, node: &str) -> ServerResult<()> {
        let node_id = NodeId::new(node);
        self.provider.unregister(&node_id);
        let director = self
            .directors
            .lock()
            .expect("director map poisoned")
            .remove(&node_id)
            .unwrap_or_else(|| panic!("node {node} is not running"));
        director.close().await
    }

    /// Fences every member at `epoch` and makes `leader` the shard leader.
    ///
    /// # Errors
    /// Propagates fence or election failures.
    ///
    /// # Panics
    /// Panics if a named node is not running.
    pub async fn elect(
        &self,
        namespace: &str,
        shard: ShardId,
        epoch: Epoch,
        leader: &str,
        members: &[&str],
    ) -> ServerResult<Arc<LeaderController>> {
        for member in members {
            if member == &leader {
                continue;
            }
            let follower = self
                .director(member)
                .get_or_create_follower(namespace, shard)
                .await?;
            follower.new_term(NewTermRequest { shard, epoch }).await?;
        }

        let controller = self
            .director(leader)
            .get_or_create_leader(namespace, shard)
            .await?;
        controller.new_term(NewTermRequest { shard, epoch }).await?;
        controller
            .become_leader(BecomeLeaderRequest {
                shard,
                epoch,
                members: members.iter().map(|m| NodeId::new(*m)).collect(),
            })
            .await?;
        Ok(controller)
    }
}

/// Polls `condition` until it holds or `timeout` elapses; returns whether
/// it held.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
