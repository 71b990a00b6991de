//! Per-node shard registry.
//!
//! The director maps each shard to the controller holding its role on this
//! node, one role at a time: a shard is never simultaneously leader and
//! follower. Role flips close the opposite-role controller before the new
//! one is constructed; if construction then fails the shard is left with no
//! controller (role none) and the coordinator retries — the director never
//! silently reopens the prior role.

use std::collections::HashMap;
use std::sync::Arc;

use strata_core::{NodeId, ShardId};
use strata_kv::KvFactory;
use strata_wal::Storage;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::error::{ServerError, ServerResult};
use crate::follower::FollowerController;
use crate::leader::LeaderController;
use crate::rpc::{DeleteShardRequest, DeleteShardResponse, ReplicationRpcProvider};

/// Everything a controller needs from the node hosting it.
#[derive(Clone)]
pub struct DirectorContext {
    /// Identity of this node, as the coordinator addresses it.
    pub node_id: NodeId,
    /// Storage backend for WAL files.
    pub wal_storage: Arc<dyn Storage>,
    /// Factory for shard databases.
    pub kv_factory: KvFactory,
    /// Replication RPC provider for leader controllers.
    pub provider: Arc<dyn ReplicationRpcProvider>,
    /// Controller tuning.
    pub config: ControllerConfig,
}

struct DirectorState {
    leaders: HashMap<ShardId, Arc<LeaderController>>,
    followers: HashMap<ShardId, Arc<FollowerController>>,
    closed: bool,
}

/// Per-node registry mapping shard to role controller.
pub struct ShardsDirector {
    context: DirectorContext,
    state: RwLock<DirectorState>,
}

impl ShardsDirector {
    /// Creates an empty director.
    #[must_use]
    pub fn new(context: DirectorContext) -> Self {
        Self {
            context,
            state: RwLock::new(DirectorState {
                leaders: HashMap::new(),
                followers: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Returns the leader controller for a shard.
    ///
    /// # Errors
    /// `AlreadyClosed` after close, `NotLeader` if this node does not hold
    /// the role.
    pub async fn get_leader(&self, shard: ShardId) -> ServerResult<Arc<LeaderController>> {
        let state = self.state.read().await;
        if state.closed {
            return Err(ServerError::AlreadyClosed);
        }
        state.leaders.get(&shard).map_or_else(
            || {
                debug!(shard = shard.get(), "node is not hosting shard as leader");
                Err(ServerError::NotLeader { shard })
            },
            |leader| Ok(Arc::clone(leader)),
        )
    }

    /// Returns the follower controller for a shard.
    ///
    /// # Errors
    /// `AlreadyClosed` after close, `NotFollower` if this node does not
    /// hold the role.
    pub async fn get_follower(&self, shard: ShardId) -> ServerResult<Arc<FollowerController>> {
        let state = self.state.read().await;
        if state.closed {
            return Err(ServerError::AlreadyClosed);
        }
        state.followers.get(&shard).map_or_else(
            || {
                debug!(shard = shard.get(), "node is not hosting shard as follower");
                Err(ServerError::NotFollower { shard })
            },
            |follower| Ok(Arc::clone(follower)),
        )
    }

    /// Returns the shard's leader controller, flipping the role if the
    /// shard is currently a follower here.
    ///
    /// # Errors
    /// Propagates the old controller's close error or the new controller's
    /// construction error; a construction failure leaves the shard with no
    /// controller.
    pub async fn get_or_create_leader(
        &self,
        namespace: &str,
        shard: ShardId,
    ) -> ServerResult<Arc<LeaderController>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(ServerError::AlreadyClosed);
        }

        if let Some(leader) = state.leaders.get(&shard) {
            return Ok(Arc::clone(leader));
        }

        if let Some(follower) = state.followers.get(&shard) {
            // The opposite role must be fully closed before the flip.
            follower.close().await?;
            state.followers.remove(&shard);
            info!(shard = shard.get(), "closed follower for role flip");
        }

        let leader = Arc::new(
            LeaderController::new(
                namespace,
                shard,
                self.context.node_id.clone(),
                Arc::clone(&self.context.provider),
                Arc::clone(&self.context.wal_storage),
                self.context.kv_factory.clone(),
                self.context.config,
            )
            .await?,
        );
        state.leaders.insert(shard, Arc::clone(&leader));
        Ok(leader)
    }

    /// Returns the shard's follower controller, flipping the role if the
    /// shard is currently a leader here.
    ///
    /// # Errors
    /// Propagates the old controller's close error or the new controller's
    /// construction error; a construction failure leaves the shard with no
    /// controller.
    pub async fn get_or_create_follower(
        &self,
        namespace: &str,
        shard: ShardId,
    ) -> ServerResult<Arc<FollowerController>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(ServerError::AlreadyClosed);
        }

        if let Some(follower) = state.followers.get(&shard) {
            return Ok(Arc::clone(follower));
        }

        if let Some(leader) = state.leaders.get(&shard) {
            leader.close().await?;
            state.leaders.remove(&shard);
            info!(shard = shard.get(), "closed leader for role flip");
        }

        let follower = Arc::new(
            FollowerController::new(
                namespace,
                shard,
                Arc::clone(&self.context.wal_storage),
                self.context.kv_factory.clone(),
                self.context.config,
            )
            .await?,
        );
        state.followers.insert(shard, Arc::clone(&follower));
        Ok(follower)
    }

    /// Deletes the shard's state on this node, whichever role holds it; a
    /// transient follower is constructed just to delete when neither does.
    ///
    /// # Errors
    /// Propagates deletion failures.
    pub async fn delete_shard(
        &self,
        request: &DeleteShardRequest,
    ) -> ServerResult<DeleteShardResponse> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(ServerError::AlreadyClosed);
        }

        if let Some(leader) = state.leaders.get(&request.shard) {
            let response = leader.delete_shard(request).await?;
            state.leaders.remove(&request.shard);
            return Ok(response);
        }

        if let Some(follower) = state.followers.get(&request.shard) {
            let response = follower.delete_shard(request).await?;
            state.followers.remove(&request.shard);
            return Ok(response);
        }

        let follower = FollowerController::new(
            &request.namespace,
            request.shard,
            Arc::clone(&self.context.wal_storage),
            self.context.kv_factory.clone(),
            self.context.config,
        )
        .await?;
        follower.delete_shard(request).await
    }

    /// Closes every controller, attempting all closes and aggregating
    /// their errors.
    ///
    /// # Errors
    /// Returns the aggregated close errors, if any.
    pub async fn close(&self) -> ServerResult<()> {
        let mut state = self.state.write().await;
        state.closed = true;

        let mut errors = Vec::new();
        for (_, leader) in state.leaders.drain() {
            if let Err(e) = leader.close().await {
                errors.push(e);
            }
        }
        for (_, follower) in state.followers.drain() {
            if let Err(e) = follower.close().await {
                errors.push(e);
            }
        }
        info!("shards director closed");
        ServerError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strata_core::Epoch;
    use strata_kv::{KvFactoryOptions, SnapshotChunk};
    use strata_wal::TokioStorage;

    use crate::rpc::{NewTermRequest, ReplicateStream, SnapshotResponse, TruncateRequest, TruncateResponse};

    /// Provider for director tests; leaders here never open streams.
    struct NullProvider;

    #[async_trait]
    impl ReplicationRpcProvider for NullProvider {
        async fn replicate(
            &self,
            _follower: &NodeId,
            _namespace: &str,
            _shard: ShardId,
            _epoch: Epoch,
        ) -> ServerResult<ReplicateStream> {
            Err(ServerError::rpc("no transport in test"))
        }

        async fn truncate(
            &self,
            _follower: &NodeId,
            _namespace: &str,
            _request: TruncateRequest,
        ) -> ServerResult<TruncateResponse> {
            Err(ServerError::rpc("no transport in test"))
        }

        async fn send_snapshot(
            &self,
            _follower: &NodeId,
            _namespace: &str,
            _shard: ShardId,
            _epoch: Epoch,
            _chunks: Vec<SnapshotChunk>,
        ) -> ServerResult<SnapshotResponse> {
            Err(ServerError::rpc("no transport in test"))
        }
    }

    fn director(dir: &std::path::Path) -> ShardsDirector {
        ShardsDirector::new(DirectorContext {
            node_id: NodeId::new("node-1"),
            wal_storage: Arc::new(TokioStorage::new()),
            kv_factory: KvFactory::new(KvFactoryOptions::new(dir)),
            provider: Arc::new(NullProvider),
            config: ControllerConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_lookup_without_role_fails() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());

        assert!(matches!(
            director.get_leader(ShardId::new(1)).await,
            Err(ServerError::NotLeader { .. })
        ));
        assert!(matches!(
            director.get_follower(ShardId::new(1)).await,
            Err(ServerError::NotFollower { .. })
        ));
    }

    #[tokio::test]
    async fn test_role_flip_closes_opposite_role() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());
        let shard = ShardId::new(7);

        let follower = director
            .get_or_create_follower("default", shard)
            .await
            .unwrap();
        assert!(director.get_follower(shard).await.is_ok());

        // Flip to leader: the follower is closed and replaced.
        director.get_or_create_leader("default", shard).await.unwrap();
        assert!(director.get_leader(shard).await.is_ok());
        assert!(matches!(
            director.get_follower(shard).await,
            Err(ServerError::NotFollower { .. })
        ));

        // The old follower controller was closed exactly once; further use
        // fails.
        let result = follower
            .new_term(NewTermRequest {
                shard,
                epoch: Epoch::new(1),
            })
            .await;
        assert!(matches!(result, Err(ServerError::AlreadyClosed)));

        // And back again.
        director
            .get_or_create_follower("default", shard)
            .await
            .unwrap();
        assert!(director.get_follower(shard).await.is_ok());
        assert!(matches!(
            director.get_leader(shard).await,
            Err(ServerError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());
        let shard = ShardId::new(2);

        let first = director.get_or_create_leader("default", shard).await.unwrap();
        let second = director.get_or_create_leader("default", shard).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_delete_shard_without_controller() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());

        // Neither role exists: a transient follower is built just to
        // delete, and the shard data directory is gone afterwards.
        let request = DeleteShardRequest {
            namespace: "default".to_string(),
            shard: ShardId::new(3),
        };
        director.delete_shard(&request).await.unwrap();

        assert!(matches!(
            director.get_leader(ShardId::new(3)).await,
            Err(ServerError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_shard_removes_existing_role() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());
        let shard = ShardId::new(4);

        director.get_or_create_leader("default", shard).await.unwrap();
        let request = DeleteShardRequest {
            namespace: "default".to_string(),
            shard,
        };
        director.delete_shard(&request).await.unwrap();

        assert!(matches!(
            director.get_leader(shard).await,
            Err(ServerError::NotLeader { .. })
        ));

        // The shard can be recreated from scratch.
        assert!(director.get_or_create_leader("default", shard).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_director_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let director = director(dir.path());
        director
            .get_or_create_leader("default", ShardId::new(1))
            .await
            .unwrap();

        director.close().await.unwrap();

        assert!(matches!(
            director.get_leader(ShardId::new(1)).await,
            Err(ServerError::AlreadyClosed)
        ));
        assert!(matches!(
            director.get_or_create_leader("default", ShardId::new(1)).await,
            Err(ServerError::AlreadyClosed)
        ));
        assert!(matches!(
            director.get_or_create_follower("default", ShardId::new(1)).await,
            Err(ServerError::AlreadyClosed)
        ));
    }
}
