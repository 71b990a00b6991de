//! Follower controller: the receiving side of shard replication.
//!
//! A follower persists the leader's entries to its WAL, acks the highest
//! contiguous durable offset (not the highest applied one), advances its
//! commit watermark to `min(leader_commit, head)`, and applies committed
//! entries to the database in strict offset order. Apply may lag the ack
//! but never reorders.

use std::sync::Arc;

use strata_core::{Epoch, Offset, ShardId, WriteBatchPayload};
use strata_kv::{Database, KvFactory, SnapshotChunk};
use strata_wal::{Entry, Storage, Wal, WalConfig};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ServerError, ServerResult};
use crate::rpc::{
    AppendAck, AppendRequest, DeleteShardRequest, DeleteShardResponse, NewTermRequest,
    NewTermResponse, SnapshotResponse, TruncateRequest, TruncateResponse,
};

struct FollowerState {
    epoch: Epoch,
    wal: Wal,
    /// `None` only transiently while a snapshot install replaces the
    /// database.
    db: Option<Database>,
    commit_offset: Offset,
    closed: bool,
    failed: Option<String>,
}

impl FollowerState {
    fn check_usable(&self, shard: ShardId) -> ServerResult<()> {
        if self.closed {
            return Err(ServerError::AlreadyClosed);
        }
        if let Some(reason) = &self.failed {
            return Err(ServerError::ShardFailed {
                shard,
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    fn db(&self) -> &Database {
        self.db
            .as_ref()
            .expect("database present outside snapshot install")
    }

    fn check_epoch(&self, shard: ShardId, received: Epoch) -> ServerResult<()> {
        if received != self.epoch {
            return Err(ServerError::InvalidEpoch {
                shard,
                current: self.epoch,
                received,
            });
        }
        Ok(())
    }
}

/// Replication state machine for one shard in the follower role.
pub struct FollowerController {
    namespace: String,
    shard: ShardId,
    kv_factory: KvFactory,
    state: Mutex<FollowerState>,
}

impl FollowerController {
    /// Opens the follower controller for a shard, recovering WAL and
    /// database state.
    ///
    /// # Errors
    /// Returns an error if the WAL or database cannot be opened.
    pub async fn new(
        namespace: &str,
        shard: ShardId,
        wal_storage: Arc<dyn Storage>,
        kv_factory: KvFactory,
        config: ControllerConfig,
    ) -> ServerResult<Self> {
        let wal_dir = kv_factory.shard_dir(namespace, shard).join("wal");
        // Appends are synced once per replication frame, before the ack.
        let wal_config = WalConfig::new(wal_dir)
            .with_segment_config(config.segment_config)
            .with_sync_on_append(false);
        let mut wal = Wal::open(wal_storage, shard, wal_config).await?;

        let store = kv_factory.new_kv(namespace, shard).await?;
        let db = Database::new(store);

        let epoch = db.term()?;
        let applied = db.applied_offset()?;

        // After a snapshot install (or trim) the WAL may start past its own
        // head; reposition so appends continue from the applied offset.
        if wal.head_offset() < applied {
            wal.reset(applied).await?;
        }

        info!(
            namespace,
            shard = shard.get(),
            epoch = epoch.get(),
            head = wal.head_offset().get(),
            applied = applied.get(),
            "follower controller started"
        );

        Ok(Self {
            namespace: namespace.to_string(),
            shard,
            kv_factory,
            state: Mutex::new(FollowerState {
                epoch,
                wal,
                db: Some(db),
                commit_offset: applied,
                closed: false,
                failed: None,
            }),
        })
    }

    /// Returns the shard.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// Returns the current epoch.
    pub async fn epoch(&self) -> Epoch {
        self.state.lock().await.epoch
    }

    /// Returns the durable head offset.
    pub async fn head_offset(&self) -> Offset {
        let state = self.state.lock().await;
        let applied = state
            .db
            .as_ref()
            .and_then(|db| db.applied_offset().ok())
            .unwrap_or(Offset::INVALID);
        state.wal.head_offset().max(applied)
    }

    /// Returns the commit watermark.
    pub async fn commit_offset(&self) -> Offset {
        self.state.lock().await.commit_offset
    }

    /// Returns the applied offset.
    pub async fn applied_offset(&self) -> Offset {
        let state = self.state.lock().await;
        state
            .db
            .as_ref()
            .and_then(|db| db.applied_offset().ok())
            .unwrap_or(Offset::INVALID)
    }

    /// Fences this follower at a new epoch.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` for epochs below the current one.
    pub async fn new_term(&self, request: NewTermRequest) -> ServerResult<NewTermResponse> {
        let mut state = self.state.lock().await;
        state.check_usable(self.shard)?;

        if request.epoch < state.epoch {
            return Err(ServerError::InvalidEpoch {
                shard: self.shard,
                current: state.epoch,
                received: request.epoch,
            });
        }

        state.db().update_term(request.epoch)?;
        // The fence must survive restart.
        state.db().flush().await?;
        state.epoch = request.epoch;

        let head = state.wal.last_entry();
        info!(
            shard = self.shard.get(),
            epoch = request.epoch.get(),
            "follower fenced at new term"
        );
        Ok(NewTermResponse {
            epoch: state.epoch,
            head_offset: state.wal.head_offset(),
            head_epoch: head.map_or(Epoch::INITIAL, |entry| entry.epoch()),
        })
    }

    /// Serves one replicate stream from the leader: sends the initial head
    /// ack, then persists, acks, and applies frames until the stream closes
    /// or a protocol violation ends it.
    ///
    /// # Errors
    /// Returns the error that terminated the stream, if any.
    pub async fn accept_replicate_stream(
        &self,
        epoch: Epoch,
        mut requests: mpsc::Receiver<AppendRequest>,
        acks: mpsc::Sender<AppendAck>,
    ) -> ServerResult<()> {
        // The stream is bound to the fenced epoch up front.
        let initial_head = {
            let state = self.state.lock().await;
            state.check_usable(self.shard)?;
            state.check_epoch(self.shard, epoch)?;
            state.wal.head_offset()
        };

        if acks
            .send(AppendAck {
                head_offset: initial_head,
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        while let Some(request) = requests.recv().await {
            let head = match self.handle_append(request).await {
                Ok(head) => head,
                Err(e) => {
                    warn!(
                        shard = self.shard.get(),
                        error = %e,
                        "replicate stream terminated"
                    );
                    return Err(e);
                }
            };
            if acks.send(AppendAck { head_offset: head }).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Handles one append frame: persist (fsynced), advance head and
    /// commit, apply committed entries in order. Returns the new durable
    /// head to ack.
    async fn handle_append(&self, request: AppendRequest) -> ServerResult<Offset> {
        let mut state = self.state.lock().await;
        state.check_usable(self.shard)?;
        state.check_epoch(self.shard, request.epoch)?;

        for entry in &request.entries {
            let expected = state.wal.head_offset().next();
            if entry.offset != expected {
                return Err(ServerError::InvalidOffset {
                    shard: self.shard,
                    expected,
                    received: entry.offset,
                });
            }
            // Entries keep the epoch they were written under; they may only
            // come from the past of the stream's epoch.
            if entry.epoch > request.epoch || !entry.epoch.is_valid() {
                return Err(ServerError::InvalidEpoch {
                    shard: self.shard,
                    current: state.epoch,
                    received: entry.epoch,
                });
            }

            let wal_entry = Entry::new(entry.epoch, entry.offset, entry.payload.clone())?;
            state.wal.append(wal_entry).await?;
        }
        // One fsync covers the whole frame; ack only after it completes.
        state.wal.sync().await?;

        let head = state.wal.head_offset();
        let commit = request.commit_offset.min(head).max(state.commit_offset);
        state.commit_offset = commit;

        if let Err(e) = Self::apply_committed(&mut state, commit) {
            // Apply over committed entries must be total; failure here is
            // fatal for the shard on this node.
            state.failed = Some(e.to_string());
            return Err(ServerError::ShardFailed {
                shard: self.shard,
                reason: e.to_string(),
            });
        }

        debug!(
            shard = self.shard.get(),
            head = head.get(),
            commit = commit.get(),
            entries = request.entries.len(),
            "follower appended"
        );
        Ok(head)
    }

    fn apply_committed(state: &mut FollowerState, commit: Offset) -> ServerResult<()> {
        let db = state
            .db
            .as_ref()
            .expect("database present outside snapshot install");
        let mut applied = db.applied_offset()?;

        while applied < commit {
            let next = applied.next();
            let entry = state.wal.read(next)?;
            let payload = WriteBatchPayload::decode(entry.payload().clone())?;
            db.apply(&payload, next)?;
            applied = next;
        }
        Ok(())
    }

    /// Drops the WAL tail strictly above `request.offset`.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` for stale epochs, or a WAL error.
    pub async fn truncate(&self, request: TruncateRequest) -> ServerResult<TruncateResponse> {
        let mut state = self.state.lock().await;
        state.check_usable(self.shard)?;
        state.check_epoch(self.shard, request.epoch)?;

        let head = state.wal.truncate(request.offset).await?;
        info!(
            shard = self.shard.get(),
            head = head.get(),
            "follower truncated log tail"
        );
        Ok(TruncateResponse { head_offset: head })
    }

    /// Installs a full snapshot, atomically replacing the shard database,
    /// and repositions the WAL after the covered offset.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` for stale epochs, or the chunk/installation
    /// error.
    pub async fn install_snapshot(
        &self,
        epoch: Epoch,
        chunks: Vec<SnapshotChunk>,
    ) -> ServerResult<SnapshotResponse> {
        let mut state = self.state.lock().await;
        state.check_usable(self.shard)?;
        state.check_epoch(self.shard, epoch)?;

        // The open database holds the shard's exclusive lock; release it
        // for the loader and reopen whatever the install leaves behind.
        let db = state
            .db
            .take()
            .expect("database present outside snapshot install");
        db.close().await?;

        let install = async {
            let mut loader = self
                .kv_factory
                .snapshot_loader(&self.namespace, self.shard)
                .await?;
            for chunk in &chunks {
                loader.add_chunk(chunk).await?;
            }
            loader.complete().await?;
            ServerResult::Ok(())
        }
        .await;

        let store = match (install, self.kv_factory.new_kv(&self.namespace, self.shard).await) {
            (Ok(()), Ok(store)) => store,
            (Err(e), Ok(store)) => {
                // Failed install leaves the previous image in place.
                state.db = Some(Database::new(store));
                return Err(e);
            }
            (install_result, Err(reopen)) => {
                let reason = format!("database reopen after snapshot failed: {reopen}");
                state.failed = Some(reason.clone());
                if let Err(e) = install_result {
                    warn!(shard = self.shard.get(), error = %e, "snapshot install failed");
                }
                return Err(ServerError::ShardFailed {
                    shard: self.shard,
                    reason,
                });
            }
        };

        let db = Database::new(store);
        db.update_term(state.epoch)?;
        db.flush().await?;
        let applied = db.applied_offset()?;
        state.db = Some(db);
        state.wal.reset(applied).await?;
        state.commit_offset = applied;

        info!(
            shard = self.shard.get(),
            applied = applied.get(),
            "follower installed snapshot"
        );
        Ok(SnapshotResponse {
            acked_offset: applied,
        })
    }

    /// Deletes the shard's on-disk state and closes the controller.
    ///
    /// # Errors
    /// Returns the first deletion failure; the controller is closed
    /// regardless.
    pub async fn delete_shard(
        &self,
        request: &DeleteShardRequest,
    ) -> ServerResult<DeleteShardResponse> {
        debug_assert_eq!(request.shard, self.shard);

        let mut state = self.state.lock().await;
        state.closed = true;

        let mut errors = Vec::new();
        if let Some(db) = state.db.take() {
            if let Err(e) = db.delete().await {
                errors.push(ServerError::from(e));
            }
        }
        if let Err(e) = state.wal.truncate(Offset::INVALID).await {
            errors.push(ServerError::from(e));
        }
        if let Err(e) = state.wal.close().await {
            errors.push(ServerError::from(e));
        }
        let wal_dir = self
            .kv_factory
            .shard_dir(&self.namespace, self.shard)
            .join("wal");
        if let Err(e) = tokio::fs::remove_dir_all(&wal_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                errors.push(ServerError::rpc(e));
            }
        }

        info!(shard = self.shard.get(), "deleted follower shard state");
        ServerError::aggregate(errors).map(|()| DeleteShardResponse::default())
    }

    /// Closes the controller, flushing WAL and database.
    ///
    /// # Errors
    /// Aggregates close errors; every close is attempted.
    pub async fn close(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut errors = Vec::new();
        if let Err(e) = state.wal.close().await {
            errors.push(ServerError::from(e));
        }
        if let Some(db) = state.db.take() {
            if let Err(e) = db.close().await {
                errors.push(ServerError::from(e));
            }
        }
        info!(shard = self.shard.get(), "closed follower controller");
        ServerError::aggregate(errors)
    }
}
