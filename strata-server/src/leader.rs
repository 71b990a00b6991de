//! Leader controller: the ordering and commit side of shard replication.
//!
//! All shard state is owned by a single core task; the public
//! [`LeaderController`] handle talks to it over a command channel. The core
//! is the shard's apply task: the only writer to the database, so
//! replication order is preserved without locks inside the engine.
//!
//! Write pipeline:
//!
//! 1. Validate the batch and assign `offset = head + 1`.
//! 2. Append to the WAL; consecutive queued writes share one fsync
//!    (group commit).
//! 3. Publish the new head to the per-follower cursor tasks, which ship
//!    entries down their replicate streams.
//! 4. Acks (the leader's own head included) feed the quorum tracker; when
//!    the majority watermark advances, committed entries are applied in
//!    offset order and per-op callbacks resolve with assigned version ids.
//!
//! Follower cursors that fall below the WAL low-water mark are re-seeded
//! with a database snapshot instead of tail shipping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strata_core::limits::{CONTROLLER_CHANNEL_CAPACITY, NOTIFICATION_BUFFER_BATCHES};
use strata_core::{
    Epoch, NodeId, NotificationBatch, Offset, ShardId, WriteBatchPayload,
};
use strata_kv::{Database, KvFactory};
use strata_wal::{Entry, Storage, Wal, WalConfig};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ServerError, ServerResult};
use crate::rpc::{
    validate_write, AppendRequest, BecomeLeaderRequest, DeleteShardRequest, DeleteShardResponse,
    LogEntry, NewTermRequest, NewTermResponse, ReadRequest, ReadResponse, ReplicationRpcProvider,
    TruncateRequest, WriteRequest, WriteResponse,
};
use crate::quorum::QuorumTracker;

/// Entries shipped per replication frame.
const ENTRIES_PER_FRAME_MAX: usize = 64;

/// Writes coalesced under one fsync.
const WRITES_PER_SYNC_MAX: usize = 128;

/// How often pending-write deadlines are swept.
const DEADLINE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Delay before a broken follower stream is redialed.
const CURSOR_RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Externally visible role state of a leader controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    /// Fenced at an epoch, not yet (or no longer) serving writes.
    Fenced,
    /// Serving writes for the shard.
    Leader,
    /// Closed; all operations fail.
    Closed,
    /// Taken out of service after a fatal shard fault.
    Failed,
}

/// Snapshot of the core state, for the director and tests.
#[derive(Debug, Clone, Copy)]
pub struct LeaderInfo {
    /// Current role state.
    pub status: LeaderStatus,
    /// Current epoch.
    pub epoch: Epoch,
    /// WAL head offset.
    pub head_offset: Offset,
    /// Commit watermark.
    pub commit_offset: Offset,
    /// Oldest offset still retained in the WAL.
    pub low_water_mark: Offset,
}

enum Command {
    Write {
        request: WriteRequest,
        reply: oneshot::Sender<ServerResult<WriteResponse>>,
    },
    Read {
        request: ReadRequest,
        reply: oneshot::Sender<ServerResult<ReadResponse>>,
    },
    NewTerm {
        request: NewTermRequest,
        reply: oneshot::Sender<ServerResult<NewTermResponse>>,
    },
    BecomeLeader {
        request: BecomeLeaderRequest,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    AddFollower {
        node: NodeId,
        epoch: Epoch,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    Subscribe {
        reply: oneshot::Sender<ServerResult<broadcast::Receiver<NotificationBatch>>>,
    },
    Info {
        reply: oneshot::Sender<LeaderInfo>,
    },
    DeleteShard {
        reply: oneshot::Sender<ServerResult<DeleteShardResponse>>,
    },
    Close {
        reply: oneshot::Sender<ServerResult<()>>,
    },
}

enum Event {
    /// A follower durably acked up to an offset.
    Ack { node: NodeId, offset: Offset },
}

/// Head/commit published to cursor tasks; `active` drops to false when the
/// controller steps down.
#[derive(Debug, Clone, Copy)]
struct Progress {
    head: Offset,
    commit: Offset,
    active: bool,
}

struct PendingWrite {
    reply: oneshot::Sender<ServerResult<WriteResponse>>,
    deadline: Option<Instant>,
}

/// Public handle to a shard's leader controller.
pub struct LeaderController {
    shard: ShardId,
    commands: mpsc::Sender<Command>,
}

impl LeaderController {
    /// Opens the leader controller for a shard, recovering WAL and database
    /// state, and starts its core task. The controller starts fenced at the
    /// last persisted epoch.
    ///
    /// # Errors
    /// Returns an error if the WAL or database cannot be opened.
    pub async fn new(
        namespace: &str,
        shard: ShardId,
        node_id: NodeId,
        provider: Arc<dyn ReplicationRpcProvider>,
        wal_storage: Arc<dyn Storage>,
        kv_factory: KvFactory,
        config: ControllerConfig,
    ) -> ServerResult<Self> {
        let wal_dir = kv_factory.shard_dir(namespace, shard).join("wal");
        let wal_config = WalConfig::new(wal_dir)
            .with_segment_config(config.segment_config)
            .with_sync_on_append(false);
        let mut wal = Wal::open(wal_storage, shard, wal_config).await?;

        let store = kv_factory.new_kv(namespace, shard).await?;
        let db = Database::new(store);

        let epoch = db.term()?;
        let applied = db.applied_offset()?;
        if wal.head_offset() < applied {
            wal.reset(applied).await?;
        }
        let head = wal.head_offset();

        let (commands, command_rx) = mpsc::channel(CONTROLLER_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CONTROLLER_CHANNEL_CAPACITY);
        let (progress_tx, _) = watch::channel(Progress {
            head,
            commit: applied,
            active: false,
        });
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER_BATCHES);

        let core = LeaderCore {
            namespace: namespace.to_string(),
            shard,
            node_id,
            provider,
            kv_factory,
            config,
            wal: Arc::new(Mutex::new(wal)),
            db: Arc::new(db),
            status: LeaderStatus::Fenced,
            epoch,
            head_offset: head,
            commit_offset: applied,
            quorum: None,
            cursors: HashMap::new(),
            pending: BTreeMap::new(),
            progress_tx,
            events_tx,
            notifications,
        };

        info!(
            namespace,
            shard = shard.get(),
            epoch = epoch.get(),
            head = head.get(),
            applied = applied.get(),
            "leader controller started"
        );

        tokio::spawn(core.run(command_rx, events_rx));
        Ok(Self { shard, commands })
    }

    /// Returns the shard.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// Submits a client write batch; resolves once the batch commits and
    /// applies, with per-op results carrying assigned version ids.
    ///
    /// # Errors
    /// Returns `NotLeader` when not serving, `Timeout` past the deadline,
    /// or a validation error.
    pub async fn write(&self, request: WriteRequest) -> ServerResult<WriteResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write { request, reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Serves a committed read.
    ///
    /// # Errors
    /// Returns `NotLeader` when not serving, or `KeyNotFound`.
    pub async fn read(&self, request: ReadRequest) -> ServerResult<ReadResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read { request, reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Fences the controller at a new epoch, cancelling in-flight writes.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` for epochs below the current one.
    pub async fn new_term(&self, request: NewTermRequest) -> ServerResult<NewTermResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::NewTerm { request, reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Assumes leadership for the fenced epoch with the given member set.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` if the epoch does not match the fence.
    pub async fn become_leader(&self, request: BecomeLeaderRequest) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BecomeLeader { request, reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Starts (or restarts) replication to a follower.
    ///
    /// # Errors
    /// Returns `InvalidEpoch` or `NotLeader` when not serving.
    pub async fn add_follower(&self, node: NodeId, epoch: Epoch) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddFollower { node, epoch, reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Subscribes to committed-change notifications, in offset order.
    ///
    /// # Errors
    /// Returns `NotLeader` when not serving.
    pub async fn subscribe_notifications(
        &self,
    ) -> ServerResult<broadcast::Receiver<NotificationBatch>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Returns a snapshot of the controller state.
    ///
    /// # Errors
    /// Returns `AlreadyClosed` if the core task is gone.
    pub async fn info(&self) -> ServerResult<LeaderInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Info { reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)
    }

    /// Deletes the shard's on-disk state and closes the controller.
    ///
    /// # Errors
    /// Returns deletion failures; the controller closes regardless.
    pub async fn delete_shard(
        &self,
        request: &DeleteShardRequest,
    ) -> ServerResult<DeleteShardResponse> {
        debug_assert_eq!(request.shard, self.shard);
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeleteShard { reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    /// Steps down and closes the controller, flushing WAL and database.
    ///
    /// # Errors
    /// Aggregates close errors; every close is attempted.
    pub async fn close(&self) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close { reply }).await?;
        rx.await.map_err(|_| ServerError::AlreadyClosed)?
    }

    async fn send(&self, command: Command) -> ServerResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServerError::AlreadyClosed)
    }
}

struct CursorHandle {
    task: JoinHandle<()>,
}

struct LeaderCore {
    namespace: String,
    shard: ShardId,
    node_id: NodeId,
    provider: Arc<dyn ReplicationRpcProvider>,
    kv_factory: KvFactory,
    config: ControllerConfig,
    wal: Arc<Mutex<Wal>>,
    db: Arc<Database>,
    status: LeaderStatus,
    epoch: Epoch,
    head_offset: Offset,
    commit_offset: Offset,
    quorum: Option<QuorumTracker>,
    cursors: HashMap<NodeId, CursorHandle>,
    pending: BTreeMap<i64, PendingWrite>,
    progress_tx: watch::Sender<Progress>,
    events_tx: mpsc::Sender<Event>,
    notifications: broadcast::Sender<NotificationBatch>,
}

impl LeaderCore {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        let mut sweep = tokio::time::interval(DEADLINE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command, &mut commands).await {
                        break;
                    }
                }
                event = events.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                _ = sweep.tick() => {
                    self.expire_pending();
                    self.maybe_trim().await;
                }
            }
        }
    }

    /// Returns false when the controller should stop.
    async fn handle_command(
        &mut self,
        command: Command,
        commands: &mut mpsc::Receiver<Command>,
    ) -> bool {
        let Command::Write { request, reply } = command else {
            return self.handle_control_command(command).await;
        };

        // Coalesce immediately queued writes so one fsync covers all of
        // them; control commands drained along the way run afterwards, in
        // order.
        let mut writes = vec![(request, reply)];
        let mut deferred = Vec::new();
        while writes.len() < WRITES_PER_SYNC_MAX {
            match commands.try_recv() {
                Ok(Command::Write { request, reply }) => writes.push((request, reply)),
                Ok(other) => deferred.push(other),
                Err(_) => break,
            }
        }

        self.handle_write_burst(writes).await;
        for command in deferred {
            if !self.handle_control_command(command).await {
                return false;
            }
        }
        true
    }

    /// Handles every command other than `Write`. Returns false when the
    /// controller should stop.
    async fn handle_control_command(&mut self, command: Command) -> bool {
        match command {
            Command::Write { request, reply } => {
                // Unreachable from the main loop; handle as a burst of one.
                self.handle_write_burst(vec![(request, reply)]).await;
            }
            Command::Read { request, reply } => {
                let _ = reply.send(self.handle_read(&request));
            }
            Command::NewTerm { request, reply } => {
                let _ = reply.send(self.handle_new_term(request).await);
            }
            Command::BecomeLeader { request, reply } => {
                let _ = reply.send(self.handle_become_leader(request).await);
            }
            Command::AddFollower { node, epoch, reply } => {
                let _ = reply.send(self.handle_add_follower(node, epoch));
            }
            Command::Subscribe { reply } => {
                let result = if self.status == LeaderStatus::Leader {
                    Ok(self.notifications.subscribe())
                } else {
                    Err(ServerError::NotLeader { shard: self.shard })
                };
                let _ = reply.send(result);
            }
            Command::Info { reply } => {
                let low_water_mark = { self.wal.lock().await.low_water_mark() };
                let _ = reply.send(LeaderInfo {
                    status: self.status,
                    epoch: self.epoch,
                    head_offset: self.head_offset,
                    commit_offset: self.commit_offset,
                    low_water_mark,
                });
            }
            Command::DeleteShard { reply } => {
                let _ = reply.send(self.handle_delete_shard().await);
                return false;
            }
            Command::Close { reply } => {
                let _ = reply.send(self.handle_close().await);
                return false;
            }
        }
        true
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Ack { node, offset } => {
                if self.status != LeaderStatus::Leader {
                    return;
                }
                if let Some(quorum) = &mut self.quorum {
                    quorum.record_ack(&node, offset);
                }
                self.advance_commit().await;
            }
        }
    }

    /// Appends a burst of writes under one fsync, registers their pending
    /// callbacks, and advances commit with the leader's own ack.
    async fn handle_write_burst(
        &mut self,
        writes: Vec<(WriteRequest, oneshot::Sender<ServerResult<WriteResponse>>)>,
    ) {
        if self.status != LeaderStatus::Leader {
            for (_, reply) in writes {
                let _ = reply.send(Err(ServerError::NotLeader { shard: self.shard }));
            }
            return;
        }

        let timestamp = now_millis();
        let mut appended = Vec::new();
        {
            let mut wal = self.wal.lock().await;
            for (request, reply) in writes {
                if let Err(e) = validate_write(&request) {
                    let _ = reply.send(Err(e));
                    continue;
                }

                let offset = self.head_offset.next();
                let payload = WriteBatchPayload::new(timestamp, request.ops).encode();
                let entry = match Entry::new(self.epoch, offset, payload) {
                    Ok(entry) => entry,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        continue;
                    }
                };
                if let Err(e) = wal.append(entry).await {
                    let reason = format!("wal append failed: {e}");
                    let _ = reply.send(Err(e.into()));
                    drop(wal);
                    self.fail_shard(&reason);
                    return;
                }
                self.head_offset = offset;
                self.pending.insert(
                    offset.get(),
                    PendingWrite {
                        reply,
                        deadline: request.deadline,
                    },
                );
                appended.push(offset);
            }

            if !appended.is_empty() {
                // Group commit: one fsync for the whole burst.
                if let Err(e) = wal.sync().await {
                    drop(wal);
                    self.fail_shard(&format!("wal sync failed: {e}"));
                    return;
                }
            }
        }

        if let Some(last) = appended.last() {
            // The leader itself is one replica of everything up to head.
            if let Some(quorum) = &mut self.quorum {
                quorum.record_ack(&self.node_id, *last);
            }
            self.publish_progress();
            self.advance_commit().await;
        }
    }

    fn handle_read(&self, request: &ReadRequest) -> ServerResult<ReadResponse> {
        if self.status != LeaderStatus::Leader {
            return Err(ServerError::NotLeader { shard: self.shard });
        }
        let result = self.db.get(&request.key)?;
        Ok(ReadResponse {
            value: result.value,
            version: result.version,
        })
    }

    async fn handle_new_term(&mut self, request: NewTermRequest) -> ServerResult<NewTermResponse> {
        if self.status == LeaderStatus::Closed {
            return Err(ServerError::AlreadyClosed);
        }
        if request.epoch < self.epoch {
            return Err(ServerError::InvalidEpoch {
                shard: self.shard,
                current: self.epoch,
                received: request.epoch,
            });
        }

        self.db.update_term(request.epoch)?;
        // The fence must survive restart.
        self.db.flush().await?;
        self.epoch = request.epoch;

        // A fence ends the current term: all in-flight waits cancel.
        self.step_down(&ServerError::NotLeader { shard: self.shard });
        if self.status != LeaderStatus::Failed {
            self.status = LeaderStatus::Fenced;
        }

        let head_epoch = {
            self.wal
                .lock()
                .await
                .last_entry()
                .map_or(Epoch::INITIAL, |entry| entry.epoch())
        };

        info!(
            shard = self.shard.get(),
            epoch = request.epoch.get(),
            head = self.head_offset.get(),
            "leader fenced at new term"
        );
        Ok(NewTermResponse {
            epoch: self.epoch,
            head_offset: self.head_offset,
            head_epoch,
        })
    }

    async fn handle_become_leader(&mut self, request: BecomeLeaderRequest) -> ServerResult<()> {
        if self.status == LeaderStatus::Closed {
            return Err(ServerError::AlreadyClosed);
        }
        if self.status == LeaderStatus::Failed {
            return Err(ServerError::ShardFailed {
                shard: self.shard,
                reason: "shard is out of service".to_string(),
            });
        }
        if request.epoch != self.epoch {
            return Err(ServerError::InvalidEpoch {
                shard: self.shard,
                current: self.epoch,
                received: request.epoch,
            });
        }
        if !request.members.contains(&self.node_id) {
            return Err(ServerError::InvalidRequest {
                reason: "member set does not include this node",
            });
        }

        let mut quorum = QuorumTracker::new(&request.members);
        quorum.record_ack(&self.node_id, self.head_offset);
        self.quorum = Some(quorum);
        self.status = LeaderStatus::Leader;
        self.publish_progress();

        for node in &request.members {
            if *node != self.node_id {
                self.spawn_cursor(node.clone());
            }
        }

        info!(
            shard = self.shard.get(),
            epoch = self.epoch.get(),
            members = request.members.len(),
            "became leader"
        );

        // A single-member shard commits on its own ack.
        self.advance_commit().await;
        Ok(())
    }

    fn handle_add_follower(&mut self, node: NodeId, epoch: Epoch) -> ServerResult<()> {
        if self.status != LeaderStatus::Leader {
            return Err(ServerError::NotLeader { shard: self.shard });
        }
        if epoch != self.epoch {
            return Err(ServerError::InvalidEpoch {
                shard: self.shard,
                current: self.epoch,
                received: epoch,
            });
        }
        if let Some(quorum) = &mut self.quorum {
            quorum.add_member(node.clone());
        }
        if !self.cursors.contains_key(&node) {
            self.spawn_cursor(node);
        }
        Ok(())
    }

    async fn advance_commit(&mut self) {
        let Some(quorum) = &mut self.quorum else {
            return;
        };
        let commit = quorum.advance_commit(self.head_offset);
        if commit <= self.commit_offset {
            return;
        }
        self.commit_offset = commit;
        self.publish_progress();

        if let Err(e) = self.apply_committed().await {
            self.fail_shard(&format!("apply of committed entry failed: {e}"));
        }
    }

    /// Applies entries in strict offset order up to the commit watermark,
    /// resolving each batch's pending callback in submission order.
    async fn apply_committed(&mut self) -> ServerResult<()> {
        let mut applied = self.db.applied_offset()?;
        while applied < self.commit_offset {
            let next = applied.next();
            let payload = {
                let wal = self.wal.lock().await;
                let entry = wal.read(next)?;
                WriteBatchPayload::decode(entry.payload().clone())?
            };
            let outcome = self.db.apply(&payload, next)?;

            if let Some(pending) = self.pending.remove(&next.get()) {
                let response = if pending
                    .deadline
                    .is_some_and(|deadline| deadline <= Instant::now())
                {
                    Err(ServerError::Timeout)
                } else {
                    Ok(WriteResponse {
                        results: outcome.results,
                    })
                };
                let _ = pending.reply.send(response);
            }

            // Subscribers may lag or be absent; commit order is preserved
            // by the broadcast buffer.
            let _ = self.notifications.send(outcome.notifications);
            applied = next;
        }
        Ok(())
    }

    fn expire_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(offset, _)| *offset)
            .collect();
        for offset in expired {
            if let Some(pending) = self.pending.remove(&offset) {
                let _ = pending.reply.send(Err(ServerError::Timeout));
            }
        }
    }

    /// Garbage-collects sealed WAL segments once every member has acked
    /// past them and a flushed database image covers the discarded range.
    async fn maybe_trim(&mut self) {
        if self.status != LeaderStatus::Leader || self.config.wal_trim_threshold_entries == 0 {
            return;
        }
        let Some(quorum) = &self.quorum else { return };
        let Some(min_ack) = quorum.min_ack() else { return };

        let applied = self.db.applied_offset().unwrap_or(Offset::INVALID);
        let candidate = min_ack.min(applied);
        if !candidate.is_valid() {
            return;
        }

        let low_water = { self.wal.lock().await.low_water_mark() };
        // Cast is lossless: offsets are non-negative here.
        #[allow(clippy::cast_sign_loss)]
        let span = candidate.get().saturating_sub(low_water.get()) as u64;
        if span < self.config.wal_trim_threshold_entries {
            return;
        }

        // The flushed tablet is the persisted image covering the discarded
        // range.
        if let Err(e) = self.db.flush().await {
            warn!(shard = self.shard.get(), error = %e, "pre-trim flush failed");
            return;
        }
        let result = { self.wal.lock().await.trim(candidate).await };
        match result {
            Ok(low_water) => debug!(
                shard = self.shard.get(),
                low_water = low_water.get(),
                "trimmed wal"
            ),
            Err(e) => warn!(shard = self.shard.get(), error = %e, "wal trim failed"),
        }
    }

    fn spawn_cursor(&mut self, node: NodeId) {
        let context = CursorContext {
            node: node.clone(),
            namespace: self.namespace.clone(),
            shard: self.shard,
            epoch: self.epoch,
            provider: Arc::clone(&self.provider),
            wal: Arc::clone(&self.wal),
            db: Arc::clone(&self.db),
            progress: self.progress_tx.subscribe(),
            events: self.events_tx.clone(),
        };
        let task = tokio::spawn(context.run());
        self.cursors.insert(node, CursorHandle { task });
    }

    fn publish_progress(&self) {
        let _ = self.progress_tx.send(Progress {
            head: self.head_offset,
            commit: self.commit_offset,
            active: self.status == LeaderStatus::Leader,
        });
    }

    /// Cancels every in-flight wait with `error` and stops replication.
    fn step_down(&mut self, error: &ServerError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(clone_error(error)));
        }
        self.quorum = None;

        let _ = self.progress_tx.send(Progress {
            head: self.head_offset,
            commit: self.commit_offset,
            active: false,
        });
        for (_, cursor) in self.cursors.drain() {
            cursor.task.abort();
        }
    }

    fn fail_shard(&mut self, reason: &str) {
        warn!(shard = self.shard.get(), reason, "shard taken out of service");
        self.step_down(&ServerError::ShardFailed {
            shard: self.shard,
            reason: reason.to_string(),
        });
        self.status = LeaderStatus::Failed;
    }

    async fn handle_delete_shard(&mut self) -> ServerResult<DeleteShardResponse> {
        self.step_down(&ServerError::NotLeader { shard: self.shard });
        self.status = LeaderStatus::Closed;

        let mut errors = Vec::new();
        {
            let mut wal = self.wal.lock().await;
            if let Err(e) = wal.truncate(Offset::INVALID).await {
                errors.push(ServerError::from(e));
            }
            if let Err(e) = wal.close().await {
                errors.push(ServerError::from(e));
            }
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
        if let Err(e) = self.db.delete().await {
            errors.push(ServerError::from(e));
        }

        info!(shard = self.shard.get(), "deleted leader shard state");
        ServerError::aggregate(errors).map(|()| DeleteShardResponse::default())
    }

    async fn handle_close(&mut self) -> ServerResult<()> {
        self.step_down(&ServerError::AlreadyClosed);
        self.status = LeaderStatus::Closed;

        let mut errors = Vec::new();
        {
            let mut wal = self.wal.lock().await;
            if let Err(e) = wal.close().await {
                errors.push(ServerError::from(e));
            }
        }
        if let Err(e) = self.db.close().await {
            errors.push(ServerError::from(e));
        }
        info!(shard = self.shard.get(), "closed leader controller");
        ServerError::aggregate(errors)
    }
}

/// Best-effort clone for fan-out of a cancellation error.
fn clone_error(error: &ServerError) -> ServerError {
    match error {
        ServerError::NotLeader { shard } => ServerError::NotLeader { shard: *shard },
        ServerError::AlreadyClosed => ServerError::AlreadyClosed,
        ServerError::ShardFailed { shard, reason } => ServerError::ShardFailed {
            shard: *shard,
            reason: reason.clone(),
        },
        other => ServerError::Rpc {
            message: other.to_string(),
        },
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Per-follower replication cursor.
///
/// Ships the log tail down a replicate stream, forwards acks to the core,
/// redials broken streams, and escalates to a snapshot transfer when the
/// follower is below the WAL low-water mark. The task ends when the
/// controller steps down (`Progress::active` = false).
struct CursorContext {
    node: NodeId,
    namespace: String,
    shard: ShardId,
    epoch: Epoch,
    provider: Arc<dyn ReplicationRpcProvider>,
    wal: Arc<Mutex<Wal>>,
    db: Arc<Database>,
    progress: watch::Receiver<Progress>,
    events: mpsc::Sender<Event>,
}

impl CursorContext {
    async fn run(mut self) {
        loop {
            if !self.progress.borrow().active {
                return;
            }
            match self.serve_stream().await {
                Ok(()) => return,
                Err(e) => {
                    debug!(
                        shard = self.shard.get(),
                        follower = %self.node,
                        error = %e,
                        "follower stream interrupted; will reconnect"
                    );
                    tokio::time::sleep(CURSOR_RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Runs one stream session; `Ok` means the controller stepped down.
    async fn serve_stream(&mut self) -> ServerResult<()> {
        let mut stream = self
            .provider
            .replicate(&self.node, &self.namespace, self.shard, self.epoch)
            .await?;

        // The follower leads with its durable head.
        let Some(first) = stream.next_ack().await else {
            return Err(ServerError::rpc("stream closed before initial ack"));
        };
        let mut acked = first.head_offset;

        // A follower ahead of this leader's head has uncommitted tail from
        // a previous epoch; cut it before shipping.
        let head = self.progress.borrow().head;
        if acked > head {
            let response = self
                .provider
                .truncate(
                    &self.node,
                    &self.namespace,
                    TruncateRequest {
                        shard: self.shard,
                        epoch: self.epoch,
                        offset: head,
                    },
                )
                .await?;
            acked = response.head_offset;
        }
        self.report_ack(acked).await?;

        let mut sent = acked;
        let mut sent_commit = Offset::INVALID;

        loop {
            let progress = *self.progress.borrow();
            if !progress.active {
                return Ok(());
            }

            // Below the low-water mark the tail is gone; re-seed with a
            // snapshot instead.
            let low_water = { self.wal.lock().await.low_water_mark() };
            if sent.next() < low_water {
                sent = self.send_snapshot().await?;
                self.report_ack(sent).await?;
                continue;
            }

            if progress.head > sent || progress.commit != sent_commit {
                let entries = self.collect_entries(sent).await?;
                let last = entries.last().map(|e| e.offset);
                stream
                    .send(AppendRequest {
                        epoch: self.epoch,
                        entries,
                        commit_offset: progress.commit,
                    })
                    .await?;
                if let Some(last) = last {
                    sent = last;
                }
                sent_commit = progress.commit;

                // Drain acks opportunistically while shipping a backlog.
                while let Some(ack) = stream.try_next_ack() {
                    self.report_ack(ack.head_offset).await?;
                }
                continue;
            }

            tokio::select! {
                changed = self.progress.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                ack = stream.next_ack() => {
                    let Some(ack) = ack else {
                        return Err(ServerError::rpc("follower closed stream"));
                    };
                    self.report_ack(ack.head_offset).await?;
                }
            }
        }
    }

    async fn collect_entries(&self, sent: Offset) -> ServerResult<Vec<LogEntry>> {
        let wal = self.wal.lock().await;
        let reader = wal.read_from(sent.next())?;
        Ok(reader
            .take(ENTRIES_PER_FRAME_MAX)
            .map(|entry| LogEntry {
                epoch: entry.epoch(),
                offset: entry.offset(),
                payload: entry.into_payload(),
            })
            .collect())
    }

    async fn send_snapshot(&self) -> ServerResult<Offset> {
        info!(
            shard = self.shard.get(),
            follower = %self.node,
            "follower below low-water mark; sending snapshot"
        );
        let snapshot = self.db.store().snapshot().await?;
        let chunks = snapshot.chunks().await?;
        let response = self
            .provider
            .send_snapshot(&self.node, &self.namespace, self.shard, self.epoch, chunks)
            .await;
        snapshot.close();
        Ok(response?.acked_offset)
    }

    async fn report_ack(&self, offset: Offset) -> ServerResult<()> {
        self.events
            .send(Event::Ack {
                node: self.node.clone(),
                offset,
            })
            .await
            .map_err(|_| ServerError::AlreadyClosed)
    }
}
