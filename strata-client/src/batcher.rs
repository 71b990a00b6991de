//! Per-shard write batching.
//!
//! A background task accumulates calls for one shard and flushes when:
//! - the batch reaches the op-count or byte threshold,
//! - the linger deadline (measured from the first queued call) expires, or
//! - the user requests an explicit flush.
//!
//! Batches are submitted to the sink one at a time, which preserves
//! inter-batch order to the shard; per-key submission order inside a batch
//! is the order calls were added.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strata_core::limits::WRITE_BATCH_OPS_MAX;
use strata_core::ShardId;
use strata_server::{ServerResult, WriteRequest, WriteResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::call::WriteCall;
use crate::error::{ClientError, ClientResult};

/// Where flushed batches go; implemented over the node's write RPC.
#[async_trait]
pub trait ShardWriteSink: Send + Sync + 'static {
    /// Submits one batch to a shard's leader and waits for per-op results.
    ///
    /// # Errors
    /// Returns the server-side failure for the whole batch.
    async fn write(&self, shard: ShardId, request: WriteRequest) -> ServerResult<WriteResponse>;
}

/// Configuration for a shard batcher.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// How long the first queued call may wait for company.
    pub linger: Duration,
    /// Maximum ops per batch.
    pub max_ops: usize,
    /// Maximum approximate bytes per batch.
    pub max_bytes: usize,
    /// Deadline applied to each flushed batch, if any.
    pub request_deadline: Option<Duration>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(5),
            max_ops: WRITE_BATCH_OPS_MAX as usize,
            max_bytes: 4 * 1024 * 1024,
            request_deadline: None,
        }
    }
}

enum Message {
    Add(WriteCall),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Batches calls for one shard.
pub struct ShardBatcher {
    shard: ShardId,
    messages: mpsc::Sender<Message>,
}

impl ShardBatcher {
    /// Creates the batcher and starts its background task.
    #[must_use]
    pub fn new(shard: ShardId, sink: Arc<dyn ShardWriteSink>, config: BatcherConfig) -> Self {
        let (messages, rx) = mpsc::channel(1024);
        tokio::spawn(run_batcher(shard, sink, config, rx));
        Self { shard, messages }
    }

    /// Returns the shard this batcher serves.
    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// Queues a call; its callback resolves once the containing batch
    /// commits or fails.
    ///
    /// # Errors
    /// Returns `AlreadyClosed` if the batcher has shut down; the call is
    /// handed back so its callback can be failed by the caller.
    pub async fn add(&self, call: WriteCall) -> ClientResult<()> {
        self.messages
            .send(Message::Add(call))
            .await
            .map_err(|send_error| {
                if let Message::Add(call) = send_error.0 {
                    let (_, callback) = call.into_parts();
                    let _ = callback.send(Err(ClientError::AlreadyClosed));
                }
                ClientError::AlreadyClosed
            })
    }

    /// Flushes the current batch immediately, without waiting for the
    /// linger deadline. Resolves once the batch has been handed to the
    /// sink.
    ///
    /// # Errors
    /// Returns `AlreadyClosed` if the batcher has shut down.
    pub async fn flush(&self) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(Message::Flush(tx))
            .await
            .map_err(|_| ClientError::AlreadyClosed)?;
        rx.await.map_err(|_| ClientError::AlreadyClosed)
    }

    /// Flushes pending calls and stops the background task.
    ///
    /// # Errors
    /// Returns `AlreadyClosed` if the batcher already shut down.
    pub async fn close(&self) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(Message::Shutdown(tx))
            .await
            .map_err(|_| ClientError::AlreadyClosed)?;
        rx.await.map_err(|_| ClientError::AlreadyClosed)
    }
}

async fn run_batcher(
    shard: ShardId,
    sink: Arc<dyn ShardWriteSink>,
    config: BatcherConfig,
    mut messages: mpsc::Receiver<Message>,
) {
    let mut batch: Vec<WriteCall> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut batch_opened: Option<Instant> = None;

    debug!(shard = shard.get(), linger_ms = config.linger.as_millis() as u64, "batcher started");

    loop {
        let deadline = batch_opened.map(|opened| opened + config.linger);

        tokio::select! {
            message = messages.recv() => {
                match message {
                    Some(Message::Add(call)) => {
                        batch_bytes += call.encoded_size();
                        if batch.is_empty() {
                            batch_opened = Some(Instant::now());
                        }
                        batch.push(call);

                        if batch.len() >= config.max_ops || batch_bytes >= config.max_bytes {
                            flush_batch(shard, &sink, &config, &mut batch).await;
                            batch_bytes = 0;
                            batch_opened = None;
                        }
                    }
                    Some(Message::Flush(done)) => {
                        flush_batch(shard, &sink, &config, &mut batch).await;
                        batch_bytes = 0;
                        batch_opened = None;
                        let _ = done.send(());
                    }
                    Some(Message::Shutdown(done)) => {
                        flush_batch(shard, &sink, &config, &mut batch).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        // Handle dropped: flush what is queued and stop.
                        flush_batch(shard, &sink, &config, &mut batch).await;
                        break;
                    }
                }
            }
            () = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                flush_batch(shard, &sink, &config, &mut batch).await;
                batch_bytes = 0;
                batch_opened = None;
            }
        }
    }

    info!(shard = shard.get(), "batcher stopped");
}

/// Submits the accumulated batch and resolves every callback exactly once.
async fn flush_batch(
    shard: ShardId,
    sink: &Arc<dyn ShardWriteSink>,
    config: &BatcherConfig,
    batch: &mut Vec<WriteCall>,
) {
    if batch.is_empty() {
        return;
    }

    let calls = std::mem::take(batch);
    let mut ops = Vec::with_capacity(calls.len());
    let mut callbacks = Vec::with_capacity(calls.len());
    for call in calls {
        let (op, callback) = call.into_parts();
        ops.push(op);
        callbacks.push(callback);
    }

    let request = WriteRequest {
        ops,
        deadline: config.request_deadline.map(|d| Instant::now() + d),
    };

    debug!(shard = shard.get(), ops = callbacks.len(), "flushing batch");

    match sink.write(shard, request).await {
        Ok(WriteResponse { results }) => {
            if results.len() == callbacks.len() {
                for (callback, result) in callbacks.into_iter().zip(results) {
                    let _ = callback.send(Ok(result));
                }
            } else {
                let error = ClientError::MalformedResponse {
                    expected: callbacks.len(),
                    actual: results.len(),
                };
                for callback in callbacks {
                    let _ = callback.send(Err(error.clone()));
                }
            }
        }
        Err(e) => {
            let error = ClientError::request(e);
            for callback in callbacks {
                let _ = callback.send(Err(error.clone()));
            }
        }
    }
}
