//! Shard-to-batcher mapping.
//!
//! Batchers are created on first use under a check-then-lock pattern: a
//! shared-lock lookup serves the common case, and a miss re-checks after
//! taking the exclusive lock so concurrent first users never create
//! duplicate batchers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use strata_core::ShardId;
use tracing::debug;

use crate::batcher::{BatcherConfig, ShardBatcher, ShardWriteSink};
use crate::error::{ClientError, ClientResult};

/// Creates and caches one [`ShardBatcher`] per shard.
pub struct BatcherManager {
    sink: Arc<dyn ShardWriteSink>,
    config: BatcherConfig,
    batchers: RwLock<Option<HashMap<ShardId, Arc<ShardBatcher>>>>,
}

impl BatcherManager {
    /// Creates a manager that builds batchers over the given sink.
    #[must_use]
    pub fn new(sink: Arc<dyn ShardWriteSink>, config: BatcherConfig) -> Self {
        Self {
            sink,
            config,
            batchers: RwLock::new(Some(HashMap::new())),
        }
    }

    /// Returns the batcher for a shard, creating it on first use.
    ///
    /// # Errors
    /// Returns `AlreadyClosed` after [`close`](Self::close).
    pub fn get(&self, shard: ShardId) -> ClientResult<Arc<ShardBatcher>> {
        {
            let batchers = self.batchers.read().expect("batcher map lock poisoned");
            match batchers.as_ref() {
                None => return Err(ClientError::AlreadyClosed),
                Some(map) => {
                    if let Some(batcher) = map.get(&shard) {
                        return Ok(Arc::clone(batcher));
                    }
                }
            }
        }

        // Miss: take the exclusive lock and re-check before inserting.
        let mut batchers = self.batchers.write().expect("batcher map lock poisoned");
        let map = batchers.as_mut().ok_or(ClientError::AlreadyClosed)?;
        let batcher = map.entry(shard).or_insert_with(|| {
            debug!(shard = shard.get(), "creating shard batcher");
            Arc::new(ShardBatcher::new(
                shard,
                Arc::clone(&self.sink),
                self.config,
            ))
        });
        Ok(Arc::clone(batcher))
    }

    /// Closes every batcher, flushing pending calls; all closes are
    /// attempted even if some fail.
    ///
    /// # Errors
    /// Returns the first close failure.
    pub async fn close(&self) -> ClientResult<()> {
        let map = {
            let mut batchers = self.batchers.write().expect("batcher map lock poisoned");
            batchers.take().ok_or(ClientError::AlreadyClosed)?
        };

        let mut first_error = None;
        for (_, batcher) in map {
            if let Err(e) = batcher.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
