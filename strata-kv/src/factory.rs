//! Shard database factory.
//!
//! The factory owns the data directory layout and the exclusive-open
//! registry: at most one live [`KvStore`] (or snapshot loader) per
//! (namespace, shard) in a process. Opening loads the newest tablet
//! generation.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data>/<namespace>/shard-<id>/db/          tablet files
//! <data>/<namespace>/shard-<id>/db.loading/  snapshot loader staging
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use strata_core::ShardId;
use tracing::info;

use crate::error::{KvError, KvResult};
use crate::snapshot::SnapshotLoader;
use crate::store::{KvState, KvStore, StoreInner};
use crate::tablet;

/// Options for a [`KvFactory`].
#[derive(Debug, Clone)]
pub struct KvFactoryOptions {
    /// Root directory for all shard databases.
    pub data_dir: PathBuf,
}

impl KvFactoryOptions {
    /// Creates options rooted at the given data directory.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

/// Creates and tracks shard databases.
#[derive(Clone)]
pub struct KvFactory {
    options: KvFactoryOptions,
    open_shards: Arc<Mutex<HashSet<String>>>,
}

impl KvFactory {
    /// Creates a new factory.
    #[must_use]
    pub fn new(options: KvFactoryOptions) -> Self {
        Self {
            options,
            open_shards: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns the directory of one shard (WAL and database live under it).
    #[must_use]
    pub fn shard_dir(&self, namespace: &str, shard: ShardId) -> PathBuf {
        self.options
            .data_dir
            .join(namespace)
            .join(format!("shard-{}", shard.get()))
    }

    /// Returns the database directory of one shard.
    #[must_use]
    pub fn db_dir(&self, namespace: &str, shard: ShardId) -> PathBuf {
        self.shard_dir(namespace, shard).join("db")
    }

    /// Opens (creating if needed) the database of a shard.
    ///
    /// # Errors
    /// Returns `AlreadyOpen` if the shard database is already open in this
    /// process, or an I/O/corruption error from loading.
    pub async fn new_kv(&self, namespace: &str, shard: ShardId) -> KvResult<KvStore> {
        let key = registry_key(namespace, shard);
        self.register(&key, namespace, shard)?;

        match self.load(namespace, shard).await {
            Ok(store) => Ok(store),
            Err(e) => {
                // Failed open leaves the shard closed, not leaked.
                self.deregister(&key);
                Err(e)
            }
        }
    }

    /// Starts a snapshot loader that will atomically replace the shard
    /// database on `complete`.
    ///
    /// The loader holds the shard's exclusive open: the database must be
    /// closed before loading and is reopened with `new_kv` afterward.
    ///
    /// # Errors
    /// Returns `AlreadyOpen` if the shard database is open, or an I/O error
    /// preparing the staging directory.
    pub async fn snapshot_loader(
        &self,
        namespace: &str,
        shard: ShardId,
    ) -> KvResult<SnapshotLoader> {
        let key = registry_key(namespace, shard);
        self.register(&key, namespace, shard)?;

        let shard_dir = self.shard_dir(namespace, shard);
        let result = SnapshotLoader::create(
            &shard_dir,
            Arc::clone(&self.open_shards),
            key.clone(),
        )
        .await;
        if result.is_err() {
            self.deregister(&key);
        }
        result
    }

    async fn load(&self, namespace: &str, shard: ShardId) -> KvResult<KvStore> {
        let db_dir = self.db_dir(namespace, shard);
        tokio::fs::create_dir_all(&db_dir)
            .await
            .map_err(|e| KvError::io("create_db_dir", e))?;

        // Find the newest tablet generation.
        let mut newest: Option<(u64, PathBuf)> = None;
        let mut dir = tokio::fs::read_dir(&db_dir)
            .await
            .map_err(|e| KvError::io("read_dir", e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| KvError::io("read_dir_entry", e))?
        {
            let path = entry.path();
            if let Some(generation) = tablet::tablet_generation(&path) {
                if newest.as_ref().map_or(true, |(g, _)| generation > *g) {
                    newest = Some((generation, path));
                }
            }
        }

        let (map, next_generation) = match &newest {
            Some((generation, path)) => (tablet::read_tablet(path).await?, *generation),
            None => (BTreeMap::new(), 0),
        };

        info!(
            namespace,
            shard = shard.get(),
            keys = map.len(),
            generation = next_generation,
            "opened shard database"
        );

        let inner = StoreInner {
            namespace: namespace.to_string(),
            shard,
            db_dir,
            state: RwLock::new(KvState {
                map,
                next_tablet_generation: next_generation,
                closed: false,
            }),
            registry: Arc::clone(&self.open_shards),
            registry_key: registry_key(namespace, shard),
        };
        Ok(KvStore::from_inner(Arc::new(inner)))
    }

    fn register(&self, key: &str, namespace: &str, shard: ShardId) -> KvResult<()> {
        let mut open = self.open_shards.lock().expect("registry lock poisoned");
        if !open.insert(key.to_string()) {
            return Err(KvError::AlreadyOpen {
                path: self.db_dir(namespace, shard),
            });
        }
        Ok(())
    }

    fn deregister(&self, key: &str) {
        let mut open = self.open_shards.lock().expect("registry lock poisoned");
        open.remove(key);
    }
}

fn registry_key(namespace: &str, shard: ShardId) -> String {
    format!("{namespace}/{}", shard.get())
}

/// Returns the staging directory used by the snapshot loader for a shard.
pub(crate) fn loading_dir(shard_dir: &Path) -> PathBuf {
    shard_dir.join("db.loading")
}

/// Returns the database directory under a shard directory.
pub(crate) fn db_dir_of(shard_dir: &Path) -> PathBuf {
    shard_dir.join("db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DEFAULT_NAMESPACE;

    #[tokio::test]
    async fn test_double_open_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let factory = KvFactory::new(KvFactoryOptions::new(dir.path()));

        let store = factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
            .await
            .unwrap();

        let second = factory.new_kv(DEFAULT_NAMESPACE, ShardId::new(1)).await;
        assert!(matches!(second, Err(KvError::AlreadyOpen { .. })));

        // A different shard is fine.
        assert!(factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(2))
            .await
            .is_ok());

        // Closing releases the exclusive open.
        store.close().await.unwrap();
        assert!(factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_releases_open() {
        let dir = tempfile::tempdir().unwrap();
        let factory = KvFactory::new(KvFactoryOptions::new(dir.path()));

        let store = factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
            .await
            .unwrap();
        store.delete().await.unwrap();

        assert!(factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
            .await
            .is_ok());
    }
}
