//! The ordered key/value engine.
//!
//! [`KvStore`] is an in-process ordered map over slash-aware keys with a
//! durable tablet image. Mutations go through [`WriteBatch`]; a batch stages
//! an overlay that its own reads and scans observe, and `commit` applies the
//! overlay atomically. The apply task of a shard is the only writer, so
//! critical sections are brief and never held across I/O.
//!
//! Durability: `commit` mutates memory only; the WAL above this layer owns
//! crash durability. `flush` (and `close`) persist the tablet image so a
//! cleanly closed store reopens with its full state.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use strata_core::ShardId;
use tracing::{debug, info};

use crate::comparator::{compare_keys, SlashKey};
use crate::error::{KvError, KvResult};
use crate::snapshot::SnapshotHandle;
use crate::tablet;

/// A value read from the store.
///
/// The handle owns its backing buffer; dropping it releases the resource.
#[derive(Debug, Clone)]
pub struct ValueHandle {
    data: Bytes,
}

impl ValueHandle {
    pub(crate) const fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Unwraps the handle into its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl Deref for ValueHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Forward iterator over `(key, value)` pairs of a range.
///
/// The iterator owns a point-in-time copy of the range; later writes do not
/// move it. Dropping it releases the copy.
#[derive(Debug)]
pub struct KeyValueIterator {
    items: std::vec::IntoIter<(String, Bytes)>,
}

impl Iterator for KeyValueIterator {
    type Item = (String, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

/// Iterator over the keys of a range, forward or reverse.
#[derive(Debug)]
pub struct KeyIterator {
    items: std::vec::IntoIter<String>,
}

impl Iterator for KeyIterator {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

pub(crate) struct StoreInner {
    pub(crate) namespace: String,
    pub(crate) shard: ShardId,
    /// Directory holding tablet files.
    pub(crate) db_dir: PathBuf,
    pub(crate) state: RwLock<KvState>,
    /// Factory-wide registry of open shard databases; used to enforce the
    /// exclusive-open invariant.
    pub(crate) registry: Arc<Mutex<std::collections::HashSet<String>>>,
    pub(crate) registry_key: String,
}

pub(crate) struct KvState {
    pub(crate) map: BTreeMap<SlashKey, Bytes>,
    pub(crate) next_tablet_generation: u64,
    pub(crate) closed: bool,
}

impl StoreInner {
    fn deregister(&self) {
        let mut open = self.registry.lock().expect("registry lock poisoned");
        open.remove(&self.registry_key);
    }
}

/// An open shard database.
///
/// Cloning the handle shares the same underlying store.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<StoreInner>,
}

impl KvStore {
    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Returns the shard this store belongs to.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.inner.shard
    }

    /// Returns the namespace this store belongs to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Starts a new write batch.
    ///
    /// Dropping the batch without `commit` discards the staged mutations.
    #[must_use]
    pub fn new_write_batch(&self) -> WriteBatch {
        WriteBatch {
            inner: Arc::clone(&self.inner),
            overlay: BTreeMap::new(),
        }
    }

    /// Reads a key from committed state.
    ///
    /// # Errors
    /// Returns `KeyNotFound` if absent, or `Closed` after close.
    pub fn get(&self, key: &str) -> KvResult<ValueHandle> {
        let state = self.read_state()?;
        state
            .map
            .get(&SlashKey::new(key))
            .map(|v| ValueHandle::new(v.clone()))
            .ok_or(KvError::KeyNotFound)
    }

    /// Iterates `(key, value)` pairs over `[min_inclusive, max_exclusive)`
    /// in slash order.
    ///
    /// # Errors
    /// Returns `Closed` after close.
    pub fn range_scan(&self, min_inclusive: &str, max_exclusive: &str) -> KvResult<KeyValueIterator> {
        let state = self.read_state()?;
        let items = collect_range(&state.map, min_inclusive, max_exclusive);
        Ok(KeyValueIterator {
            items: items.into_iter(),
        })
    }

    /// Iterates the keys of `[min_inclusive, max_exclusive)` in slash order.
    ///
    /// # Errors
    /// Returns `Closed` after close.
    pub fn key_range_scan(&self, min_inclusive: &str, max_exclusive: &str) -> KvResult<KeyIterator> {
        let state = self.read_state()?;
        let keys: Vec<String> = collect_range(&state.map, min_inclusive, max_exclusive)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        Ok(KeyIterator {
            items: keys.into_iter(),
        })
    }

    /// Iterates the keys of `[min_inclusive, max_exclusive)` in reverse
    /// slash order.
    ///
    /// # Errors
    /// Returns `Closed` after close.
    pub fn key_range_scan_reverse(
        &self,
        min_inclusive: &str,
        max_exclusive: &str,
    ) -> KvResult<KeyIterator> {
        let state = self.read_state()?;
        let mut keys: Vec<String> = collect_range(&state.map, min_inclusive, max_exclusive)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.reverse();
        Ok(KeyIterator {
            items: keys.into_iter(),
        })
    }

    /// Persists the current state as a new tablet generation.
    ///
    /// # Errors
    /// Returns an error if the tablet cannot be written.
    pub async fn flush(&self) -> KvResult<()> {
        let (map, generation) = {
            let mut state = self.write_state()?;
            state.next_tablet_generation += 1;
            (state.map.clone(), state.next_tablet_generation)
        };

        let path = tablet::tablet_path(&self.inner.db_dir, generation);
        tablet::write_tablet(&path, &map).await?;

        // Older generations are superseded; remove them.
        let mut dir = tokio::fs::read_dir(&self.inner.db_dir)
            .await
            .map_err(|e| KvError::io("read_dir", e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| KvError::io("read_dir_entry", e))?
        {
            let entry_path = entry.path();
            if let Some(gen) = tablet::tablet_generation(&entry_path) {
                if gen < generation {
                    tokio::fs::remove_file(&entry_path)
                        .await
                        .map_err(|e| KvError::io("remove_tablet", e))?;
                }
            }
        }

        debug!(
            shard = self.inner.shard.get(),
            generation,
            keys = map.len(),
            "flushed tablet"
        );
        Ok(())
    }

    /// Freezes a point-in-time image of the store and exposes it as a chunk
    /// sequence for transfer. The image lives in a temp directory that is
    /// removed when the handle closes, complete or not.
    ///
    /// # Errors
    /// Returns an error if the image cannot be written.
    pub async fn snapshot(&self) -> KvResult<SnapshotHandle> {
        self.flush().await?;
        let map = {
            let state = self.read_state()?;
            state.map.clone()
        };
        let shard_dir = self
            .inner
            .db_dir
            .parent()
            .map_or_else(|| self.inner.db_dir.clone(), std::path::Path::to_path_buf);
        SnapshotHandle::create(&shard_dir, &map).await
    }

    /// Flushes and closes the store, releasing the exclusive open.
    ///
    /// # Errors
    /// Returns an error if the final flush fails; the store is closed
    /// regardless.
    pub async fn close(&self) -> KvResult<()> {
        {
            let state = self.read_state();
            if state.is_err() {
                // Already closed.
                return Ok(());
            }
        }
        let flush_result = self.flush().await;
        {
            let mut state = self.write_state()?;
            state.closed = true;
        }
        self.inner.deregister();
        info!(shard = self.inner.shard.get(), "closed shard database");
        flush_result
    }

    /// Closes the store and deletes its on-disk state.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    pub async fn delete(&self) -> KvResult<()> {
        {
            let mut state = self.write_state().unwrap_or_else(|_| {
                // Delete after close is allowed; reacquire ignoring closed.
                self.inner.state.write().expect("state lock poisoned")
            });
            state.closed = true;
            state.map.clear();
        }
        self.inner.deregister();
        tokio::fs::remove_dir_all(&self.inner.db_dir)
            .await
            .map_err(|e| KvError::io("remove_db_dir", e))?;
        info!(shard = self.inner.shard.get(), "deleted shard database");
        Ok(())
    }

    fn read_state(&self) -> KvResult<std::sync::RwLockReadGuard<'_, KvState>> {
        let state = self.inner.state.read().expect("state lock poisoned");
        if state.closed {
            return Err(KvError::Closed {
                shard: self.inner.shard.get(),
            });
        }
        Ok(state)
    }

    fn write_state(&self) -> KvResult<std::sync::RwLockWriteGuard<'_, KvState>> {
        let state = self.inner.state.write().expect("state lock poisoned");
        if state.closed {
            return Err(KvError::Closed {
                shard: self.inner.shard.get(),
            });
        }
        Ok(state)
    }
}

fn collect_range(
    map: &BTreeMap<SlashKey, Bytes>,
    min_inclusive: &str,
    max_exclusive: &str,
) -> Vec<(String, Bytes)> {
    if compare_keys(min_inclusive, max_exclusive) != std::cmp::Ordering::Less {
        return Vec::new();
    }
    let min = SlashKey::new(min_inclusive);
    let max = SlashKey::new(max_exclusive);
    map.range((Bound::Included(&min), Bound::Excluded(&max)))
        .map(|(k, v)| (k.as_str().to_string(), v.clone()))
        .collect()
}

/// Staged mutations applied atomically on commit.
///
/// Reads and scans through the batch observe the staged writes layered over
/// committed state. Dropping the batch discards it.
pub struct WriteBatch {
    inner: Arc<StoreInner>,
    /// Staged state per key: `Some` = value to write, `None` = tombstone.
    overlay: BTreeMap<SlashKey, Option<Bytes>>,
}

impl WriteBatch {
    /// Stages a put.
    pub fn put(&mut self, key: &str, value: Bytes) {
        self.overlay.insert(SlashKey::new(key), Some(value));
    }

    /// Stages a point delete.
    pub fn delete(&mut self, key: &str) {
        self.overlay.insert(SlashKey::new(key), None);
    }

    /// Stages deletion of every key currently visible in
    /// `[min_inclusive, max_exclusive)` and returns those keys in slash
    /// order.
    ///
    /// # Errors
    /// Returns `Closed` if the store closed underneath the batch.
    pub fn delete_range(
        &mut self,
        min_inclusive: &str,
        max_exclusive: &str,
    ) -> KvResult<Vec<String>> {
        let doomed = self.visible_keys_in_range(min_inclusive, max_exclusive)?;
        for key in &doomed {
            self.overlay.insert(SlashKey::new(key.as_str()), None);
        }
        Ok(doomed)
    }

    /// Reads a key through the batch: staged writes shadow committed state.
    ///
    /// # Errors
    /// Returns `KeyNotFound` if absent or staged-deleted.
    pub fn get(&self, key: &str) -> KvResult<ValueHandle> {
        match self.overlay.get(&SlashKey::new(key)) {
            Some(Some(value)) => Ok(ValueHandle::new(value.clone())),
            Some(None) => Err(KvError::KeyNotFound),
            None => {
                let state = self.read_state()?;
                state
                    .map
                    .get(&SlashKey::new(key))
                    .map(|v| ValueHandle::new(v.clone()))
                    .ok_or(KvError::KeyNotFound)
            }
        }
    }

    /// Iterates the keys visible through the batch in
    /// `[min_inclusive, max_exclusive)`.
    ///
    /// # Errors
    /// Returns `Closed` if the store closed underneath the batch.
    pub fn key_range_scan(
        &self,
        min_inclusive: &str,
        max_exclusive: &str,
    ) -> KvResult<KeyIterator> {
        let keys = self.visible_keys_in_range(min_inclusive, max_exclusive)?;
        Ok(KeyIterator {
            items: keys.into_iter(),
        })
    }

    /// Applies the staged mutations atomically.
    ///
    /// # Errors
    /// Returns `Closed` if the store has been closed.
    pub fn commit(self) -> KvResult<()> {
        let mut state = {
            let state = self.inner.state.write().expect("state lock poisoned");
            if state.closed {
                return Err(KvError::Closed {
                    shard: self.inner.shard.get(),
                });
            }
            state
        };

        for (key, staged) in self.overlay {
            match staged {
                Some(value) => {
                    state.map.insert(key, value);
                }
                None => {
                    state.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn visible_keys_in_range(
        &self,
        min_inclusive: &str,
        max_exclusive: &str,
    ) -> KvResult<Vec<String>> {
        if compare_keys(min_inclusive, max_exclusive) != std::cmp::Ordering::Less {
            return Ok(Vec::new());
        }
        let min = SlashKey::new(min_inclusive);
        let max = SlashKey::new(max_exclusive);
        let bounds = (Bound::Included(&min), Bound::Excluded(&max));

        let mut keys: std::collections::BTreeSet<SlashKey> = {
            let state = self.read_state()?;
            state.map.range(bounds).map(|(k, _)| k.clone()).collect()
        };
        for (key, staged) in self.overlay.range(bounds) {
            if staged.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        Ok(keys.into_iter().map(SlashKey::into_string).collect())
    }

    fn read_state(&self) -> KvResult<std::sync::RwLockReadGuard<'_, KvState>> {
        let state = self.inner.state.read().expect("state lock poisoned");
        if state.closed {
            return Err(KvError::Closed {
                shard: self.inner.shard.get(),
            });
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{KvFactory, KvFactoryOptions};
    use strata_core::DEFAULT_NAMESPACE;

    async fn open_store(dir: &std::path::Path) -> KvStore {
        let factory = KvFactory::new(KvFactoryOptions::new(dir));
        factory
            .new_kv(DEFAULT_NAMESPACE, ShardId::new(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        wb.put("a", Bytes::from_static(b"0"));
        wb.put("b", Bytes::from_static(b"1"));
        wb.put("c", Bytes::from_static(b"2"));
        wb.commit().unwrap();

        assert_eq!(&*store.get("a").unwrap(), b"0");
        assert_eq!(&*store.get("b").unwrap(), b"1");
        assert_eq!(&*store.get("c").unwrap(), b"2");
        assert!(store.get("non-existing").unwrap_err().is_key_not_found());

        let mut wb = store.new_write_batch();
        wb.put("a", Bytes::from_static(b"00"));
        wb.put("b", Bytes::from_static(b"11"));
        wb.put("d", Bytes::from_static(b"22"));
        wb.delete("c");
        wb.commit().unwrap();

        assert_eq!(&*store.get("a").unwrap(), b"00");
        assert_eq!(&*store.get("b").unwrap(), b"11");
        assert!(store.get("c").unwrap_err().is_key_not_found());
        assert_eq!(&*store.get("d").unwrap(), b"22");
    }

    #[tokio::test]
    async fn test_batch_reads_see_staged_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        wb.put("k", Bytes::from_static(b"staged"));
        assert_eq!(&*wb.get("k").unwrap(), b"staged");

        wb.delete("k");
        assert!(wb.get("k").unwrap_err().is_key_not_found());

        // Nothing committed yet.
        drop(wb);
        assert!(store.get("k").unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_drop_discards_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        {
            let mut wb = store.new_write_batch();
            wb.put("ghost", Bytes::from_static(b"x"));
        }
        assert!(store.get("ghost").unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_key_range_scan_slash_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        for key in [
            "/a/a/a/zzzzzz",
            "/a/b/a/a/a/a",
            "/a/b/a/c",
            "/a/b/a/a",
            "/a/b/a/a/a",
            "/a/b/a/b",
        ] {
            wb.put(key, Bytes::from_static(b"x"));
        }
        wb.commit().unwrap();

        let keys: Vec<String> = store.key_range_scan("/a/b/a/", "/a/b/a//").unwrap().collect();
        assert_eq!(keys, vec!["/a/b/a/a", "/a/b/a/b", "/a/b/a/c"]);
    }

    #[tokio::test]
    async fn test_range_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        for (k, v) in [("/root/a", "a"), ("/root/b", "b"), ("/root/c", "c"), ("/root/d", "d")] {
            wb.put(k, Bytes::from(v.to_string()));
        }
        wb.commit().unwrap();

        let pairs: Vec<(String, Bytes)> = store.range_scan("/root/a", "/root/c").unwrap().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "/root/a");
        assert_eq!(&pairs[0].1[..], b"a");
        assert_eq!(pairs[1].0, "/root/b");

        // Empty range.
        let empty: Vec<_> = store.range_scan("/xyz/a", "/xyz/c").unwrap().collect();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_key_range_scan_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        for key in ["/root/a", "/root/b", "/root/c", "/root/d"] {
            wb.put(key, Bytes::from_static(b"x"));
        }
        wb.commit().unwrap();

        let keys: Vec<String> = store
            .key_range_scan_reverse("/root/a", "/root/c")
            .unwrap()
            .collect();
        assert_eq!(keys, vec!["/root/b", "/root/a"]);
    }

    #[tokio::test]
    async fn test_delete_range_through_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut wb = store.new_write_batch();
        for key in ["/q/a", "/q/b", "/q/c", "/r/a"] {
            wb.put(key, Bytes::from_static(b"x"));
        }
        wb.commit().unwrap();

        let mut wb = store.new_write_batch();
        wb.put("/q/e", Bytes::from_static(b"staged"));
        let doomed = wb.delete_range("/q/", "/q//").unwrap();
        assert_eq!(doomed, vec!["/q/a", "/q/b", "/q/c", "/q/e"]);
        wb.commit().unwrap();

        assert!(store.get("/q/a").unwrap_err().is_key_not_found());
        assert!(store.get("/q/e").unwrap_err().is_key_not_found());
        assert!(store.get("/r/a").is_ok());
    }

    #[tokio::test]
    async fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            let mut wb = store.new_write_batch();
            wb.put("a", Bytes::from_static(b"0"));
            wb.commit().unwrap();
            store.close().await.unwrap();
        }

        let store = open_store(dir.path()).await;
        assert_eq!(&*store.get("a").unwrap(), b"0");
    }

    #[tokio::test]
    async fn test_closed_store_rejects_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.close().await.unwrap();
        assert!(matches!(store.get("a"), Err(KvError::Closed { .. })));
    }
}
