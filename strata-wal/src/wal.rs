//! Write-Ahead Log management.
//!
//! The [`Wal`] struct manages the segment files of one shard's log:
//! - Segment rotation when size limits are reached
//! - Recovery from crashes (torn records at the tail are discarded)
//! - Group commit for batching fsync calls
//! - Tail truncation (replication conflict resolution)
//! - Head trimming (garbage collection below the low-water mark)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use strata_core::{Offset, ShardId};
use tracing::{debug, info};

use crate::entry::Entry;
use crate::error::{WalError, WalResult};
use crate::reader::{WalReader, WalReverseReader};
use crate::segment::{Segment, SegmentConfig, SegmentHeader, SegmentId, SEGMENT_HEADER_SIZE};
use crate::storage::{Storage, StorageFile};

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for this shard's segment files.
    pub dir: PathBuf,
    /// Configuration for individual segments.
    pub segment_config: SegmentConfig,
    /// Whether to fsync after every append. When false, call `sync()`
    /// explicitly; appends are not durable until it completes.
    pub sync_on_append: bool,
}

impl WalConfig {
    /// Creates a new WAL configuration.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_config: SegmentConfig::new(),
            sync_on_append: true,
        }
    }

    /// Sets the segment configuration.
    #[must_use]
    pub const fn with_segment_config(mut self, config: SegmentConfig) -> Self {
        self.segment_config = config;
        self
    }

    /// Enables or disables fsync-per-append.
    #[must_use]
    pub const fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }
}

/// Write-Ahead Log for one shard.
pub struct Wal {
    storage: Arc<dyn Storage>,
    config: WalConfig,
    shard: ShardId,
    /// Sealed segments by id; ids increase with offsets.
    sealed_segments: BTreeMap<SegmentId, SealedSegment>,
    /// Active segment receiving appends.
    active_segment: Option<ActiveSegment>,
    next_segment_id: SegmentId,
    /// Oldest retained offset.
    first_offset: Offset,
    /// Highest appended offset, `Offset::INVALID` when empty.
    head: Offset,
    bytes_since_sync: u64,
    closed: bool,
}

struct SealedSegment {
    segment: Segment,
    path: PathBuf,
}

struct ActiveSegment {
    segment: Segment,
    file: Box<dyn StorageFile>,
    path: PathBuf,
    write_offset: u64,
}

impl Wal {
    /// Opens or creates the WAL for a shard.
    ///
    /// Existing segments are recovered in file order. Torn records at the
    /// end of the last segment are discarded and the head adjusted; a gap or
    /// corruption anywhere earlier is fatal.
    ///
    /// # Errors
    /// Returns an error if recovery fails or the directory cannot be created.
    pub async fn open(
        storage: Arc<dyn Storage>,
        shard: ShardId,
        config: WalConfig,
    ) -> WalResult<Self> {
        storage.create_dir_all(&config.dir).await?;

        let segment_files = storage.list_files(&config.dir, "wal").await?;

        let mut sealed_segments = BTreeMap::new();
        let mut next_segment_id = SegmentId::new(1);
        let mut first_offset = Offset::new(0);
        let mut head = Offset::INVALID;

        for (position, path) in segment_files.iter().enumerate() {
            let file = storage.open(path).await?;
            let data = file.read_all().await?;

            if data.len() < SEGMENT_HEADER_SIZE {
                return Err(WalError::InvalidHeader {
                    file_offset: 0,
                    reason: "segment file shorter than header",
                });
            }

            let segment = Segment::decode(data, config.segment_config)?;
            let segment_id = segment.id();

            if position == 0 {
                first_offset = segment.first_offset();
            } else if segment.first_offset() != head.next() {
                // A hole between segments cannot come from a torn tail write.
                return Err(WalError::InvalidHeader {
                    file_offset: 0,
                    reason: "offset gap between segments",
                });
            }

            if !segment.is_empty() {
                head = segment.last_offset();
            }
            if segment_id >= next_segment_id {
                next_segment_id = segment_id.next();
            }

            debug!(
                shard = shard.get(),
                segment = %segment_id,
                first = segment.first_offset().get(),
                last = segment.last_offset().get(),
                "recovered segment"
            );

            sealed_segments.insert(
                segment_id,
                SealedSegment {
                    segment,
                    path: path.clone(),
                },
            );
        }

        info!(
            shard = shard.get(),
            segments = sealed_segments.len(),
            first = first_offset.get(),
            head = head.get(),
            "wal recovery complete"
        );

        Ok(Self {
            storage,
            config,
            shard,
            sealed_segments,
            active_segment: None,
            next_segment_id,
            first_offset,
            head,
            bytes_since_sync: 0,
            closed: false,
        })
    }

    /// Returns the oldest retained offset (the low-water mark).
    #[must_use]
    pub const fn low_water_mark(&self) -> Offset {
        self.first_offset
    }

    /// Returns the highest appended offset, `Offset::INVALID` when empty.
    #[must_use]
    pub const fn head_offset(&self) -> Offset {
        self.head
    }

    /// Returns true if the WAL holds no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.head.is_valid()
    }

    /// Appends an entry.
    ///
    /// The entry must carry offset `head + 1`: the log assigns no offsets,
    /// it only enforces density. Durable on return when `sync_on_append` is
    /// set, otherwise after the next `sync()`.
    ///
    /// # Errors
    /// Returns `OffsetGap` for non-contiguous appends, or an I/O error.
    pub async fn append(&mut self, entry: Entry) -> WalResult<Offset> {
        self.check_open()?;

        let expected = self.head.next();
        if entry.offset() != expected {
            return Err(WalError::OffsetGap {
                expected,
                actual: entry.offset(),
            });
        }

        let frame_size = entry.frame_size();
        self.ensure_active_segment(frame_size).await?;

        let active = self
            .active_segment
            .as_mut()
            .expect("active segment exists after ensure_active_segment");

        // Frame sizes are bounded by ENTRY_PAYLOAD_SIZE_BYTES_MAX.
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = bytes::BytesMut::with_capacity(frame_size as usize);
        entry.encode(&mut buf);
        let data = buf.freeze();

        active.file.write_at(active.write_offset, &data).await?;
        active.write_offset += frame_size;
        active.segment.push(entry);

        self.head = expected;
        self.bytes_since_sync += frame_size;

        if self.config.sync_on_append {
            self.sync().await?;
        }

        Ok(expected)
    }

    /// Syncs all buffered appends to disk.
    ///
    /// One fsync covers every append since the previous sync (group commit).
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    pub async fn sync(&mut self) -> WalResult<()> {
        self.check_open()?;
        if let Some(active) = &self.active_segment {
            active.file.sync().await?;
        }
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Reads a single entry by offset.
    ///
    /// # Errors
    /// Returns `OffsetOutOfBounds` outside the retained range.
    pub fn read(&self, offset: Offset) -> WalResult<&Entry> {
        if offset < self.first_offset || offset > self.head || !offset.is_valid() {
            return Err(self.out_of_bounds(offset));
        }

        if let Some(active) = &self.active_segment {
            if offset >= active.segment.first_offset() {
                return active
                    .segment
                    .entry_at(offset)
                    .ok_or_else(|| self.out_of_bounds(offset));
            }
        }

        for sealed in self.sealed_segments.values().rev() {
            if offset >= sealed.segment.first_offset() {
                return sealed
                    .segment
                    .entry_at(offset)
                    .ok_or_else(|| self.out_of_bounds(offset));
            }
        }

        Err(self.out_of_bounds(offset))
    }

    /// Returns the entry at the head, or `None` if the log is empty.
    ///
    /// Fencing uses this to report the last entry's `(offset, epoch)` so
    /// the coordinator can pick the most advanced member.
    #[must_use]
    pub fn last_entry(&self) -> Option<Entry> {
        if self.is_empty() {
            return None;
        }
        self.reverse_read_from(self.head).ok()?.next_entry()
    }

    /// Returns a forward cursor over `[offset, head]`.
    ///
    /// An offset just past the head yields an empty cursor (end-of-log).
    ///
    /// # Errors
    /// Returns `OffsetOutOfBounds` if `offset` is below the low-water mark:
    /// those entries are gone and the caller must fall back to a snapshot.
    pub fn read_from(&self, offset: Offset) -> WalResult<WalReader> {
        if offset < self.first_offset || !offset.is_valid() {
            return Err(self.out_of_bounds(offset));
        }
        Ok(WalReader::new(self.collect_from(offset)))
    }

    /// Returns a backward cursor starting at `min(offset, head)`.
    ///
    /// # Errors
    /// Returns `OffsetOutOfBounds` if `offset` is below the low-water mark.
    pub fn reverse_read_from(&self, offset: Offset) -> WalResult<WalReverseReader> {
        if offset < self.first_offset || !offset.is_valid() {
            return Err(self.out_of_bounds(offset));
        }
        let start = if offset > self.head { self.head } else { offset };
        let mut entries = self.collect_from(self.first_offset);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        entries.truncate((start.get() - self.first_offset.get() + 1).max(0) as usize);
        Ok(WalReverseReader::new(entries))
    }

    /// Removes all entries strictly above `offset` and returns the new head.
    ///
    /// `Offset::INVALID` wipes the whole log. Idempotent: truncating at or
    /// above the head is a no-op.
    ///
    /// # Errors
    /// Returns `OffsetOutOfBounds` if `offset` is above the head.
    pub async fn truncate(&mut self, offset: Offset) -> WalResult<Offset> {
        self.check_open()?;

        if offset > self.head {
            return Err(self.out_of_bounds(offset));
        }
        if offset == self.head {
            return Ok(self.head);
        }

        // Drop sealed segments that start above the cut.
        let doomed: Vec<SegmentId> = self
            .sealed_segments
            .iter()
            .filter(|(_, s)| s.segment.first_offset() > offset)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            let sealed = self
                .sealed_segments
                .remove(&id)
                .expect("segment id collected above");
            self.storage.remove(&sealed.path).await?;
            debug!(shard = self.shard.get(), segment = %id, "removed segment past truncation point");
        }

        // Cut the active segment.
        let drop_active = self
            .active_segment
            .as_ref()
            .is_some_and(|a| a.segment.first_offset() > offset);
        if drop_active {
            let active = self
                .active_segment
                .take()
                .expect("active segment checked above");
            self.storage.remove(&active.path).await?;
        } else if let Some(active) = &mut self.active_segment {
            active.segment.truncate_above(offset);
            let data = active.segment.encode();
            active.file.truncate(0).await?;
            active.file.write_at(0, &data).await?;
            active.file.sync().await?;
            active.write_offset = data.len() as u64;
        }

        // Cut the sealed segment now holding the head, if any.
        if let Some((_, sealed)) = self
            .sealed_segments
            .iter_mut()
            .rev()
            .find(|(_, s)| s.segment.first_offset() <= offset)
        {
            if sealed.segment.last_offset() > offset {
                sealed.segment.truncate_above(offset);
                let data = sealed.segment.encode();
                let file = self.storage.open(&sealed.path).await?;
                file.truncate(0).await?;
                file.write_at(0, &data).await?;
                file.sync().await?;
            }
        }

        self.head = offset;
        if !offset.is_valid() {
            self.first_offset = Offset::new(0);
        }

        info!(shard = self.shard.get(), head = offset.get(), "truncated wal");
        Ok(self.head)
    }

    /// Garbage-collects sealed segments whose entries all lie below
    /// `up_to`, advancing the low-water mark.
    ///
    /// Only whole segments are removed; the low-water mark lands on the
    /// first offset of the oldest surviving segment. The caller must ensure
    /// the discarded range is covered by a persisted snapshot that every
    /// member has received or acked past.
    ///
    /// # Errors
    /// Returns an error if a segment file cannot be removed.
    pub async fn trim(&mut self, up_to: Offset) -> WalResult<Offset> {
        self.check_open()?;

        let doomed: Vec<SegmentId> = self
            .sealed_segments
            .iter()
            .filter(|(_, s)| !s.segment.is_empty() && s.segment.last_offset() < up_to)
            .map(|(id, _)| *id)
            .collect();

        for id in &doomed {
            let sealed = self
                .sealed_segments
                .remove(id)
                .expect("segment id collected above");
            self.storage.remove(&sealed.path).await?;
            debug!(shard = self.shard.get(), segment = %id, "trimmed segment");
        }

        self.first_offset = self
            .sealed_segments
            .values()
            .next()
            .map(|s| s.segment.first_offset())
            .or_else(|| {
                self.active_segment
                    .as_ref()
                    .map(|a| a.segment.first_offset())
            })
            .unwrap_or_else(|| self.head.next());

        if !doomed.is_empty() {
            info!(
                shard = self.shard.get(),
                removed = doomed.len(),
                low_water = self.first_offset.get(),
                "advanced wal low-water mark"
            );
        }
        Ok(self.first_offset)
    }

    /// Discards every entry and repositions the log so the next append is
    /// `head + 1`. Used after a snapshot install: the discarded range is
    /// covered by the snapshot, so the low-water mark lands at `head + 1`.
    ///
    /// # Errors
    /// Returns an error if segment files cannot be removed.
    pub async fn reset(&mut self, head: Offset) -> WalResult<()> {
        self.check_open()?;

        let paths: Vec<PathBuf> = self
            .sealed_segments
            .values()
            .map(|s| s.path.clone())
            .chain(self.active_segment.as_ref().map(|a| a.path.clone()))
            .collect();
        self.sealed_segments.clear();
        self.active_segment = None;
        for path in paths {
            self.storage.remove(&path).await?;
        }

        self.head = head;
        self.first_offset = head.next();
        self.bytes_since_sync = 0;

        info!(shard = self.shard.get(), head = head.get(), "reset wal");
        Ok(())
    }

    /// Flushes and closes the log. Further operations fail with `Closed`.
    ///
    /// # Errors
    /// Returns an error if the final sync fails.
    pub async fn close(&mut self) -> WalResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(active) = &self.active_segment {
            active.file.sync().await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Closes the log and deletes its directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    pub async fn delete(mut self) -> WalResult<()> {
        self.closed = true;
        self.active_segment = None;
        self.sealed_segments.clear();
        self.storage.remove_dir_all(&self.config.dir).await
    }

    fn check_open(&self) -> WalResult<()> {
        if self.closed {
            return Err(WalError::Closed {
                shard: self.shard.get(),
            });
        }
        Ok(())
    }

    const fn out_of_bounds(&self, offset: Offset) -> WalError {
        WalError::OffsetOutOfBounds {
            offset,
            first: self.first_offset,
            last: self.head,
        }
    }

    fn collect_from(&self, offset: Offset) -> Vec<Entry> {
        let mut entries = Vec::new();
        for sealed in self.sealed_segments.values() {
            entries.extend_from_slice(sealed.segment.entries_from(offset));
        }
        if let Some(active) = &self.active_segment {
            entries.extend_from_slice(active.segment.entries_from(offset));
        }
        entries
    }

    /// Ensures there is an active segment with room for the next frame.
    async fn ensure_active_segment(&mut self, frame_size: u64) -> WalResult<()> {
        if let Some(active) = &self.active_segment {
            if active.segment.accepts(frame_size) {
                return Ok(());
            }
            self.rotate_segment();
        }

        let segment_id = self.next_segment_id;
        self.next_segment_id = segment_id.next();

        let segment_first = self.head.next();
        let path = self.segment_path(segment_id);
        let file = self.storage.open(&path).await?;

        let segment = Segment::new(segment_id, segment_first, self.config.segment_config);
        let header_data = {
            let mut buf = bytes::BytesMut::with_capacity(SEGMENT_HEADER_SIZE);
            SegmentHeader::new(segment_id, segment_first).encode(&mut buf);
            buf.freeze()
        };
        file.write_at(0, &header_data).await?;

        self.active_segment = Some(ActiveSegment {
            segment,
            file,
            path,
            write_offset: SEGMENT_HEADER_SIZE as u64,
        });

        debug!(
            shard = self.shard.get(),
            segment = %segment_id,
            first = segment_first.get(),
            "created segment"
        );
        Ok(())
    }

    fn rotate_segment(&mut self) {
        if let Some(mut active) = self.active_segment.take() {
            active.segment.seal();
            let segment_id = active.segment.id();
            debug!(
                shard = self.shard.get(),
                segment = %segment_id,
                entries = active.segment.entry_count(),
                "sealed segment"
            );
            self.sealed_segments.insert(
                segment_id,
                SealedSegment {
                    segment: active.segment,
                    path: active.path,
                },
            );
        }
    }

    fn segment_path(&self, segment_id: SegmentId) -> PathBuf {
        self.config
            .dir
            .join(format!("segment-{:08x}.wal", segment_id.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TokioStorage;
    use bytes::Bytes;
    use strata_core::Epoch;

    fn entry(epoch: i64, offset: i64) -> Entry {
        Entry::new(
            Epoch::new(epoch),
            Offset::new(offset),
            Bytes::from(format!("data-{offset}")),
        )
        .unwrap()
    }

    async fn open_wal(dir: &std::path::Path) -> Wal {
        let config = WalConfig::new(dir);
        Wal::open(Arc::new(TokioStorage::new()), ShardId::new(1), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        assert!(wal.is_empty());

        for i in 0..5 {
            let offset = wal.append(entry(1, i)).await.unwrap();
            assert_eq!(offset, Offset::new(i));
        }

        assert_eq!(wal.head_offset(), Offset::new(4));
        assert_eq!(wal.low_water_mark(), Offset::new(0));

        for i in 0..5 {
            let e = wal.read(Offset::new(i)).unwrap();
            assert_eq!(e.offset(), Offset::new(i));
            assert_eq!(e.epoch(), Epoch::new(1));
        }
    }

    #[tokio::test]
    async fn test_append_rejects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;

        wal.append(entry(1, 0)).await.unwrap();
        let result = wal.append(entry(1, 5)).await;
        assert!(matches!(result, Err(WalError::OffsetGap { .. })));
    }

    #[tokio::test]
    async fn test_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(dir.path()).await;
            for i in 0..10 {
                wal.append(entry(2, i)).await.unwrap();
            }
            wal.close().await.unwrap();
        }

        let wal = open_wal(dir.path()).await;
        assert_eq!(wal.head_offset(), Offset::new(9));
        assert_eq!(wal.low_water_mark(), Offset::new(0));
        assert_eq!(wal.read(Offset::new(7)).unwrap().epoch(), Epoch::new(2));
    }

    #[tokio::test]
    async fn test_recovery_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(dir.path()).await;
            for i in 0..4 {
                wal.append(entry(1, i)).await.unwrap();
            }
            wal.close().await.unwrap();
        }

        // Chop bytes off the segment file to simulate a torn write.
        let storage = TokioStorage::new();
        let files = storage.list_files(dir.path(), "wal").await.unwrap();
        assert_eq!(files.len(), 1);
        let file = storage.open(&files[0]).await.unwrap();
        let len = file.read_all().await.unwrap().len() as u64;
        file.truncate(len - 3).await.unwrap();

        let wal = open_wal(dir.path()).await;
        assert_eq!(wal.head_offset(), Offset::new(2));
    }

    #[tokio::test]
    async fn test_read_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        for i in 0..6 {
            wal.append(entry(1, i)).await.unwrap();
        }

        let reader = wal.read_from(Offset::new(3)).unwrap();
        let offsets: Vec<i64> = reader.map(|e| e.offset().get()).collect();
        assert_eq!(offsets, vec![3, 4, 5]);

        // Just past the head: empty cursor, not an error.
        let mut reader = wal.read_from(Offset::new(6)).unwrap();
        assert!(reader.next_entry().is_none());
    }

    #[tokio::test]
    async fn test_reverse_read_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        for i in 0..4 {
            wal.append(entry(i, i)).await.unwrap();
        }

        let reader = wal.reverse_read_from(Offset::new(2)).unwrap();
        let offsets: Vec<i64> = reader.map(|e| e.offset().get()).collect();
        assert_eq!(offsets, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        for i in 0..10 {
            wal.append(entry(1, i)).await.unwrap();
        }

        let head = wal.truncate(Offset::new(5)).await.unwrap();
        assert_eq!(head, Offset::new(5));
        assert!(wal.read(Offset::new(6)).is_err());
        assert!(wal.read(Offset::new(5)).is_ok());

        // Idempotent at the head.
        let head = wal.truncate(Offset::new(5)).await.unwrap();
        assert_eq!(head, Offset::new(5));

        // Above the head: error.
        assert!(wal.truncate(Offset::new(9)).await.is_err());

        // Appends continue from the new head.
        wal.append(entry(2, 6)).await.unwrap();
        assert_eq!(wal.head_offset(), Offset::new(6));
    }

    #[tokio::test]
    async fn test_truncate_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(dir.path()).await;
            for i in 0..10 {
                wal.append(entry(1, i)).await.unwrap();
            }
            wal.truncate(Offset::new(3)).await.unwrap();
            wal.close().await.unwrap();
        }

        let wal = open_wal(dir.path()).await;
        assert_eq!(wal.head_offset(), Offset::new(3));
    }

    #[tokio::test]
    async fn test_truncate_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        for i in 0..3 {
            wal.append(entry(1, i)).await.unwrap();
        }

        let head = wal.truncate(Offset::INVALID).await.unwrap();
        assert_eq!(head, Offset::INVALID);
        assert!(wal.is_empty());

        wal.append(entry(2, 0)).await.unwrap();
        assert_eq!(wal.head_offset(), Offset::new(0));
    }

    #[tokio::test]
    async fn test_trim() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path())
            .with_segment_config(SegmentConfig::new().with_max_entries(2));
        let mut wal = Wal::open(Arc::new(TokioStorage::new()), ShardId::new(1), config)
            .await
            .unwrap();

        for i in 0..7 {
            wal.append(entry(1, i)).await.unwrap();
        }

        // Segments: [0,1] [2,3] [4,5] sealed, [6] active.
        let low_water = wal.trim(Offset::new(4)).await.unwrap();
        assert_eq!(low_water, Offset::new(4));
        assert!(wal.read(Offset::new(1)).is_err());
        assert!(wal.read(Offset::new(4)).is_ok());
        assert!(matches!(
            wal.read_from(Offset::new(0)),
            Err(WalError::OffsetOutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_repositions_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        for i in 0..5 {
            wal.append(entry(1, i)).await.unwrap();
        }

        wal.reset(Offset::new(99)).await.unwrap();
        assert_eq!(wal.head_offset(), Offset::new(99));
        assert_eq!(wal.low_water_mark(), Offset::new(100));
        assert!(wal.read(Offset::new(3)).is_err());

        wal.append(entry(2, 100)).await.unwrap();
        assert_eq!(wal.head_offset(), Offset::new(100));
    }

    #[tokio::test]
    async fn test_closed_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path()).await;
        wal.close().await.unwrap();

        let result = wal.append(entry(1, 0)).await;
        assert!(matches!(result, Err(WalError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let config = WalConfig::new(&wal_dir);
        let mut wal = Wal::open(Arc::new(TokioStorage::new()), ShardId::new(1), config)
            .await
            .unwrap();
        wal.append(entry(1, 0)).await.unwrap();
        wal.delete().await.unwrap();
        assert!(!wal_dir.exists());
    }

    #[tokio::test]
    async fn test_group_commit() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path()).with_sync_on_append(false);
        let mut wal = Wal::open(Arc::new(TokioStorage::new()), ShardId::new(1), config)
            .await
            .unwrap();

        for i in 0..3 {
            wal.append(entry(1, i)).await.unwrap();
        }
        wal.sync().await.unwrap();
        assert_eq!(wal.head_offset(), Offset::new(2));
    }
}
