//! Snapshot export and import.
//!
//! A snapshot is a frozen copy of the engine's file image, carried as a
//! sequence of CRC-checked chunks. The exporting side stages the image under
//! a temp root that is removed when the handle closes, whether or not the
//! transfer completed. The importing side stages incoming chunks under a
//! sibling of the shard database and swaps directories on `complete`, so
//! the replacement is all-or-nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use strata_core::limits::SNAPSHOT_CHUNK_SIZE_BYTES_MAX;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::comparator::SlashKey;
use crate::error::{KvError, KvResult};
use crate::factory::{db_dir_of, loading_dir};
use crate::tablet;

/// One piece of a snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    /// Name of the file this chunk belongs to (no directory components).
    pub file_name: String,
    /// Position of this chunk within the file, starting at 0.
    pub chunk_index: u32,
    /// Total number of chunks in the file.
    pub chunk_count: u32,
    /// The chunk content.
    pub content: Bytes,
    /// CRC32 of the content.
    pub crc: u32,
}

impl SnapshotChunk {
    /// Creates a chunk, computing its checksum.
    #[must_use]
    pub fn new(file_name: String, chunk_index: u32, chunk_count: u32, content: Bytes) -> Self {
        let crc = crc32fast::hash(&content);
        Self {
            file_name,
            chunk_index,
            chunk_count,
            content,
            crc,
        }
    }

    /// Verifies the chunk checksum.
    ///
    /// # Errors
    /// Returns `InvalidChunk` on mismatch.
    pub fn verify(&self) -> KvResult<()> {
        if crc32fast::hash(&self.content) != self.crc {
            return Err(KvError::InvalidChunk {
                file_name: self.file_name.clone(),
                reason: "checksum mismatch",
            });
        }
        Ok(())
    }
}

/// A frozen, exportable image of one shard database.
///
/// Dropping the handle deletes the staged image.
pub struct SnapshotHandle {
    temp_dir: tempfile::TempDir,
    files: Vec<String>,
}

impl SnapshotHandle {
    pub(crate) async fn create(
        shard_dir: &Path,
        map: &BTreeMap<SlashKey, Bytes>,
    ) -> KvResult<Self> {
        tokio::fs::create_dir_all(shard_dir)
            .await
            .map_err(|e| KvError::io("create_shard_dir", e))?;

        let temp_dir = tempfile::Builder::new()
            .prefix("snapshot-")
            .tempdir_in(shard_dir)
            .map_err(|e| KvError::io("create_snapshot_dir", e))?;

        let file_name = format!("tablet-{:08x}.{}", 1, tablet::TABLET_EXTENSION);
        tablet::write_tablet(&temp_dir.path().join(&file_name), map).await?;

        debug!(path = %temp_dir.path().display(), keys = map.len(), "staged snapshot image");
        Ok(Self {
            temp_dir,
            files: vec![file_name],
        })
    }

    /// Returns the temp root holding the staged files.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Reads the staged image as a chunk sequence.
    ///
    /// Every file yields at least one chunk so the receiver recreates empty
    /// files too.
    ///
    /// # Errors
    /// Returns an error if a staged file cannot be read.
    pub async fn chunks(&self) -> KvResult<Vec<SnapshotChunk>> {
        let chunk_size = SNAPSHOT_CHUNK_SIZE_BYTES_MAX as usize;
        let mut chunks = Vec::new();

        for file_name in &self.files {
            let data = tokio::fs::read(self.temp_dir.path().join(file_name))
                .await
                .map_err(|e| KvError::io("read_snapshot_file", e))?;
            let data = Bytes::from(data);

            let count = data.len().div_ceil(chunk_size).max(1);
            // Chunk counts are bounded by file size / chunk size.
            #[allow(clippy::cast_possible_truncation)]
            for index in 0..count {
                let start = index * chunk_size;
                let end = (start + chunk_size).min(data.len());
                chunks.push(SnapshotChunk::new(
                    file_name.clone(),
                    index as u32,
                    count as u32,
                    data.slice(start..end),
                ));
            }
        }
        Ok(chunks)
    }

    /// Closes the handle, deleting the staged image.
    pub fn close(self) {
        drop(self);
    }
}

struct FileProgress {
    file: tokio::fs::File,
    next_index: u32,
    chunk_count: u32,
}

/// Rebuilds a shard database from a chunk stream.
///
/// The loader holds the shard's exclusive open. `complete` swaps the staged
/// directory over the live one; dropping the loader without completing
/// removes the staging directory and releases the shard.
pub struct SnapshotLoader {
    shard_dir: PathBuf,
    staging_dir: PathBuf,
    registry: Arc<Mutex<HashSet<String>>>,
    registry_key: String,
    files: HashMap<String, FileProgress>,
    finished: bool,
}

impl SnapshotLoader {
    pub(crate) async fn create(
        shard_dir: &Path,
        registry: Arc<Mutex<HashSet<String>>>,
        registry_key: String,
    ) -> KvResult<Self> {
        let staging_dir = loading_dir(shard_dir);
        if tokio::fs::try_exists(&staging_dir)
            .await
            .map_err(|e| KvError::io("stat_staging_dir", e))?
        {
            // Leftover from an interrupted load.
            tokio::fs::remove_dir_all(&staging_dir)
                .await
                .map_err(|e| KvError::io("clear_staging_dir", e))?;
        }
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| KvError::io("create_staging_dir", e))?;

        Ok(Self {
            shard_dir: shard_dir.to_path_buf(),
            staging_dir,
            registry,
            registry_key,
            files: HashMap::new(),
            finished: false,
        })
    }

    /// Accepts the next chunk.
    ///
    /// Chunks of one file must arrive in order; files may interleave.
    ///
    /// # Errors
    /// Returns `InvalidChunk` on checksum, naming, or sequencing violations.
    pub async fn add_chunk(&mut self, chunk: &SnapshotChunk) -> KvResult<()> {
        chunk.verify()?;

        if chunk.file_name.is_empty()
            || chunk.file_name.contains('/')
            || chunk.file_name.contains('\\')
            || chunk.file_name.contains("..")
        {
            return Err(KvError::InvalidChunk {
                file_name: chunk.file_name.clone(),
                reason: "file name contains path components",
            });
        }

        if let Some(progress) = self.files.get_mut(&chunk.file_name) {
            if chunk.chunk_index != progress.next_index {
                return Err(KvError::InvalidChunk {
                    file_name: chunk.file_name.clone(),
                    reason: "chunk out of order",
                });
            }
            if chunk.chunk_count != progress.chunk_count {
                return Err(KvError::InvalidChunk {
                    file_name: chunk.file_name.clone(),
                    reason: "chunk count changed mid-file",
                });
            }
            progress
                .file
                .write_all(&chunk.content)
                .await
                .map_err(|e| KvError::io("write_chunk", e))?;
            progress.next_index += 1;
        } else {
            if chunk.chunk_index != 0 {
                return Err(KvError::InvalidChunk {
                    file_name: chunk.file_name.clone(),
                    reason: "first chunk of file must have index 0",
                });
            }
            let mut file = tokio::fs::File::create(self.staging_dir.join(&chunk.file_name))
                .await
                .map_err(|e| KvError::io("create_chunk_file", e))?;
            file.write_all(&chunk.content)
                .await
                .map_err(|e| KvError::io("write_chunk", e))?;
            self.files.insert(
                chunk.file_name.clone(),
                FileProgress {
                    file,
                    next_index: 1,
                    chunk_count: chunk.chunk_count,
                },
            );
        }
        Ok(())
    }

    /// Finishes the load: fsyncs staged files and atomically replaces the
    /// shard database directory.
    ///
    /// # Errors
    /// Returns `InvalidChunk` if any file is incomplete, or an I/O error
    /// from the swap.
    pub async fn complete(mut self) -> KvResult<()> {
        for (name, progress) in &self.files {
            if progress.next_index != progress.chunk_count {
                return Err(KvError::InvalidChunk {
                    file_name: name.clone(),
                    reason: "file incomplete at snapshot end",
                });
            }
        }

        for progress in self.files.values_mut() {
            progress
                .file
                .sync_all()
                .await
                .map_err(|e| KvError::io("sync_chunk_file", e))?;
        }
        self.files.clear();

        let db_dir = db_dir_of(&self.shard_dir);
        let trash_dir = self.shard_dir.join("db.trash");

        if tokio::fs::try_exists(&trash_dir)
            .await
            .map_err(|e| KvError::io("stat_trash_dir", e))?
        {
            tokio::fs::remove_dir_all(&trash_dir)
                .await
                .map_err(|e| KvError::io("clear_trash_dir", e))?;
        }
        if tokio::fs::try_exists(&db_dir)
            .await
            .map_err(|e| KvError::io("stat_db_dir", e))?
        {
            tokio::fs::rename(&db_dir, &trash_dir)
                .await
                .map_err(|e| KvError::io("retire_db_dir", e))?;
        }
        tokio::fs::rename(&self.staging_dir, &db_dir)
            .await
            .map_err(|e| KvError::io("install_db_dir", e))?;
        if let Err(e) = tokio::fs::remove_dir_all(&trash_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove retired database directory");
            }
        }

        self.finished = true;
        self.release();
        info!(path = %db_dir.display(), "installed snapshot as shard database");
        Ok(())
    }

    /// Abandons the load, removing the staging directory.
    ///
    /// # Errors
    /// Returns an error if the staging directory cannot be removed.
    pub async fn abort(mut self) -> KvResult<()> {
        self.files.clear();
        let result = tokio::fs::remove_dir_all(&self.staging_dir)
            .await
            .map_err(|e| KvError::io("remove_staging_dir", e));
        self.finished = true;
        self.release();
        result
    }

    fn release(&self) {
        let mut open = self.registry.lock().expect("registry lock poisoned");
        open.remove(&self.registry_key);
    }
}

impl Drop for SnapshotLoader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_dir_all(&self.staging_dir);
            self.release();
        }
    }
}
