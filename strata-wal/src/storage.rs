//! Storage abstraction for WAL segment files.
//!
//! The trait handles raw bytes at file offsets; segments, framing, and
//! checksums live above it. Production uses [`TokioStorage`]; tests can
//! substitute their own backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{WalError, WalResult};

/// Storage backend for WAL segment files.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens or creates a file at the given path for read/write.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> WalResult<Box<dyn StorageFile>>;

    /// Lists files in a directory with the given extension, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path, extension: &str) -> WalResult<Vec<PathBuf>>;

    /// Removes a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    async fn remove(&self, path: &Path) -> WalResult<()>;

    /// Removes a directory and everything under it.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    async fn remove_dir_all(&self, path: &Path) -> WalResult<()>;

    /// Creates a directory and all parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> WalResult<()>;
}

/// A handle to an open segment file.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Writes data at the specified byte offset.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn write_at(&self, offset: u64, data: &[u8]) -> WalResult<()>;

    /// Reads the entire file contents.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> WalResult<Bytes>;

    /// Syncs all buffered data to disk (fsync). Data written before a
    /// completed `sync` survives crashes.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync(&self) -> WalResult<()>;

    /// Truncates the file to the specified length.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> WalResult<()>;
}

/// File storage backed by `tokio::fs`.
///
/// `tokio::fs` dispatches to a blocking thread pool, which is acceptable
/// here: WAL writes are already serialized per shard, and fsync dominates.
#[derive(Debug, Clone, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new Tokio storage instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> WalResult<Box<dyn StorageFile>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| WalError::io("open", e))?;

        Ok(Box::new(TokioFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> WalResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| WalError::io("read_dir", e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WalError::io("read_dir_entry", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    async fn remove(&self, path: &Path) -> WalResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| WalError::io("remove", e))
    }

    async fn remove_dir_all(&self, path: &Path) -> WalResult<()> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| WalError::io("remove_dir_all", e))
    }

    async fn create_dir_all(&self, path: &Path) -> WalResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| WalError::io("create_dir_all", e))
    }
}

struct TokioFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
impl StorageFile for TokioFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> WalResult<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| WalError::io("seek", e))?;
        file.write_all(data)
            .await
            .map_err(|e| WalError::io("write", e))?;
        Ok(())
    }

    async fn read_all(&self) -> WalResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| WalError::io("seek", e))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| WalError::io("read", e))?;
        Ok(Bytes::from(buf))
    }

    async fn sync(&self) -> WalResult<()> {
        let file = self.file.lock().await;
        file.sync_all().await.map_err(|e| WalError::io("sync", e))
    }

    async fn truncate(&self, len: u64) -> WalResult<()> {
        let file = self.file.lock().await;
        file.set_len(len)
            .await
            .map_err(|e| WalError::io("truncate", e))
    }
}
