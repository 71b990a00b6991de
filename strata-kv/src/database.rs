//! The replication-aware database layer.
//!
//! A [`Database`] owns one shard's [`KvStore`] and applies committed log
//! payloads to it: one payload becomes exactly one engine write batch, so a
//! payload is applied atomically or not at all. Version-id semantics,
//! conditional operations, and change notifications live here; the engine
//! below knows nothing about offsets.
//!
//! Apply is a pure function of `(engine state, payload, offset)`: timestamps
//! come from the payload (assigned once by the leader), so every replica
//! folds the log into the same bytes.
//!
//! The last applied offset is persisted inside the same batch under
//! [`COMMIT_OFFSET_KEY`], which makes the applied position crash-consistent
//! with the data and lets an exported snapshot carry the offset it covers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::{
    DeleteOp, DeleteRangeOp, Epoch, GetOp, Notification, NotificationBatch, NotificationKind,
    Offset, OpResult, OpStatus, PutOp, VersionInfo, WriteBatchPayload, WriteOp,
};
use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::store::{KvStore, WriteBatch};
use crate::value::ValueEntry;

/// Prefix of keys reserved for replication bookkeeping. Invisible to user
/// reads, scans, and notifications.
pub const INTERNAL_KEY_PREFIX: &str = "__strata/";

/// Internal key holding the last applied log offset.
pub const COMMIT_OFFSET_KEY: &str = "__strata/commit-offset";

/// Internal key holding the last fenced epoch.
pub const TERM_KEY: &str = "__strata/term";

/// A committed read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// The stored value.
    pub value: Bytes,
    /// Version metadata of the value.
    pub version: VersionInfo,
}

/// Everything produced by applying one log payload.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Per-op results, in the order the ops appeared in the payload.
    pub results: Vec<OpResult>,
    /// Notifications for every mutation the payload performed.
    pub notifications: NotificationBatch,
}

/// One shard's materialized state.
pub struct Database {
    store: KvStore,
}

impl Database {
    /// Wraps an open store.
    #[must_use]
    pub const fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Returns the underlying engine handle.
    #[must_use]
    pub const fn store(&self) -> &KvStore {
        &self.store
    }

    /// Applies one committed log payload as a single atomic batch and
    /// records `offset` as the applied position.
    ///
    /// Per-op failures (`BadVersion`, `KeyNotFound`) fail only that op; the
    /// rest of the batch still applies.
    ///
    /// # Errors
    /// Returns an error only for engine failures; the caller treats those
    /// as fatal for the shard.
    pub fn apply(&self, payload: &WriteBatchPayload, offset: Offset) -> KvResult<ApplyOutcome> {
        let mut batch = self.store.new_write_batch();
        let mut results = Vec::with_capacity(payload.ops.len());
        let mut notifications = Vec::new();

        for op in &payload.ops {
            let result = match op {
                WriteOp::Put(put) => {
                    Self::apply_put(&mut batch, put, offset, payload.timestamp, &mut notifications)?
                }
                WriteOp::Delete(delete) => {
                    Self::apply_delete(&mut batch, delete, offset, &mut notifications)?
                }
                WriteOp::DeleteRange(range) => {
                    Self::apply_delete_range(&mut batch, range, offset, &mut notifications)?
                }
                WriteOp::Get(get) => Self::apply_get(&batch, get)?,
            };
            results.push(result);
        }

        batch.put(COMMIT_OFFSET_KEY, encode_offset(offset));
        batch.commit()?;

        debug!(
            shard = self.store.shard().get(),
            offset = offset.get(),
            ops = results.len(),
            "applied log payload"
        );

        Ok(ApplyOutcome {
            results,
            notifications: NotificationBatch::new(offset, notifications),
        })
    }

    /// Reads a key from committed state.
    ///
    /// # Errors
    /// Returns `KeyNotFound` for absent keys and for the reserved internal
    /// prefix.
    pub fn get(&self, key: &str) -> KvResult<GetResult> {
        if key.starts_with(INTERNAL_KEY_PREFIX) {
            return Err(KvError::KeyNotFound);
        }
        let handle = self.store.get(key)?;
        let entry = ValueEntry::decode(handle.into_bytes())?;
        Ok(GetResult {
            value: entry.value.clone(),
            version: entry.version_info(),
        })
    }

    /// Returns the last applied log offset, `Offset::INVALID` for a fresh
    /// database.
    ///
    /// # Errors
    /// Returns an error if the store is closed or the record is corrupt.
    pub fn applied_offset(&self) -> KvResult<Offset> {
        match self.store.get(COMMIT_OFFSET_KEY) {
            Ok(handle) => Ok(Offset::new(decode_i64(&handle)?)),
            Err(KvError::KeyNotFound) => Ok(Offset::INVALID),
            Err(e) => Err(e),
        }
    }

    /// Persists the fenced epoch, outside replication.
    ///
    /// # Errors
    /// Returns an error if the store is closed.
    pub fn update_term(&self, epoch: Epoch) -> KvResult<()> {
        let mut batch = self.store.new_write_batch();
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i64_le(epoch.get());
        batch.put(TERM_KEY, buf.freeze());
        batch.commit()
    }

    /// Returns the last fenced epoch, `Epoch::INITIAL` for a fresh database.
    ///
    /// # Errors
    /// Returns an error if the store is closed or the record is corrupt.
    pub fn term(&self) -> KvResult<Epoch> {
        match self.store.get(TERM_KEY) {
            Ok(handle) => Ok(Epoch::new(decode_i64(&handle)?)),
            Err(KvError::KeyNotFound) => Ok(Epoch::INITIAL),
            Err(e) => Err(e),
        }
    }

    fn apply_put(
        batch: &mut WriteBatch,
        put: &PutOp,
        offset: Offset,
        timestamp: u64,
        notifications: &mut Vec<Notification>,
    ) -> KvResult<OpResult> {
        let current = read_entry(batch, &put.key)?;

        if let Some(expected) = put.expected_version_id {
            let matches = current
                .as_ref()
                .map_or(expected == -1, |entry| entry.version_id == expected);
            if !matches {
                return Ok(OpResult::Put {
                    status: OpStatus::BadVersion,
                    version: None,
                });
            }
        }

        let (created_version_id, created_timestamp) = current.as_ref().map_or(
            (offset.get(), timestamp),
            |entry| (entry.created_version_id, entry.created_timestamp),
        );

        let entry = ValueEntry {
            value: put.value.clone(),
            version_id: offset.get(),
            created_version_id,
            created_timestamp,
            modified_timestamp: timestamp,
            session_id: put.session_id,
            client_identity: put.client_identity.clone(),
        };
        let version = entry.version_info();
        batch.put(&put.key, entry.encode());

        notifications.push(Notification {
            kind: if current.is_some() {
                NotificationKind::Modified
            } else {
                NotificationKind::Created
            },
            key: put.key.clone(),
            version_id: offset.get(),
        });

        Ok(OpResult::Put {
            status: OpStatus::Ok,
            version: Some(version),
        })
    }

    fn apply_delete(
        batch: &mut WriteBatch,
        delete: &DeleteOp,
        offset: Offset,
        notifications: &mut Vec<Notification>,
    ) -> KvResult<OpResult> {
        let Some(current) = read_entry(batch, &delete.key)? else {
            return Ok(OpResult::Delete {
                status: OpStatus::KeyNotFound,
            });
        };

        if let Some(expected) = delete.expected_version_id {
            if current.version_id != expected {
                return Ok(OpResult::Delete {
                    status: OpStatus::BadVersion,
                });
            }
        }

        batch.delete(&delete.key);
        notifications.push(Notification {
            kind: NotificationKind::Deleted,
            key: delete.key.clone(),
            version_id: offset.get(),
        });
        Ok(OpResult::Delete {
            status: OpStatus::Ok,
        })
    }

    fn apply_delete_range(
        batch: &mut WriteBatch,
        range: &DeleteRangeOp,
        offset: Offset,
        notifications: &mut Vec<Notification>,
    ) -> KvResult<OpResult> {
        // Enumerate through the batch view, keeping internal bookkeeping
        // keys out of reach of user ranges.
        let doomed: Vec<String> = batch
            .key_range_scan(&range.min_key_inclusive, &range.max_key_exclusive)?
            .filter(|key| !key.starts_with(INTERNAL_KEY_PREFIX))
            .collect();

        for key in doomed {
            batch.delete(&key);
            notifications.push(Notification {
                kind: NotificationKind::Deleted,
                key,
                version_id: offset.get(),
            });
        }
        Ok(OpResult::DeleteRange {
            status: OpStatus::Ok,
        })
    }

    fn apply_get(batch: &WriteBatch, get: &GetOp) -> KvResult<OpResult> {
        if get.key.starts_with(INTERNAL_KEY_PREFIX) {
            return Ok(OpResult::Get {
                status: OpStatus::KeyNotFound,
                value: None,
                version: None,
            });
        }
        match read_entry(batch, &get.key)? {
            Some(entry) => Ok(OpResult::Get {
                status: OpStatus::Ok,
                value: Some(entry.value.clone()),
                version: Some(entry.version_info()),
            }),
            None => Ok(OpResult::Get {
                status: OpStatus::KeyNotFound,
                value: None,
                version: None,
            }),
        }
    }

    /// Persists the current state as a new tablet generation.
    ///
    /// # Errors
    /// Returns an error if the tablet cannot be written.
    pub async fn flush(&self) -> KvResult<()> {
        self.store.flush().await
    }

    /// Flushes and closes the underlying store.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    pub async fn close(&self) -> KvResult<()> {
        self.store.close().await
    }

    /// Closes the store and deletes its on-disk state.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    pub async fn delete(&self) -> KvResult<()> {
        self.store.delete().await
    }
}

fn read_entry(batch: &WriteBatch, key: &str) -> KvResult<Option<ValueEntry>> {
    match batch.get(key) {
        Ok(handle) => Ok(Some(ValueEntry::decode(handle.into_bytes())?)),
        Err(KvError::KeyNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn encode_offset(offset: Offset) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(offset.get());
    buf.freeze()
}

fn decode_i64(data: &[u8]) -> KvResult<i64> {
    if data.len() != 8 {
        return Err(KvError::Corruption {
            path: std::path::PathBuf::new(),
            reason: "internal record has wrong length",
        });
    }
    let mut cursor = data;
    Ok(cursor.get_i64_le())
}
