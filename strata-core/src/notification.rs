//! Key-change notifications.
//!
//! Every committed mutation produces exactly one notification; batches are
//! published in commit (offset) order, so a subscriber replaying the stream
//! sees the same sequence of changes the engine applied.

use crate::types::Offset;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The key did not exist and was written.
    Created,
    /// The key existed and its value was replaced.
    Modified,
    /// The key was removed (point delete or range delete).
    Deleted,
}

/// A single committed key change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// The affected key.
    pub key: String,
    /// The version assigned to the change: the log offset at which it
    /// committed. Deletions carry the offset of the deleting entry.
    pub version_id: i64,
}

/// All notifications produced by one committed log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationBatch {
    /// The log offset of the entry that produced these changes.
    pub offset: Offset,
    /// Changes in the order the ops appeared in the batch.
    pub notifications: Vec<Notification>,
}

impl NotificationBatch {
    /// Creates a notification batch for a committed offset.
    #[must_use]
    pub const fn new(offset: Offset, notifications: Vec<Notification>) -> Self {
        Self {
            offset,
            notifications,
        }
    }
}
