//! Value version metadata returned to clients.

/// Metadata attached to a stored value.
///
/// `version_id` equals the log offset at which the most recent write of the
/// key committed; it is strictly greater than any earlier version of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Log offset of the committing write.
    pub version_id: i64,
    /// Log offset of the write that created the key.
    pub created_version_id: i64,
    /// Milliseconds since the Unix epoch when the key was created.
    pub created_timestamp: u64,
    /// Milliseconds since the Unix epoch of the last modification.
    pub modified_timestamp: u64,
    /// Session that owns the key, if it is ephemeral.
    pub session_id: Option<i64>,
    /// Identity of the last writing client, if recorded.
    pub client_identity: Option<String>,
}
