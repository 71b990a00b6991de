//! System-wide limits.
//!
//! Every queue, buffer, and payload has an explicit maximum size so that
//! resource usage is bounded and rejection happens at the edge, not deep in
//! the pipeline.

/// Maximum length of a key in bytes.
pub const KEY_SIZE_BYTES_MAX: u32 = 16 * 1024;

/// Maximum size of a single value in bytes.
pub const VALUE_SIZE_BYTES_MAX: u32 = 4 * 1024 * 1024;

/// Maximum number of operations in one replicated write batch.
pub const WRITE_BATCH_OPS_MAX: u32 = 1000;

/// Maximum encoded size of one replicated write batch in bytes.
pub const WRITE_BATCH_SIZE_BYTES_MAX: u32 = 8 * 1024 * 1024;

/// Capacity of a controller's command channel.
pub const CONTROLLER_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of a per-follower replication send queue.
pub const REPLICATION_QUEUE_CAPACITY: usize = 256;

/// Number of notification batches buffered per subscriber before lagging.
pub const NOTIFICATION_BUFFER_BATCHES: usize = 1024;

/// Maximum size of one snapshot chunk in bytes.
pub const SNAPSHOT_CHUNK_SIZE_BYTES_MAX: u32 = 1024 * 1024;
