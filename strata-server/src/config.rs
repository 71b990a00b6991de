//! Controller configuration.

use strata_wal::SegmentConfig;

/// Tuning knobs shared by the shard controllers on a node.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Segment sizing for shard WALs.
    pub segment_config: SegmentConfig,
    /// How far the leader lets the WAL grow past its low-water mark before
    /// flushing the database and trimming sealed segments every member has
    /// acked past. `0` disables trimming.
    pub wal_trim_threshold_entries: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            segment_config: SegmentConfig::new(),
            wal_trim_threshold_entries: 100_000,
        }
    }
}

impl ControllerConfig {
    /// Sets the WAL segment configuration.
    #[must_use]
    pub const fn with_segment_config(mut self, config: SegmentConfig) -> Self {
        self.segment_config = config;
        self
    }

    /// Sets the trim threshold; `0` disables trimming.
    #[must_use]
    pub const fn with_wal_trim_threshold(mut self, entries: u64) -> Self {
        self.wal_trim_threshold_entries = entries;
        self
    }
}
