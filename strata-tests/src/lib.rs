//! Strata Tests - cross-crate integration tests for the replication
//! pipeline.
//!
//! Test modules are organized by concern:
//!
//! - `memory_rpc`: in-process replication transport wiring leaders straight
//!   to follower controllers
//! - `cluster`: multi-node fixture (directors + transport + data dirs)
//! - `scenarios`: end-to-end flows (writes, failover, catch-up, snapshots)
//! - `properties`: cross-crate invariants (replay equivalence, ordering)

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod memory_rpc;

// Test modules (only compiled for tests).
#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;

/// Installs a formatted test subscriber once; later calls are no-ops.
/// Filter with `RUST_LOG`, e.g. `RUST_LOG=strata_server=debug`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
