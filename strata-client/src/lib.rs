//! Strata Client - per-shard coalescing of user calls into write batches.
//!
//! Each user call (put, delete, delete-range, batched get) carries a
//! one-shot completion resolved exactly once, with either its per-op result
//! or an error. A [`ShardBatcher`] accumulates calls for one shard and
//! flushes on a size threshold, a linger deadline, or an explicit flush,
//! preserving submission order within and across batches. The
//! [`BatcherManager`] creates batchers on first use.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batcher;
mod call;
mod error;
mod manager;

pub use batcher::{BatcherConfig, ShardBatcher, ShardWriteSink};
pub use call::{CallResult, DeleteCall, DeleteRangeCall, GetCall, PutCall, WriteCall};
pub use error::{ClientError, ClientResult};
pub use manager::BatcherManager;
