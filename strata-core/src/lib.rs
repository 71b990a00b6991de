//! Strata Core - shared types and wire model for the Strata key/value store.
//!
//! Strata partitions a namespaced key space into shards; each shard is a
//! replicated log materialized into an ordered key/value engine. This crate
//! holds what every layer of that pipeline agrees on:
//!
//! - Strongly-typed identifiers (`ShardId`, `NodeId`, `Epoch`, `Offset`)
//! - Explicit system limits
//! - The write-operation model and the log-entry payload codec
//! - Notification and per-operation status types

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
pub mod limits;
mod notification;
mod op;
mod payload;
mod result;
mod status;
mod types;
mod version;

pub use error::{CodecError, CodecResult};
pub use notification::{Notification, NotificationBatch, NotificationKind};
pub use op::{DeleteOp, DeleteRangeOp, GetOp, PutOp, WriteOp};
pub use payload::WriteBatchPayload;
pub use result::OpResult;
pub use status::OpStatus;
pub use types::{Epoch, Namespace, NodeId, Offset, ShardId, DEFAULT_NAMESPACE};
pub use version::VersionInfo;
