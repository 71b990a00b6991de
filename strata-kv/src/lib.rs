//! Strata KV - ordered key/value engine and replication-aware database.
//!
//! Two layers live here:
//!
//! - The **engine** ([`KvFactory`], [`KvStore`], [`WriteBatch`]): an ordered
//!   map over slash-aware keys with atomic write batches, forward/reverse
//!   range iteration, durable tablet files, and chunked snapshot
//!   export/import.
//! - The **database** ([`Database`]): applies committed log payloads to the
//!   engine — one payload, one atomic batch — implementing version-id
//!   semantics, conditional operations, and change notifications.
//!
//! The engine is deliberately replication-blind; everything it knows about
//! offsets is the opaque commit-offset record the database writes through it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod comparator;
mod database;
mod error;
mod factory;
mod snapshot;
mod store;
mod tablet;
mod value;

pub use comparator::{compare_keys, SlashKey};
pub use database::{ApplyOutcome, Database, GetResult, COMMIT_OFFSET_KEY, INTERNAL_KEY_PREFIX, TERM_KEY};
pub use error::{KvError, KvResult};
pub use factory::{KvFactory, KvFactoryOptions};
pub use snapshot::{SnapshotChunk, SnapshotHandle, SnapshotLoader};
pub use store::{KeyIterator, KeyValueIterator, KvStore, ValueHandle, WriteBatch};
pub use value::ValueEntry;
