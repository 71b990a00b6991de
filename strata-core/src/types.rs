//! Strongly-typed identifiers for Strata entities.
//!
//! Log offsets and epochs are signed 64-bit values because the replication
//! protocol needs a "nothing yet" sentinel that crosses the wire and the disk
//! format: an empty WAL has head `-1`, an unfenced shard has epoch `-1`.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers around `i64`.
///
/// Each ID type provides:
/// - Type safety (a `ShardId` cannot be passed where an `Offset` is expected)
/// - Debug/Display formatting
/// - Zero-cost conversion to and from the raw value
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates a new ID from a raw i64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw i64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(ShardId, "shard", "Identifier of a key-range shard within a namespace.");
define_id!(Offset, "offset", "Dense position of an entry in a shard's replicated log.");
define_id!(Epoch, "epoch", "Leader term for a shard, issued by the coordinator.");

impl Offset {
    /// Sentinel for "no entry": the head of an empty log, an unknown
    /// follower ack, an unset commit watermark.
    pub const INVALID: Self = Self(-1);

    /// Returns true if this offset refers to an actual log entry.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the next offset in the log.
    ///
    /// `Offset::INVALID.next()` is offset 0, the first entry of a shard.
    ///
    /// # Panics
    /// Panics if the offset would overflow.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < i64::MAX, "offset overflow");
        Self(self.0 + 1)
    }

    /// Returns the previous offset, or `INVALID` below offset 0.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        if self.0 <= 0 {
            Self::INVALID
        } else {
            Self(self.0 - 1)
        }
    }
}

impl Epoch {
    /// Sentinel epoch of a shard that has never been fenced.
    pub const INITIAL: Self = Self(-1);

    /// Returns true if this epoch was issued by the coordinator.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Identity of a node in the cluster.
///
/// Nodes are addressed by an opaque string (typically `host:port`), assigned
/// by the coordinator. Equality is exact string equality.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identity from its address string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the address string.
    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Namespace grouping a set of shards under one key space.
pub type Namespace = String;

/// The namespace used when a client does not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";
