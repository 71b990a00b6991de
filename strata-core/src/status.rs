//! Per-operation result codes.

use std::fmt;

/// Outcome of a single operation within a write batch.
///
/// Per-op failures never fail the batch: a `BadVersion` put leaves every
/// other op in the batch untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation was applied (or, for gets, the key was found).
    Ok,
    /// A conditional op's expected version did not match the current version.
    BadVersion,
    /// The key does not exist.
    KeyNotFound,
}

impl OpStatus {
    /// Returns true for `Ok`.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::BadVersion => "bad version",
            Self::KeyNotFound => "key not found",
        };
        f.write_str(text)
    }
}
