//! Client error types.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors delivered to user call completions.
///
/// Completion callbacks fan one failure out to every call in a batch, so
/// the error is cloneable; server errors are carried as their rendered
/// message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The batcher (or its manager) has been closed.
    #[error("client batcher is closed")]
    AlreadyClosed,

    /// The server rejected or failed the batch.
    #[error("request failed: {message}")]
    Request {
        /// Rendered server-side error.
        message: String,
    },

    /// The server answered with the wrong number of per-op results.
    #[error("malformed response: expected {expected} results, got {actual}")]
    MalformedResponse {
        /// Ops submitted.
        expected: usize,
        /// Results received.
        actual: usize,
    },
}

impl ClientError {
    /// Wraps a server-side failure.
    pub fn request(err: impl std::fmt::Display) -> Self {
        Self::Request {
            message: err.to_string(),
        }
    }
}
