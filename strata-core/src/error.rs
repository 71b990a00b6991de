//! Codec errors for the wire model.

use thiserror::Error;

/// Result type for encode/decode operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while decoding wire or log frames.
///
/// Payload bytes reaching a decoder have already passed the WAL's CRC check,
/// so a decode failure here means a framing bug or corruption introduced
/// after checksumming; callers treat it as fatal for the shard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer ended before the frame was complete.
    #[error("truncated frame: needed {needed} more bytes for {field}")]
    Truncated {
        /// Which field was being decoded.
        field: &'static str,
        /// How many more bytes were required.
        needed: usize,
    },

    /// An unknown tag byte was encountered.
    #[error("unknown tag {tag} for {field}")]
    UnknownTag {
        /// Which enum was being decoded.
        field: &'static str,
        /// The unrecognized tag value.
        tag: u8,
    },

    /// A length prefix exceeded the corresponding limit.
    #[error("{field} length {length} exceeds limit {limit}")]
    LengthLimit {
        /// Which field carried the oversized length.
        field: &'static str,
        /// The declared length.
        length: u64,
        /// The maximum allowed length.
        limit: u64,
    },

    /// A string field was not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Which field failed validation.
        field: &'static str,
    },
}
