//! Write operations: the tagged commands carried inside a log entry.
//!
//! Operations are encoded with a one-byte tag followed by length-prefixed
//! fields, little-endian throughout:
//!
//! ```text
//! +-----+-------+----------------------------------+
//! | tag | flags | length-prefixed fields           |
//! +-----+-------+----------------------------------+
//! ```
//!
//! `flags` marks which optional fields are present, so absent options cost
//! one bit instead of a sentinel value on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, CodecResult};
use crate::limits::{KEY_SIZE_BYTES_MAX, VALUE_SIZE_BYTES_MAX};

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;
const TAG_DELETE_RANGE: u8 = 2;
const TAG_GET: u8 = 3;

const FLAG_EXPECTED_VERSION: u8 = 1;
const FLAG_SESSION_ID: u8 = 1 << 1;
const FLAG_CLIENT_IDENTITY: u8 = 1 << 2;

/// Stores a value under a key, optionally guarded by an expected version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOp {
    /// The key to write.
    pub key: String,
    /// The value payload.
    pub value: Bytes,
    /// If set, the put only succeeds when the key's current version matches;
    /// `-1` means the key must not exist yet.
    pub expected_version_id: Option<i64>,
    /// Session that owns this key (ephemeral records), if any.
    pub session_id: Option<i64>,
    /// Identity of the writing client, if provided.
    pub client_identity: Option<String>,
}

/// Removes a key, optionally guarded by an expected version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOp {
    /// The key to remove.
    pub key: String,
    /// If set, the delete only succeeds when the key's current version matches.
    pub expected_version_id: Option<i64>,
}

/// Removes every key in `[min_key_inclusive, max_key_exclusive)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRangeOp {
    /// Lower bound of the range, inclusive.
    pub min_key_inclusive: String,
    /// Upper bound of the range, exclusive.
    pub max_key_exclusive: String,
}

/// Reads a key through the write path, seeing earlier ops in the same batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOp {
    /// The key to read.
    pub key: String,
}

/// A single tagged write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Store a value.
    Put(PutOp),
    /// Remove a key.
    Delete(DeleteOp),
    /// Remove a key range.
    DeleteRange(DeleteRangeOp),
    /// Read a key within the batch.
    Get(GetOp),
}

impl WriteOp {
    /// Returns the encoded size of this op in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Put(op) => {
                2 + 4
                    + op.key.len()
                    + 4
                    + op.value.len()
                    + op.expected_version_id.map_or(0, |_| 8)
                    + op.session_id.map_or(0, |_| 8)
                    + op
                        .client_identity
                        .as_ref()
                        .map_or(0, |identity| 4 + identity.len())
            }
            Self::Delete(op) => {
                2 + 4 + op.key.len() + op.expected_version_id.map_or(0, |_| 8)
            }
            Self::DeleteRange(op) => {
                1 + 4 + op.min_key_inclusive.len() + 4 + op.max_key_exclusive.len()
            }
            Self::Get(op) => 1 + 4 + op.key.len(),
        }
    }

    /// Encodes the op to the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Put(op) => {
                buf.put_u8(TAG_PUT);
                let mut flags = 0u8;
                if op.expected_version_id.is_some() {
                    flags |= FLAG_EXPECTED_VERSION;
                }
                if op.session_id.is_some() {
                    flags |= FLAG_SESSION_ID;
                }
                if op.client_identity.is_some() {
                    flags |= FLAG_CLIENT_IDENTITY;
                }
                buf.put_u8(flags);
                put_str(buf, &op.key);
                put_bytes(buf, &op.value);
                if let Some(version) = op.expected_version_id {
                    buf.put_i64_le(version);
                }
                if let Some(session) = op.session_id {
                    buf.put_i64_le(session);
                }
                if let Some(identity) = &op.client_identity {
                    put_str(buf, identity);
                }
            }
            Self::Delete(op) => {
                buf.put_u8(TAG_DELETE);
                let flags = if op.expected_version_id.is_some() {
                    FLAG_EXPECTED_VERSION
                } else {
                    0
                };
                buf.put_u8(flags);
                put_str(buf, &op.key);
                if let Some(version) = op.expected_version_id {
                    buf.put_i64_le(version);
                }
            }
            Self::DeleteRange(op) => {
                buf.put_u8(TAG_DELETE_RANGE);
                put_str(buf, &op.min_key_inclusive);
                put_str(buf, &op.max_key_exclusive);
            }
            Self::Get(op) => {
                buf.put_u8(TAG_GET);
                put_str(buf, &op.key);
            }
        }
    }

    /// Decodes an op from the buffer.
    ///
    /// # Errors
    /// Returns an error if the frame is truncated or carries an unknown tag.
    pub fn decode(buf: &mut impl Buf) -> CodecResult<Self> {
        let tag = get_u8(buf, "op tag")?;
        match tag {
            TAG_PUT => {
                let flags = get_u8(buf, "put flags")?;
                let key = get_str(buf, "key", KEY_SIZE_BYTES_MAX)?;
                let value = get_bytes(buf, "value", VALUE_SIZE_BYTES_MAX)?;
                let expected_version_id = if flags & FLAG_EXPECTED_VERSION != 0 {
                    Some(get_i64(buf, "expected_version_id")?)
                } else {
                    None
                };
                let session_id = if flags & FLAG_SESSION_ID != 0 {
                    Some(get_i64(buf, "session_id")?)
                } else {
                    None
                };
                let client_identity = if flags & FLAG_CLIENT_IDENTITY != 0 {
                    Some(get_str(buf, "client_identity", KEY_SIZE_BYTES_MAX)?)
                } else {
                    None
                };
                Ok(Self::Put(PutOp {
                    key,
                    value,
                    expected_version_id,
                    session_id,
                    client_identity,
                }))
            }
            TAG_DELETE => {
                let flags = get_u8(buf, "delete flags")?;
                let key = get_str(buf, "key", KEY_SIZE_BYTES_MAX)?;
                let expected_version_id = if flags & FLAG_EXPECTED_VERSION != 0 {
                    Some(get_i64(buf, "expected_version_id")?)
                } else {
                    None
                };
                Ok(Self::Delete(DeleteOp {
                    key,
                    expected_version_id,
                }))
            }
            TAG_DELETE_RANGE => {
                let min_key_inclusive = get_str(buf, "min_key_inclusive", KEY_SIZE_BYTES_MAX)?;
                let max_key_exclusive = get_str(buf, "max_key_exclusive", KEY_SIZE_BYTES_MAX)?;
                Ok(Self::DeleteRange(DeleteRangeOp {
                    min_key_inclusive,
                    max_key_exclusive,
                }))
            }
            TAG_GET => {
                let key = get_str(buf, "key", KEY_SIZE_BYTES_MAX)?;
                Ok(Self::Get(GetOp { key }))
            }
            tag => Err(CodecError::UnknownTag {
                field: "WriteOp",
                tag,
            }),
        }
    }

    /// Returns true if this op mutates state (everything but `Get`).
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get(_))
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // Lengths are bounded by the limits checked at the client edge.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &Bytes) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn get_u8(buf: &mut impl Buf, field: &'static str) -> CodecResult<u8> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated { field, needed: 1 });
    }
    Ok(buf.get_u8())
}

fn get_i64(buf: &mut impl Buf, field: &'static str) -> CodecResult<i64> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated {
            field,
            needed: 8 - buf.remaining(),
        });
    }
    Ok(buf.get_i64_le())
}

fn get_bytes(buf: &mut impl Buf, field: &'static str, limit: u32) -> CodecResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated {
            field,
            needed: 4 - buf.remaining(),
        });
    }
    let length = buf.get_u32_le();
    if length > limit {
        return Err(CodecError::LengthLimit {
            field,
            length: u64::from(length),
            limit: u64::from(limit),
        });
    }
    let length = length as usize;
    if buf.remaining() < length {
        return Err(CodecError::Truncated {
            field,
            needed: length - buf.remaining(),
        });
    }
    Ok(buf.copy_to_bytes(length))
}

fn get_str(buf: &mut impl Buf, field: &'static str, limit: u32) -> CodecResult<String> {
    let raw = get_bytes(buf, field, limit)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(op: &WriteOp) -> WriteOp {
        let mut buf = BytesMut::new();
        op.encode(&mut buf);
        assert_eq!(buf.len(), op.encoded_size());
        WriteOp::decode(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn test_put_roundtrip_full() {
        let op = WriteOp::Put(PutOp {
            key: "/a/b".to_string(),
            value: Bytes::from_static(b"hello"),
            expected_version_id: Some(7),
            session_id: Some(99),
            client_identity: Some("client-1".to_string()),
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn test_put_roundtrip_minimal() {
        let op = WriteOp::Put(PutOp {
            key: "k".to_string(),
            value: Bytes::new(),
            expected_version_id: None,
            session_id: None,
            client_identity: None,
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn test_delete_roundtrip() {
        let op = WriteOp::Delete(DeleteOp {
            key: "/x".to_string(),
            expected_version_id: Some(-1),
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn test_delete_range_roundtrip() {
        let op = WriteOp::DeleteRange(DeleteRangeOp {
            min_key_inclusive: "/a".to_string(),
            max_key_exclusive: "/b".to_string(),
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn test_get_roundtrip() {
        let op = WriteOp::Get(GetOp {
            key: "/k".to_string(),
        });
        assert_eq!(roundtrip(&op), op);
        assert!(!op.is_mutation());
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        let result = WriteOp::decode(&mut buf.freeze());
        assert!(matches!(result, Err(CodecError::UnknownTag { tag: 0xFF, .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let op = WriteOp::Get(GetOp {
            key: "/some/key".to_string(),
        });
        let mut buf = BytesMut::new();
        op.encode(&mut buf);
        buf.truncate(buf.len() - 3);
        let result = WriteOp::decode(&mut buf.freeze());
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_value_over_limit_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(super::TAG_PUT);
        buf.put_u8(0);
        put_str(&mut buf, "k");
        buf.put_u32_le(VALUE_SIZE_BYTES_MAX + 1);
        let result = WriteOp::decode(&mut buf.freeze());
        assert!(matches!(result, Err(CodecError::LengthLimit { .. })));
    }
}
