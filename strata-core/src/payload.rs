//! The log-entry payload: one batch of write operations.
//!
//! A `WriteBatchPayload` is the unit of replication. The leader encodes one
//! per assigned offset; leader and followers decode and apply it atomically.
//!
//! The payload carries the leader-assigned wall-clock timestamp so that
//! value timestamps are identical on every replica: apply is a deterministic
//! function of the log alone.
//!
//! Framing:
//!
//! ```text
//! +---------+-----------+----------+----------------+
//! | version | timestamp | op count | ops ...        |
//! | (1 byte)| (8 bytes) | (4 bytes)|                |
//! +---------+-----------+----------+----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, CodecResult};
use crate::limits::WRITE_BATCH_OPS_MAX;
use crate::op::WriteOp;

const PAYLOAD_VERSION: u8 = 1;

/// A batch of write operations replicated as a single log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteBatchPayload {
    /// Leader-assigned wall-clock timestamp (milliseconds since the Unix
    /// epoch); becomes the creation/modification timestamp of every value
    /// this batch writes.
    pub timestamp: u64,
    /// Operations in submission order.
    pub ops: Vec<WriteOp>,
}

impl WriteBatchPayload {
    /// Creates a payload from a timestamp and a list of operations.
    #[must_use]
    pub fn new(timestamp: u64, ops: Vec<WriteOp>) -> Self {
        Self { timestamp, ops }
    }

    /// Returns the number of operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Encodes the payload to bytes for WAL append and replication.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let size = 13 + self
            .ops
            .iter()
            .map(WriteOp::encoded_size)
            .sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(PAYLOAD_VERSION);
        buf.put_u64_le(self.timestamp);
        // Op count bounded by WRITE_BATCH_OPS_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            op.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes a payload from log-entry bytes.
    ///
    /// # Errors
    /// Returns an error on truncation, unknown versions, or over-limit counts.
    pub fn decode(mut data: Bytes) -> CodecResult<Self> {
        if data.remaining() < 13 {
            return Err(CodecError::Truncated {
                field: "payload header",
                needed: 13 - data.remaining(),
            });
        }
        let version = data.get_u8();
        if version != PAYLOAD_VERSION {
            return Err(CodecError::UnknownTag {
                field: "payload version",
                tag: version,
            });
        }
        let timestamp = data.get_u64_le();
        let count = data.get_u32_le();
        if count > WRITE_BATCH_OPS_MAX {
            return Err(CodecError::LengthLimit {
                field: "op count",
                length: u64::from(count),
                limit: u64::from(WRITE_BATCH_OPS_MAX),
            });
        }
        let mut ops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ops.push(WriteOp::decode(&mut data)?);
        }
        Ok(Self { timestamp, ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{DeleteOp, GetOp, PutOp};

    #[test]
    fn test_payload_roundtrip() {
        let payload = WriteBatchPayload::new(1_700_000_000_000, vec![
            WriteOp::Put(PutOp {
                key: "/a".to_string(),
                value: Bytes::from_static(b"1"),
                expected_version_id: None,
                session_id: None,
                client_identity: None,
            }),
            WriteOp::Delete(DeleteOp {
                key: "/b".to_string(),
                expected_version_id: Some(3),
            }),
            WriteOp::Get(GetOp {
                key: "/c".to_string(),
            }),
        ]);

        let encoded = payload.encode();
        let decoded = WriteBatchPayload::decode(encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_payload() {
        let payload = WriteBatchPayload::default();
        assert!(payload.is_empty());
        let decoded = WriteBatchPayload::decode(payload.encode()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xAB);
        buf.put_u64_le(0);
        buf.put_u32_le(0);
        let result = WriteBatchPayload::decode(buf.freeze());
        assert!(matches!(result, Err(CodecError::UnknownTag { .. })));
    }

    #[test]
    fn test_op_count_limit() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u64_le(0);
        buf.put_u32_le(WRITE_BATCH_OPS_MAX + 1);
        let result = WriteBatchPayload::decode(buf.freeze());
        assert!(matches!(result, Err(CodecError::LengthLimit { .. })));
    }
}
