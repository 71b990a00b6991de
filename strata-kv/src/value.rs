//! Stored value format.
//!
//! The engine stores raw bytes; the database wraps every user value in a
//! `ValueEntry` carrying its version metadata. Format (little-endian):
//!
//! ```text
//! +---------+-------+------------+----------------+-------------+-------------+--------+
//! | version | flags | version_id | created_ver_id | created_ts  | modified_ts | value  |
//! | (1 byte)| (1 b) | (8 bytes)  | (8 bytes)      | (8 bytes)   | (8 bytes)   | (len+N)|
//! +---------+-------+------------+----------------+-------------+-------------+--------+
//! ```
//!
//! followed by optional `session_id` (8 bytes) and `client_identity`
//! (length-prefixed) when the corresponding flag bits are set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::{CodecError, CodecResult, VersionInfo};

const VALUE_FORMAT_VERSION: u8 = 1;

const FLAG_SESSION_ID: u8 = 1;
const FLAG_CLIENT_IDENTITY: u8 = 1 << 1;

/// A stored value with its version metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    /// The user payload.
    pub value: Bytes,
    /// Log offset of the committing write.
    pub version_id: i64,
    /// Log offset of the write that created the key.
    pub created_version_id: i64,
    /// Creation timestamp, milliseconds since the Unix epoch.
    pub created_timestamp: u64,
    /// Last-modification timestamp, milliseconds since the Unix epoch.
    pub modified_timestamp: u64,
    /// Owning session for ephemeral records.
    pub session_id: Option<i64>,
    /// Identity of the last writer.
    pub client_identity: Option<String>,
}

impl ValueEntry {
    /// Returns the version metadata view of this entry.
    #[must_use]
    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            version_id: self.version_id,
            created_version_id: self.created_version_id,
            created_timestamp: self.created_timestamp,
            modified_timestamp: self.modified_timestamp,
            session_id: self.session_id,
            client_identity: self.client_identity.clone(),
        }
    }

    /// Encodes the entry to engine bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(38 + self.value.len() + 16);
        buf.put_u8(VALUE_FORMAT_VERSION);

        let mut flags = 0u8;
        if self.session_id.is_some() {
            flags |= FLAG_SESSION_ID;
        }
        if self.client_identity.is_some() {
            flags |= FLAG_CLIENT_IDENTITY;
        }
        buf.put_u8(flags);

        buf.put_i64_le(self.version_id);
        buf.put_i64_le(self.created_version_id);
        buf.put_u64_le(self.created_timestamp);
        buf.put_u64_le(self.modified_timestamp);
        // Value sizes are bounded at the client edge.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);

        if let Some(session) = self.session_id {
            buf.put_i64_le(session);
        }
        if let Some(identity) = &self.client_identity {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(identity.len() as u32);
            buf.put_slice(identity.as_bytes());
        }

        buf.freeze()
    }

    /// Decodes an entry from engine bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes are truncated or malformed.
    pub fn decode(mut data: Bytes) -> CodecResult<Self> {
        if data.remaining() < 38 {
            return Err(CodecError::Truncated {
                field: "value entry header",
                needed: 38 - data.remaining(),
            });
        }

        let format = data.get_u8();
        if format != VALUE_FORMAT_VERSION {
            return Err(CodecError::UnknownTag {
                field: "value format version",
                tag: format,
            });
        }

        let flags = data.get_u8();
        let version_id = data.get_i64_le();
        let created_version_id = data.get_i64_le();
        let created_timestamp = data.get_u64_le();
        let modified_timestamp = data.get_u64_le();

        let value_len = data.get_u32_le() as usize;
        if data.remaining() < value_len {
            return Err(CodecError::Truncated {
                field: "value payload",
                needed: value_len - data.remaining(),
            });
        }
        let value = data.copy_to_bytes(value_len);

        let session_id = if flags & FLAG_SESSION_ID != 0 {
            if data.remaining() < 8 {
                return Err(CodecError::Truncated {
                    field: "session_id",
                    needed: 8 - data.remaining(),
                });
            }
            Some(data.get_i64_le())
        } else {
            None
        };

        let client_identity = if flags & FLAG_CLIENT_IDENTITY != 0 {
            if data.remaining() < 4 {
                return Err(CodecError::Truncated {
                    field: "client_identity",
                    needed: 4 - data.remaining(),
                });
            }
            let len = data.get_u32_le() as usize;
            if data.remaining() < len {
                return Err(CodecError::Truncated {
                    field: "client_identity",
                    needed: len - data.remaining(),
                });
            }
            let raw = data.copy_to_bytes(len);
            Some(
                String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 {
                    field: "client_identity",
                })?,
            )
        } else {
            None
        };

        Ok(Self {
            value,
            version_id,
            created_version_id,
            created_timestamp,
            modified_timestamp,
            session_id,
            client_identity,
        })
    }
}
