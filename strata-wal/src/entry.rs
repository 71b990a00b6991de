//! Log record framing.
//!
//! Every record is one self-checking frame, little-endian:
//!
//! ```text
//! +----------+----------+----------+----------+------------+
//! |  CRC32   |  Length  |  Epoch   |  Offset  |  Payload   |
//! | (4 bytes)| (4 bytes)| (8 bytes)| (8 bytes)| (N bytes)  |
//! +----------+----------+----------+----------+------------+
//! ```
//!
//! The CRC covers everything after itself, so a frame is either read back
//! whole and intact or rejected. A frame cut short by a crash decodes as
//! [`WalError::TruncatedEntry`], which recovery treats as the torn tail of
//! the log; a frame whose bytes are present but wrong decodes as
//! corruption, which recovery must not skip past.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::{Epoch, Offset};

use crate::error::{WalError, WalResult};
use crate::limits::ENTRY_PAYLOAD_SIZE_BYTES_MAX;

/// Bytes of frame metadata ahead of the payload (CRC, length, epoch,
/// offset).
pub const FRAME_PROLOGUE_SIZE: usize = 24;

/// One log record: a replicated write batch at a position in the shard log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    epoch: Epoch,
    offset: Offset,
    payload: Bytes,
}

impl Entry {
    /// Creates an entry for the given log position.
    ///
    /// # Errors
    /// Returns `EntryTooLarge` if the payload exceeds the frame limit.
    pub fn new(epoch: Epoch, offset: Offset, payload: Bytes) -> WalResult<Self> {
        if payload.len() > ENTRY_PAYLOAD_SIZE_BYTES_MAX as usize {
            // Reported size saturates; the exact overshoot is not useful.
            #[allow(clippy::cast_possible_truncation)]
            return Err(WalError::EntryTooLarge {
                size: payload.len().min(u32::MAX as usize) as u32,
                max: ENTRY_PAYLOAD_SIZE_BYTES_MAX,
            });
        }
        debug_assert!(offset.is_valid(), "entries carry real log positions");

        Ok(Self {
            epoch,
            offset,
            payload,
        })
    }

    /// Returns the leader epoch that produced this entry.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Returns the log position of this entry.
    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Returns the encoded write-batch payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Unwraps the entry into its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the on-disk size of the whole frame.
    #[must_use]
    pub fn frame_size(&self) -> u64 {
        FRAME_PROLOGUE_SIZE as u64 + self.payload.len() as u64
    }

    /// Appends the encoded frame to `buf`.
    ///
    /// The CRC slot is written last, computed over the rest of the frame as
    /// it landed in the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        let crc_slot = buf.len();
        buf.put_u32_le(0);
        // Payload length is bounded by ENTRY_PAYLOAD_SIZE_BYTES_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_i64_le(self.epoch.get());
        buf.put_i64_le(self.offset.get());
        buf.put_slice(&self.payload);

        let crc = crc32fast::hash(&buf[crc_slot + 4..]);
        buf[crc_slot..crc_slot + 4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Splits one verified frame off the front of `data`.
    ///
    /// The payload aliases `data` (no copy). On any error `data` is left
    /// untouched, so recovery can decide what the remaining bytes mean;
    /// `file_offset` is where the frame starts within its file, for error
    /// reporting.
    ///
    /// # Errors
    /// `TruncatedEntry` if the buffer ends mid-frame, `InvalidHeader` for
    /// structurally impossible metadata, `ChecksumMismatch` for corruption.
    pub fn decode(data: &mut Bytes, file_offset: u64) -> WalResult<Self> {
        if data.len() < FRAME_PROLOGUE_SIZE {
            #[allow(clippy::cast_possible_truncation)]
            return Err(WalError::TruncatedEntry {
                file_offset,
                expected: FRAME_PROLOGUE_SIZE as u32,
                found: data.len() as u32,
            });
        }

        let stored_crc = (&data[0..4]).get_u32_le();
        let payload_len = (&data[4..8]).get_u32_le();
        if payload_len > ENTRY_PAYLOAD_SIZE_BYTES_MAX {
            return Err(WalError::InvalidHeader {
                file_offset,
                reason: "payload length exceeds maximum",
            });
        }

        let frame_len = FRAME_PROLOGUE_SIZE + payload_len as usize;
        if data.len() < frame_len {
            #[allow(clippy::cast_possible_truncation)]
            return Err(WalError::TruncatedEntry {
                file_offset,
                expected: frame_len as u32,
                found: data.len() as u32,
            });
        }

        let computed_crc = crc32fast::hash(&data[4..frame_len]);
        if computed_crc != stored_crc {
            return Err(WalError::ChecksumMismatch {
                file_offset,
                expected: computed_crc,
                actual: stored_crc,
            });
        }

        let epoch = Epoch::new((&data[8..16]).get_i64_le());
        let offset = Offset::new((&data[16..24]).get_i64_le());
        if !offset.is_valid() {
            return Err(WalError::InvalidHeader {
                file_offset,
                reason: "negative offset",
            });
        }

        let mut frame = data.split_to(frame_len);
        frame.advance(FRAME_PROLOGUE_SIZE);
        Ok(Self {
            epoch,
            offset,
            payload: frame,
        })
    }
}
