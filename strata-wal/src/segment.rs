//! WAL segment management.
//!
//! A segment mirrors one log file: a fixed header naming its first offset,
//! followed by a contiguous run of entry frames. Because offsets are dense,
//! a segment never searches for an entry — every position is arithmetic on
//! the first offset — and decoding can insist that the frames on disk are
//! gap-free.
//!
//! Segments rotate when full and are sealed after rotation; a sealed
//! segment only changes through tail truncation, after which the owning
//! log rewrites its file.
//!
//! # Segment File Format
//!
//! ```text
//! +-------------------+
//! | Segment Header    |  (32 bytes: magic, version, id, first offset)
//! +-------------------+
//! | Entry frames ...  |
//! +-------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::Offset;

use crate::entry::Entry;
use crate::error::{WalError, WalResult};
use crate::limits::{ENTRIES_PER_SEGMENT_MAX, SEGMENT_SIZE_BYTES_MAX};

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Magic bytes identifying a Strata WAL segment.
const SEGMENT_MAGIC: &[u8; 8] = b"STRATAWL";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Unique identifier for a segment within one shard's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next segment ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg-{:08x}", self.0)
    }
}

/// Rotation limits for a segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Maximum size of the segment in bytes.
    pub max_size_bytes: u64,
    /// Maximum number of entries in the segment.
    pub max_entries: u64,
}

impl SegmentConfig {
    /// Creates a new segment configuration with defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size_bytes: SEGMENT_SIZE_BYTES_MAX,
            max_entries: ENTRIES_PER_SEGMENT_MAX,
        }
    }

    /// Sets the maximum number of entries per segment. Small values force
    /// frequent rotation, which tests use to exercise sealing and trim.
    ///
    /// # Panics
    /// Panics if entries is 0 or exceeds the limit.
    #[must_use]
    pub const fn with_max_entries(mut self, entries: u64) -> Self {
        assert!(
            entries > 0 && entries <= ENTRIES_PER_SEGMENT_MAX,
            "segment entry limit out of range"
        );
        self.max_entries = entries;
        self
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment header stored at the beginning of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u32,
    /// Unique segment identifier.
    pub segment_id: SegmentId,
    /// First log offset in this segment.
    pub first_offset: Offset,
}

impl SegmentHeader {
    /// Creates a new segment header.
    #[must_use]
    pub const fn new(segment_id: SegmentId, first_offset: Offset) -> Self {
        Self {
            version: SEGMENT_VERSION,
            segment_id,
            first_offset,
        }
    }

    /// Encodes the header to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.segment_id.get());
        buf.put_i64_le(self.first_offset.get());
        buf.put_u32_le(0); // Reserved
    }

    /// Decodes a header from bytes.
    ///
    /// # Errors
    /// Returns an error if the data is invalid.
    pub fn decode(buf: &mut impl Buf) -> WalResult<Self> {
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(WalError::InvalidHeader {
                file_offset: 0,
                reason: "segment header too small",
            });
        }

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(WalError::InvalidHeader {
                file_offset: 0,
                reason: "invalid segment magic",
            });
        }

        let version = buf.get_u32_le();
        if version != SEGMENT_VERSION {
            return Err(WalError::InvalidHeader {
                file_offset: 0,
                reason: "unsupported segment version",
            });
        }

        let segment_id = SegmentId::new(buf.get_u64_le());
        let first_offset = Offset::new(buf.get_i64_le());
        let _reserved = buf.get_u32_le();

        Ok(Self {
            version,
            segment_id,
            first_offset,
        })
    }
}

/// In-memory mirror of one segment file.
///
/// Invariant: `entries[i]` is the entry at offset `first_offset + i`; the
/// log enforces density before anything reaches a segment.
#[derive(Debug, Clone)]
pub struct Segment {
    header: SegmentHeader,
    config: SegmentConfig,
    entries: Vec<Entry>,
    size_bytes: u64,
    sealed: bool,
}

impl Segment {
    /// Creates a new empty segment starting at `first_offset`.
    #[must_use]
    pub const fn new(segment_id: SegmentId, first_offset: Offset, config: SegmentConfig) -> Self {
        Self {
            header: SegmentHeader::new(segment_id, first_offset),
            config,
            entries: Vec::new(),
            size_bytes: SEGMENT_HEADER_SIZE as u64,
            sealed: false,
        }
    }

    /// Returns the segment ID.
    #[must_use]
    pub const fn id(&self) -> SegmentId {
        self.header.segment_id
    }

    /// Returns the first offset this segment covers.
    #[must_use]
    pub const fn first_offset(&self) -> Offset {
        self.header.first_offset
    }

    /// Returns the offset the next pushed entry must carry.
    #[must_use]
    pub fn next_offset(&self) -> Offset {
        // Entry counts are far below i64 range.
        #[allow(clippy::cast_possible_wrap)]
        Offset::new(self.header.first_offset.get() + self.entries.len() as i64)
    }

    /// Returns the last offset held, or `Offset::INVALID` if empty.
    #[must_use]
    pub fn last_offset(&self) -> Offset {
        if self.entries.is_empty() {
            Offset::INVALID
        } else {
            Offset::new(self.next_offset().get() - 1)
        }
    }

    /// Returns the number of entries held.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns true if the segment holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the encoded size (header plus frames) in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true if the segment is sealed (rotation happened).
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns true if a frame of the given size still fits.
    #[must_use]
    pub fn accepts(&self, frame_size: u64) -> bool {
        !self.sealed
            && self.entry_count() < self.config.max_entries
            && self.size_bytes + frame_size <= self.config.max_size_bytes
    }

    /// Takes the next entry. The caller has already checked [`accepts`]
    /// (`Self::accepts`) and log-level contiguity, so violations here are
    /// bugs, not runtime conditions.
    pub fn push(&mut self, entry: Entry) {
        debug_assert!(!self.sealed, "push after seal");
        debug_assert_eq!(entry.offset(), self.next_offset(), "segment entries are dense");

        self.size_bytes += entry.frame_size();
        self.entries.push(entry);
    }

    /// Looks up the entry at `offset`, `None` outside this segment's range.
    #[must_use]
    pub fn entry_at(&self, offset: Offset) -> Option<&Entry> {
        if offset < self.header.first_offset {
            return None;
        }
        let index = usize::try_from(offset.get() - self.header.first_offset.get()).ok()?;
        self.entries.get(index)
    }

    /// Returns the entries at and above `from`, in offset order.
    #[must_use]
    pub fn entries_from(&self, from: Offset) -> &[Entry] {
        if from <= self.header.first_offset {
            return &self.entries;
        }
        let Ok(start) = usize::try_from(from.get() - self.header.first_offset.get()) else {
            return &[];
        };
        self.entries.get(start..).unwrap_or(&[])
    }

    /// Drops every entry strictly above `offset`, on sealed and active
    /// segments alike; the owning log rewrites the file afterwards.
    pub fn truncate_above(&mut self, offset: Offset) {
        let keep = if offset < self.header.first_offset {
            0
        } else {
            usize::try_from(offset.get() - self.header.first_offset.get() + 1)
                .map_or(self.entries.len(), |n| n.min(self.entries.len()))
        };

        let removed: u64 = self.entries.drain(keep..).map(|e| e.frame_size()).sum();
        self.size_bytes -= removed;
    }

    /// Seals the segment; rotation is one-way.
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    /// Encodes the whole segment (header plus frames) to file bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // size_bytes tracks the encoded size exactly.
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = BytesMut::with_capacity(self.size_bytes as usize);
        self.header.encode(&mut buf);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes a segment from file bytes.
    ///
    /// Frames must continue densely from the header's first offset; a gap
    /// means the file was tampered with or mixed up, not torn, and is
    /// corruption. A frame cut short at the end of the data is the torn
    /// tail of a crash: decoding stops there and recovery proceeds with
    /// the shorter segment.
    ///
    /// # Errors
    /// Returns an error for an invalid header, a non-tail corrupt frame,
    /// or an offset gap.
    pub fn decode(mut data: Bytes, config: SegmentConfig) -> WalResult<Self> {
        let header = SegmentHeader::decode(&mut data)?;
        let mut segment = Self::new(header.segment_id, header.first_offset, config);

        let mut file_offset = SEGMENT_HEADER_SIZE as u64;
        while !data.is_empty() {
            match Entry::decode(&mut data, file_offset) {
                Ok(entry) => {
                    if entry.offset() != segment.next_offset() {
                        return Err(WalError::InvalidHeader {
                            file_offset,
                            reason: "offset gap inside segment",
                        });
                    }
                    file_offset += entry.frame_size();
                    segment.size_bytes += entry.frame_size();
                    segment.entries.push(entry);
                }
                // A torn tail ends the segment; everything before it is
                // intact.
                Err(WalError::TruncatedEntry { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(segment)
    }
}
