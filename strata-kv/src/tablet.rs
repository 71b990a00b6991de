//! Tablet files: the engine's durable image.
//!
//! A tablet is a CRC-protected file of key/value records in slash order,
//! written whole on flush and bulk-loaded on open. One tablet generation
//! exists per flush; the newest generation wins on open.
//!
//! # File Format
//!
//! ```text
//! +-------------------+
//! | Magic "STRATATB"  |  (8 bytes)
//! | Version           |  (4 bytes)
//! | Record count      |  (8 bytes)
//! +-------------------+
//! | key_len | key | value_len | value    (per record, slash order)
//! +-------------------+
//! | CRC32             |  (4 bytes, over version + count + records)
//! +-------------------+
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comparator::SlashKey;
use crate::error::{KvError, KvResult};

/// File extension of tablet files.
pub const TABLET_EXTENSION: &str = "tab";

const TABLET_MAGIC: &[u8; 8] = b"STRATATB";
const TABLET_VERSION: u32 = 1;
const TABLET_HEADER_SIZE: usize = 20;

/// Returns the tablet path for a generation number.
pub fn tablet_path(db_dir: &Path, generation: u64) -> PathBuf {
    db_dir.join(format!("tablet-{generation:08x}.{TABLET_EXTENSION}"))
}

/// Parses the generation number out of a tablet file name.
#[must_use]
pub fn tablet_generation(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let hex = stem.strip_prefix("tablet-")?;
    u64::from_str_radix(hex, 16).ok()
}

/// Encodes the full map into tablet bytes.
#[must_use]
pub fn encode_tablet(entries: &BTreeMap<SlashKey, Bytes>) -> Bytes {
    let payload_size: usize = entries
        .iter()
        .map(|(k, v)| 8 + k.as_str().len() + v.len())
        .sum();
    let mut buf = BytesMut::with_capacity(TABLET_HEADER_SIZE + payload_size + 4);

    buf.put_slice(TABLET_MAGIC);
    buf.put_u32_le(TABLET_VERSION);
    buf.put_u64_le(entries.len() as u64);

    for (key, value) in entries {
        // Key and value sizes are bounded at the client edge.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(key.as_str().len() as u32);
        buf.put_slice(key.as_str().as_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }

    let crc = crc32fast::hash(&buf[8..]);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Decodes tablet bytes back into a map.
///
/// # Errors
/// Returns `Corruption` if the magic, checksum, or structure is invalid.
pub fn decode_tablet(path: &Path, data: &Bytes) -> KvResult<BTreeMap<SlashKey, Bytes>> {
    let corrupt = |reason: &'static str| KvError::Corruption {
        path: path.to_path_buf(),
        reason,
    };

    if data.len() < TABLET_HEADER_SIZE + 4 {
        return Err(corrupt("file shorter than header"));
    }
    if &data[..8] != TABLET_MAGIC {
        return Err(corrupt("invalid magic"));
    }

    let body = &data[8..data.len() - 4];
    let crc_stored = (&data[data.len() - 4..]).get_u32_le();
    if crc32fast::hash(body) != crc_stored {
        return Err(corrupt("checksum mismatch"));
    }

    let mut cursor = data.slice(8..data.len() - 4);
    let version = cursor.get_u32_le();
    if version != TABLET_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let count = cursor.get_u64_le();

    let mut entries = BTreeMap::new();
    let mut previous: Option<SlashKey> = None;
    for _ in 0..count {
        if cursor.remaining() < 4 {
            return Err(corrupt("truncated key length"));
        }
        let key_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < key_len {
            return Err(corrupt("truncated key"));
        }
        let key_raw = cursor.copy_to_bytes(key_len);
        let key = String::from_utf8(key_raw.to_vec()).map_err(|_| corrupt("key not UTF-8"))?;
        let key = SlashKey::new(key);

        if cursor.remaining() < 4 {
            return Err(corrupt("truncated value length"));
        }
        let value_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < value_len {
            return Err(corrupt("truncated value"));
        }
        let value = cursor.copy_to_bytes(value_len);

        if let Some(prev) = &previous {
            if prev >= &key {
                return Err(corrupt("records out of order"));
            }
        }
        previous = Some(key.clone());
        entries.insert(key, value);
    }

    if cursor.has_remaining() {
        return Err(corrupt("trailing bytes after records"));
    }

    Ok(entries)
}

/// Writes a tablet atomically: to a scratch path, synced, then renamed.
///
/// # Errors
/// Returns an error if any filesystem step fails.
pub async fn write_tablet(path: &Path, entries: &BTreeMap<SlashKey, Bytes>) -> KvResult<()> {
    let data = encode_tablet(entries);
    let scratch = path.with_extension("tmp");

    tokio::fs::write(&scratch, &data)
        .await
        .map_err(|e| KvError::io("tablet write", e))?;
    let file = tokio::fs::File::open(&scratch)
        .await
        .map_err(|e| KvError::io("tablet open", e))?;
    file.sync_all()
        .await
        .map_err(|e| KvError::io("tablet sync", e))?;
    drop(file);
    tokio::fs::rename(&scratch, path)
        .await
        .map_err(|e| KvError::io("tablet rename", e))?;
    Ok(())
}

/// Reads and validates a tablet file.
///
/// # Errors
/// Returns an error on I/O failure or corruption.
pub async fn read_tablet(path: &Path) -> KvResult<BTreeMap<SlashKey, Bytes>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| KvError::io("tablet read", e))?;
    decode_tablet(path, &Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<SlashKey, Bytes> {
        let mut map = BTreeMap::new();
        map.insert(SlashKey::new("/a"), Bytes::from_static(b"1"));
        map.insert(SlashKey::new("/a/b"), Bytes::from_static(b"2"));
        map.insert(SlashKey::new("/c"), Bytes::from_static(b"3"));
        map
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entries = sample();
        let data = encode_tablet(&entries);
        let decoded = decode_tablet(Path::new("test.tab"), &data).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_corruption_detected() {
        let entries = sample();
        let data = encode_tablet(&entries);
        let mut corrupted = data.to_vec();
        let mid = corrupted.len() / 2;
        corrupted[mid] ^= 0xFF;
        let result = decode_tablet(Path::new("test.tab"), &Bytes::from(corrupted));
        assert!(matches!(result, Err(KvError::Corruption { .. })));
    }

    #[test]
    fn test_empty_tablet() {
        let entries = BTreeMap::new();
        let data = encode_tablet(&entries);
        let decoded = decode_tablet(Path::new("test.tab"), &data).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_generation_parsing() {
        let path = tablet_path(Path::new("/db"), 0x1f);
        assert_eq!(tablet_generation(&path), Some(0x1f));
        assert_eq!(tablet_generation(Path::new("/db/other.tab")), None);
    }

    #[tokio::test]
    async fn test_write_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = tablet_path(dir.path(), 1);
        let entries = sample();

        write_tablet(&path, &entries).await.unwrap();
        let loaded = read_tablet(&path).await.unwrap();
        assert_eq!(loaded, entries);
    }
}
