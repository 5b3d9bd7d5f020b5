//! Immutable delta files
//!
//! Format:
//! - 4 bytes: magic `TDLT`
//! - 4 bytes: format version
//! - 4 bytes: delta count
//! - 8 bytes: min timestamp
//! - 8 bytes: max timestamp
//! - 4 bytes: body length
//! - N bytes: LZ4 compressed bincode body (`Vec<(DeltaKey, RowChange)>`)
//! - 4 bytes: CRC32 of everything above

use super::{DeltaKey, DeltaStore};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowchange::RowChange;
use crate::{Result, TabletError};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"TDLT";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;

/// A flushed, read-only delta store
pub struct DeltaFile {
    id: u64,
    path: PathBuf,
    deltas: BTreeMap<DeltaKey, RowChange>,
    min_ts: Timestamp,
    max_ts: Timestamp,
}

impl DeltaFile {
    /// Write `deltas` (sorted by key) to `path` and fsync it
    pub fn write(path: &Path, id: u64, deltas: Vec<(DeltaKey, RowChange)>) -> Result<Self> {
        let min_ts = deltas.iter().map(|(k, _)| k.ts).min().unwrap_or(Timestamp::MIN);
        let max_ts = deltas.iter().map(|(k, _)| k.ts).max().unwrap_or(Timestamp::MIN);

        let body = bincode::serialize(&deltas)?;
        let compressed = lz4_flex::compress_prepend_size(&body);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + compressed.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(deltas.len() as u32);
        buf.put_u64_le(min_ts.value());
        buf.put_u64_le(max_ts.value());
        buf.put_u32_le(compressed.len() as u32);
        buf.put_slice(&compressed);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            deltas: deltas.into_iter().collect(),
            min_ts,
            max_ts,
        })
    }

    /// Load a delta file, validating its checksum
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        if data.len() < HEADER_SIZE + 4 {
            return Err(TabletError::Corruption(format!("delta file {:?} too short", path)));
        }
        let (content, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(TabletError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = content;
        if &cursor[..4] != MAGIC {
            return Err(TabletError::InvalidFormat(format!("bad delta file magic in {:?}", path)));
        }
        cursor.advance(4);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TabletError::InvalidFormat(format!(
                "Unsupported delta file version: {}",
                version
            )));
        }
        let count = cursor.get_u32_le() as usize;
        let min_ts = Timestamp::new(cursor.get_u64_le());
        let max_ts = Timestamp::new(cursor.get_u64_le());
        let body_len = cursor.get_u32_le() as usize;
        if cursor.len() != body_len {
            return Err(TabletError::Corruption(format!(
                "delta file {:?} body is {} bytes, header says {}",
                path,
                cursor.len(),
                body_len
            )));
        }

        let body = lz4_flex::decompress_size_prepended(cursor)
            .map_err(|e| TabletError::Compression(e.to_string()))?;
        let deltas: Vec<(DeltaKey, RowChange)> = bincode::deserialize(&body)?;
        if deltas.len() != count {
            return Err(TabletError::Corruption(format!(
                "delta file {:?} holds {} deltas, header says {}",
                path,
                deltas.len(),
                count
            )));
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            deltas: deltas.into_iter().collect(),
            min_ts,
            max_ts,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_ts(&self) -> Timestamp {
        self.min_ts
    }

    pub fn max_ts(&self) -> Timestamp {
        self.max_ts
    }

    /// All deltas in key order
    pub fn entries(&self) -> impl Iterator<Item = (&DeltaKey, &RowChange)> {
        self.deltas.iter()
    }

    /// Remove the file from disk
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl DeltaStore for DeltaFile {
    fn deltas_for_row(&self, row_idx: u32) -> Vec<(Timestamp, RowChange)> {
        let start = DeltaKey::new(row_idx, Timestamp::MIN);
        let end = DeltaKey::new(row_idx, Timestamp::MAX);
        self.deltas
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|(k, v)| (k.ts, v.clone()))
            .collect()
    }

    fn deltas_between(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Vec<(DeltaKey, RowChange)> {
        self.deltas
            .iter()
            .filter(|(k, _)| upto.is_newly_committed(since, k.ts))
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn contains(&self, key: &DeltaKey) -> bool {
        self.deltas.contains_key(key)
    }

    fn len(&self) -> usize {
        self.deltas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use tempfile::TempDir;

    fn sample() -> Vec<(DeltaKey, RowChange)> {
        vec![
            (DeltaKey::new(0, Timestamp::new(3)), RowChange::Update(vec![(1, Value::UInt32(7))])),
            (DeltaKey::new(0, Timestamp::new(8)), RowChange::Delete),
            (DeltaKey::new(4, Timestamp::new(5)), RowChange::Update(vec![(2, Value::from("x"))])),
        ]
    }

    #[test]
    fn test_write_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delta_0000000001.dlt");

        DeltaFile::write(&path, 1, sample()).unwrap();
        let file = DeltaFile::open(&path, 1).unwrap();

        assert_eq!(file.len(), 3);
        assert_eq!(file.min_ts(), Timestamp::new(3));
        assert_eq!(file.max_ts(), Timestamp::new(8));
        assert_eq!(file.deltas_for_row(0).len(), 2);
        assert!(file.contains(&DeltaKey::new(4, Timestamp::new(5))));
        assert!(!file.contains(&DeltaKey::new(4, Timestamp::new(6))));
    }

    #[test]
    fn test_corruption_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delta.dlt");
        DeltaFile::write(&path, 1, sample()).unwrap();

        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let result = DeltaFile::open(&path, 1);
        assert!(matches!(result, Err(TabletError::ChecksumMismatch { .. })));
    }
}
