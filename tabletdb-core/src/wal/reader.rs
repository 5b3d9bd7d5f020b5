//! WAL reader for recovery

use super::entry::Decoded;
use super::{list_segments, WalEntry};
use crate::{Result, TabletError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reads every entry of a log directory
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Read all entries in segment order
    ///
    /// A checksum mismatch or undecodable entry is fatal. An incomplete
    /// entry at the very end of the last segment was torn by a crash during
    /// append and is dropped.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        let segments = list_segments(&self.dir)?;
        let mut entries = Vec::new();

        for (idx, (_, path)) in segments.iter().enumerate() {
            let is_last = idx + 1 == segments.len();
            let segment_entries = Self::read_segment(path, is_last)?;
            info!("Read {} entries from {:?}", segment_entries.len(), path);
            entries.extend(segment_entries);
        }
        Ok(entries)
    }

    fn read_segment(path: &Path, is_last: bool) -> Result<Vec<WalEntry>> {
        let data = fs::read(path)?;
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok(Decoded::Entry(entry, len)) => {
                    entries.push(entry);
                    offset += len;
                }
                Ok(Decoded::Incomplete) if is_last => {
                    warn!(
                        "Truncating torn entry at offset {} of {:?} ({} bytes)",
                        offset,
                        path,
                        data.len() - offset
                    );
                    break;
                }
                Ok(Decoded::Incomplete) => {
                    return Err(TabletError::Corruption(format!(
                        "incomplete entry at offset {} in {:?}",
                        offset, path
                    )));
                }
                Err(e) => {
                    return Err(TabletError::Corruption(format!(
                        "bad entry at offset {} in {:?}: {}",
                        offset, path, e
                    )));
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Timestamp;
    use crate::schema::{ColumnSchema, Schema};
    use crate::types::DataType;
    use crate::wal::{segment_path, SyncPolicy, WalConfig, WalOperation, WalWriter};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn config(dir: &Path) -> WalConfig {
        WalConfig {
            dir: dir.to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
            segment_size: 1024,
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![ColumnSchema::new("key", DataType::UInt32)], 1)
            .unwrap()
            .assign_ids()
            .unwrap()
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::open(config(temp_dir.path())).unwrap();
            for i in 0..10 {
                writer
                    .append(&WalEntry::alter_schema(Timestamp::new(i + 1), schema()))
                    .unwrap();
            }
        }

        let entries = WalReader::new(temp_dir.path()).read_all().unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[9].timestamp, Timestamp::new(10));
        assert!(matches!(entries[0].op, WalOperation::AlterSchema { .. }));
    }

    #[test]
    fn test_torn_tail_dropped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::open(config(temp_dir.path())).unwrap();
            writer.append(&WalEntry::alter_schema(Timestamp::new(1), schema())).unwrap();
        }
        let torn = WalEntry::alter_schema(Timestamp::new(2), schema())
            .serialize_with_checksum()
            .unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(segment_path(temp_dir.path(), 0))
            .unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();

        let entries = WalReader::new(temp_dir.path()).read_all().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::open(config(temp_dir.path())).unwrap();
            writer.append(&WalEntry::alter_schema(Timestamp::new(1), schema())).unwrap();
        }
        let path = segment_path(temp_dir.path(), 0);
        let mut data = std::fs::read(&path).unwrap();
        data[8] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let err = WalReader::new(temp_dir.path()).read_all().unwrap_err();
        assert!(err.is_corruption());
    }
}
