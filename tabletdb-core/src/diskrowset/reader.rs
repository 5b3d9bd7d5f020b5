//! Reader for DiskRowSet base data
//!
//! The key index and bloom filter are loaded on open. Column blocks are read
//! on first access and kept for the lifetime of the reader.

use super::block::ColumnBlock;
use super::bloom::KeyBloomFilter;
use super::{FOOTER_SIZE, FORMAT_VERSION, MAGIC};
use crate::encoding::EncodedKey;
use crate::row::Row;
use crate::schema::ColumnId;
use crate::{Result, TabletError};
use bytes::Buf;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct ColumnLocation {
    column_id: ColumnId,
    offset: u64,
    size: u32,
}

/// Immutable base data of one DiskRowSet
pub struct BaseDataReader {
    path: PathBuf,
    file_size: u64,
    keys: Vec<EncodedKey>,
    bloom: KeyBloomFilter,
    columns: Vec<ColumnLocation>,
    cache: RwLock<HashMap<ColumnId, Arc<ColumnBlock>>>,
}

impl BaseDataReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (16 + FOOTER_SIZE) as u64 {
            return Err(TabletError::InvalidFormat(format!("{:?} too short", path)));
        }

        let mut header = [0u8; 16];
        file.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(TabletError::InvalidFormat("Invalid base data header".into()));
        }
        let mut cursor = &header[4..];
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TabletError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let row_count = cursor.get_u64_le() as usize;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        if &footer[FOOTER_SIZE - 4..] != MAGIC {
            return Err(TabletError::InvalidFormat("Invalid base data magic".into()));
        }
        let mut cursor = &footer[..];
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        let bloom_offset = cursor.get_u64_le();
        let bloom_size = cursor.get_u64_le();
        let directory_offset = cursor.get_u64_le();
        let directory_size = cursor.get_u64_le();

        let index = read_at(&mut file, index_offset, index_size)?;
        let keys = parse_index(&index)?;
        if keys.len() != row_count {
            return Err(TabletError::Corruption(format!(
                "key index has {} entries, header says {}",
                keys.len(),
                row_count
            )));
        }

        let bloom = KeyBloomFilter::from_bytes(&read_at(&mut file, bloom_offset, bloom_size)?)?;
        let columns = parse_directory(&read_at(&mut file, directory_offset, directory_size)?)?;

        Ok(Self {
            path: path.to_path_buf(),
            file_size,
            keys,
            bloom,
            columns,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn row_count(&self) -> usize {
        self.keys.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn key_at(&self, row_idx: u32) -> Option<&EncodedKey> {
        self.keys.get(row_idx as usize)
    }

    pub fn min_key(&self) -> Option<&EncodedKey> {
        self.keys.first()
    }

    pub fn max_key(&self) -> Option<&EncodedKey> {
        self.keys.last()
    }

    /// Row index of `key`, if the base data holds it
    pub fn find_row(&self, key: &EncodedKey) -> Option<u32> {
        if !self.bloom.may_contain(key) {
            return None;
        }
        self.keys.binary_search(key).ok().map(|idx| idx as u32)
    }

    /// Base row at `row_idx`, without deltas
    pub fn row(&self, row_idx: u32) -> Result<Row> {
        let mut row = Row::new();
        for location in &self.columns {
            let block = self.column(location)?;
            match block.cells.get(row_idx as usize) {
                Some(Some(value)) => row.set(location.column_id, value.clone()),
                Some(None) => {}
                None => {
                    return Err(TabletError::Corruption(format!(
                        "row {} out of range for column {}",
                        row_idx, location.column_id
                    )))
                }
            }
        }
        Ok(row)
    }

    fn column(&self, location: &ColumnLocation) -> Result<Arc<ColumnBlock>> {
        if let Some(block) = self.cache.read().get(&location.column_id) {
            return Ok(block.clone());
        }

        let mut file = File::open(&self.path)?;
        let data = read_at(&mut file, location.offset, location.size as u64)?;
        let block = Arc::new(ColumnBlock::from_bytes(&data)?);
        if block.cells.len() != self.keys.len() {
            return Err(TabletError::Corruption(format!(
                "column {} has {} cells for {} rows",
                location.column_id,
                block.cells.len(),
                self.keys.len()
            )));
        }

        self.cache.write().insert(location.column_id, block.clone());
        Ok(block)
    }
}

fn read_at(file: &mut File, offset: u64, size: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

fn parse_index(data: &[u8]) -> Result<Vec<EncodedKey>> {
    if data.len() < 4 {
        return Err(TabletError::InvalidFormat("Key index too short".into()));
    }
    let checksum_pos = data.len() - 4;
    let expected = u32::from_le_bytes([
        data[checksum_pos],
        data[checksum_pos + 1],
        data[checksum_pos + 2],
        data[checksum_pos + 3],
    ]);
    let actual = crc32fast::hash(&data[..checksum_pos]);
    if expected != actual {
        return Err(TabletError::ChecksumMismatch { expected, actual });
    }

    let raw = lz4_flex::decompress_size_prepended(&data[..checksum_pos])
        .map_err(|e| TabletError::Compression(e.to_string()))?;
    let mut cursor = &raw[..];
    if cursor.remaining() < 4 {
        return Err(TabletError::Corruption("empty key index".into()));
    }
    let count = cursor.get_u32_le() as usize;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor.remaining() < 4 {
            return Err(TabletError::Corruption("truncated key index".into()));
        }
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() < len {
            return Err(TabletError::Corruption("truncated key index".into()));
        }
        keys.push(EncodedKey::from_bytes(cursor[..len].to_vec()));
        cursor.advance(len);
    }
    Ok(keys)
}

fn parse_directory(data: &[u8]) -> Result<Vec<ColumnLocation>> {
    let mut cursor = data;
    if cursor.remaining() < 4 {
        return Err(TabletError::InvalidFormat("Column directory too short".into()));
    }
    let count = cursor.get_u32_le() as usize;
    if cursor.remaining() != count * 16 {
        return Err(TabletError::InvalidFormat("Bad column directory size".into()));
    }
    Ok((0..count)
        .map(|_| ColumnLocation {
            column_id: cursor.get_u32_le(),
            offset: cursor.get_u64_le(),
            size: cursor.get_u32_le(),
        })
        .collect())
}
