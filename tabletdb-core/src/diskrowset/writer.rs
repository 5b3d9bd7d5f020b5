//! Writer for the base data file of a DiskRowSet
//!
//! Layout of `base.drs`:
//! - header: magic `TDRS`, format version (u32), row count (u64)
//! - one column block per schema column
//! - key index: LZ4 compressed list of encoded keys in row order, with CRC32
//! - bloom filter over encoded keys
//! - column directory: `(column id, offset, size)` per block
//! - footer: offsets and sizes of the index, bloom filter and directory,
//!   then the magic again

use super::block::ColumnBlockBuilder;
use super::bloom::KeyBloomFilter;
use super::{DiskRowSetConfig, FORMAT_VERSION, MAGIC};
use crate::encoding::EncodedKey;
use crate::row::Row;
use crate::schema::{ColumnId, Schema};
use crate::{Result, TabletError};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Streams rows in key order into a new base file
pub struct BaseDataWriter {
    path: PathBuf,
    config: DiskRowSetConfig,
    columns: Vec<ColumnBlockBuilder>,
    column_ids: Vec<ColumnId>,
    keys: Vec<EncodedKey>,
}

impl BaseDataWriter {
    pub fn new(path: &Path, schema: &Schema, config: &DiskRowSetConfig) -> Self {
        let columns = (0..schema.num_columns())
            .map(|idx| ColumnBlockBuilder::new(schema.column_id(idx), schema.column(idx).data_type))
            .collect();
        Self {
            path: path.to_path_buf(),
            config: config.clone(),
            columns,
            column_ids: schema.column_ids().to_vec(),
            keys: Vec::new(),
        }
    }

    /// Append the next row; keys must arrive in strictly increasing order
    pub fn append(&mut self, key: EncodedKey, row: &Row) -> Result<()> {
        if let Some(last) = self.keys.last() {
            if &key <= last {
                return Err(TabletError::Internal(format!(
                    "rows out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        for (builder, id) in self.columns.iter_mut().zip(&self.column_ids) {
            builder.add(row.get(*id));
        }
        self.keys.push(key);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.keys.len()
    }

    /// Write everything out and fsync; returns the file size
    pub fn finish(self) -> Result<u64> {
        let file = File::create(&self.path)?;
        let mut out = BufWriter::new(file);
        let mut offset = 0u64;

        let mut header = BytesMut::with_capacity(16);
        header.put_slice(MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        header.put_u64_le(self.keys.len() as u64);
        out.write_all(&header)?;
        offset += header.len() as u64;

        let mut directory = BytesMut::new();
        directory.put_u32_le(self.columns.len() as u32);
        for builder in self.columns {
            let column_id = builder.column_id();
            let bytes = builder.finish(self.config.compression);
            directory.put_u32_le(column_id);
            directory.put_u64_le(offset);
            directory.put_u32_le(bytes.len() as u32);
            out.write_all(&bytes)?;
            offset += bytes.len() as u64;
        }

        let mut raw_keys = BytesMut::new();
        raw_keys.put_u32_le(self.keys.len() as u32);
        for key in &self.keys {
            raw_keys.put_u32_le(key.len() as u32);
            raw_keys.put_slice(key.as_bytes());
        }
        let mut index = BytesMut::new();
        index.put_slice(&lz4_flex::compress_prepend_size(&raw_keys));
        let checksum = crc32fast::hash(&index);
        index.put_u32_le(checksum);
        let index_offset = offset;
        out.write_all(&index)?;
        offset += index.len() as u64;

        let mut bloom = KeyBloomFilter::new(self.keys.len(), self.config.bloom_bits_per_key);
        for key in &self.keys {
            bloom.add(key);
        }
        let bloom_bytes = bloom.to_bytes();
        let bloom_offset = offset;
        out.write_all(&bloom_bytes)?;
        offset += bloom_bytes.len() as u64;

        let directory_offset = offset;
        out.write_all(&directory)?;
        offset += directory.len() as u64;

        let mut footer = BytesMut::with_capacity(super::FOOTER_SIZE);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u64_le(bloom_offset);
        footer.put_u64_le(bloom_bytes.len() as u64);
        footer.put_u64_le(directory_offset);
        footer.put_u64_le(directory.len() as u64);
        footer.put_slice(MAGIC);
        out.write_all(&footer)?;
        offset += footer.len() as u64;

        let file = out.into_inner().map_err(|e| TabletError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(offset)
    }
}
