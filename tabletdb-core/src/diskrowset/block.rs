//! Column blocks of a DiskRowSet base file
//!
//! One block holds every cell of a single column, in row index order. A
//! cell is either absent (the row predates the column), NULL, or a value.

use crate::schema::ColumnId;
use crate::types::{DataType, Value};
use crate::{Result, TabletError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CELL_ABSENT: u8 = 0;
const CELL_NULL: u8 = 1;
const CELL_VALUE: u8 = 2;

/// Decoded column data
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBlock {
    pub column_id: ColumnId,
    pub data_type: DataType,
    pub cells: Vec<Option<Value>>,
}

/// Accumulates the cells of one column while a base file is written
pub struct ColumnBlockBuilder {
    column_id: ColumnId,
    data_type: DataType,
    buf: BytesMut,
    count: u32,
}

impl ColumnBlockBuilder {
    pub fn new(column_id: ColumnId, data_type: DataType) -> Self {
        Self {
            column_id,
            data_type,
            buf: BytesMut::new(),
            count: 0,
        }
    }

    pub fn add(&mut self, cell: Option<&Value>) {
        match cell {
            None => self.buf.put_u8(CELL_ABSENT),
            Some(Value::Null) => self.buf.put_u8(CELL_NULL),
            Some(value) => {
                self.buf.put_u8(CELL_VALUE);
                value.encode(&mut self.buf);
            }
        }
        self.count += 1;
    }

    pub fn column_id(&self) -> ColumnId {
        self.column_id
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Serialize the block, optionally LZ4 compressing the cell data
    ///
    /// Layout: column id (u32), type tag (u8), cell count (u32), lz4 flag
    /// (u8), data length (u32), data, CRC32 of everything before it.
    pub fn finish(self, compress: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.buf.len() + 18);
        buf.put_u32_le(self.column_id);
        buf.put_u8(self.data_type.tag());
        buf.put_u32_le(self.count);

        if compress {
            let compressed = lz4_flex::compress_prepend_size(&self.buf);
            buf.put_u8(1);
            buf.put_u32_le(compressed.len() as u32);
            buf.put_slice(&compressed);
        } else {
            buf.put_u8(0);
            buf.put_u32_le(self.buf.len() as u32);
            buf.put_slice(&self.buf);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }
}

impl ColumnBlock {
    /// Parse and verify a serialized block
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(TabletError::InvalidFormat("Column block too short".into()));
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

        let mut cursor = &data[..checksum_pos];
        let column_id = cursor.get_u32_le();
        let data_type = DataType::from_tag(cursor.get_u8())?;
        let count = cursor.get_u32_le() as usize;
        let lz4_flag = cursor.get_u8();
        let data_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != data_len {
            return Err(TabletError::InvalidFormat(format!(
                "Column block data length {} does not match {} remaining bytes",
                data_len,
                cursor.remaining()
            )));
        }

        let raw = if lz4_flag == 1 {
            lz4_flex::decompress_size_prepended(cursor)
                .map_err(|e| TabletError::Compression(e.to_string()))?
        } else {
            cursor.to_vec()
        };

        let mut body = &raw[..];
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            if !body.has_remaining() {
                return Err(TabletError::Corruption(format!(
                    "Column block {} ends after {} of {} cells",
                    column_id,
                    cells.len(),
                    count
                )));
            }
            let cell = match body.get_u8() {
                CELL_ABSENT => None,
                CELL_NULL => Some(Value::Null),
                CELL_VALUE => Some(Value::decode(data_type, &mut body)?),
                other => {
                    return Err(TabletError::Corruption(format!("bad cell marker {}", other)))
                }
            };
            cells.push(cell);
        }

        Ok(Self {
            column_id,
            data_type,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cells() {
        let mut builder = ColumnBlockBuilder::new(3, DataType::String);
        builder.add(Some(&Value::from("a")));
        builder.add(None);
        builder.add(Some(&Value::Null));
        builder.add(Some(&Value::from("")));
        assert_eq!(builder.len(), 4);

        let bytes = builder.finish(true);
        let block = ColumnBlock::from_bytes(&bytes).unwrap();
        assert_eq!(block.column_id, 3);
        assert_eq!(block.data_type, DataType::String);
        assert_eq!(
            block.cells,
            vec![Some(Value::from("a")), None, Some(Value::Null), Some(Value::from(""))]
        );
    }

    #[test]
    fn test_corrupt_block_detected() {
        let mut builder = ColumnBlockBuilder::new(0, DataType::UInt32);
        for i in 0..100u32 {
            builder.add(Some(&Value::UInt32(i)));
        }
        let mut bytes = builder.finish(false).to_vec();
        bytes[20] ^= 0xff;
        assert!(matches!(
            ColumnBlock::from_bytes(&bytes),
            Err(TabletError::ChecksumMismatch { .. })
        ));
    }
}
