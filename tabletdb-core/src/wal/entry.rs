//! WAL entry types and serialization

use crate::encoding::EncodedKey;
use crate::mvcc::Timestamp;
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::schema::Schema;
use crate::{Result, TabletError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Entry type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    Write = 1,
    AlterSchema = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = TabletError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Write),
            2 => Ok(WalEntryType::AlterSchema),
            _ => Err(TabletError::Corruption(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// One row-level operation of a logged write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOperation {
    Insert { row: Row },
    Mutate { key: EncodedKey, change: RowChange },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    Write {
        schema_version: u32,
        ops: Vec<RowOperation>,
    },
    AlterSchema {
        schema: Schema,
    },
}

/// A single WAL entry
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Transaction timestamp the entry was applied at
    pub timestamp: Timestamp,
    pub op: WalOperation,
}

/// Result of decoding the bytes at some position of a segment
pub(crate) enum Decoded {
    Entry(WalEntry, usize),
    /// Fewer bytes left than the entry needs
    Incomplete,
}

impl WalEntry {
    pub fn write(timestamp: Timestamp, schema_version: u32, ops: Vec<RowOperation>) -> Self {
        Self {
            timestamp,
            op: WalOperation::Write { schema_version, ops },
        }
    }

    pub fn alter_schema(timestamp: Timestamp, schema: Schema) -> Self {
        Self {
            timestamp,
            op: WalOperation::AlterSchema { schema },
        }
    }

    pub fn entry_type(&self) -> WalEntryType {
        match self.op {
            WalOperation::Write { .. } => WalEntryType::Write,
            WalOperation::AlterSchema { .. } => WalEntryType::AlterSchema,
        }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 8 bytes: timestamp
    /// - 4 bytes: payload length
    /// - N bytes: bincode payload
    /// - 4 bytes: CRC32 of everything after the length field
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let payload = match &self.op {
            WalOperation::Write { schema_version, ops } => bincode::serialize(&(schema_version, ops))?,
            WalOperation::AlterSchema { schema } => bincode::serialize(schema)?,
        };

        let mut buf = BytesMut::with_capacity(payload.len() + 21);
        buf.put_u32_le(0);
        buf.put_u8(self.entry_type() as u8);
        buf.put_u64_le(self.timestamp.value());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Deserialize an entry, validating its checksum
    pub(crate) fn deserialize_with_checksum(data: &[u8]) -> Result<Decoded> {
        if data.len() < 4 {
            return Ok(Decoded::Incomplete);
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Ok(Decoded::Incomplete);
        }
        if len < 17 {
            return Err(TabletError::Corruption(format!("WAL entry length {} too small", len)));
        }

        let entry_data = &data[4..4 + len];
        let checksum_pos = entry_data.len() - 4;
        let trailer = &entry_data[checksum_pos..];
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(&entry_data[..checksum_pos]);
        if expected != actual {
            return Err(TabletError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = &entry_data[..checksum_pos];
        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let timestamp = Timestamp::new(cursor.get_u64_le());
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(TabletError::Corruption("WAL payload length mismatch".into()));
        }

        let op = match entry_type {
            WalEntryType::Write => {
                let (schema_version, ops): (u32, Vec<RowOperation>) = bincode::deserialize(cursor)?;
                WalOperation::Write { schema_version, ops }
            }
            WalEntryType::AlterSchema => WalOperation::AlterSchema {
                schema: bincode::deserialize(cursor)?,
            },
        };

        Ok(Decoded::Entry(WalEntry { timestamp, op }, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn sample() -> WalEntry {
        let mut row = Row::new();
        row.set(0, Value::UInt32(1));
        row.set(1, Value::from("one"));
        WalEntry::write(
            Timestamp::new(42),
            3,
            vec![
                RowOperation::Insert { row },
                RowOperation::Mutate {
                    key: EncodedKey::from_bytes(vec![0, 0, 0, 1]),
                    change: RowChange::Delete,
                },
            ],
        )
    }

    #[test]
    fn test_entry_serialization() {
        let entry = sample();
        let serialized = entry.serialize_with_checksum().unwrap();

        match WalEntry::deserialize_with_checksum(&serialized).unwrap() {
            Decoded::Entry(decoded, len) => {
                assert_eq!(len, serialized.len());
                assert_eq!(decoded, entry);
            }
            Decoded::Incomplete => panic!("entry should be complete"),
        }

        assert!(matches!(
            WalEntry::deserialize_with_checksum(&serialized[..serialized.len() - 1]).unwrap(),
            Decoded::Incomplete
        ));
    }

    #[test]
    fn test_checksum_validation() {
        let mut serialized = sample().serialize_with_checksum().unwrap().to_vec();
        serialized[10] ^= 0xFF;

        assert!(matches!(
            WalEntry::deserialize_with_checksum(&serialized),
            Err(TabletError::ChecksumMismatch { .. })
        ));
    }
}
