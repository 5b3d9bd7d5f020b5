//! Memcomparable primary key encoding
//!
//! Keys are encoded so that comparing the encoded bytes gives the same
//! order as comparing the key columns one by one. Integers are written
//! big-endian with the sign bit flipped. Variable-length columns escape
//! `0x00` as `0x00 0x01` and end with `0x00 0x00`, except in the last key
//! column where the raw bytes are used.

use crate::schema::Schema;
use crate::types::Value;
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded primary key
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    /// Encode key column values in schema order
    pub fn encode(schema: &Schema, key_values: &[&Value]) -> Result<Self> {
        if key_values.len() != schema.num_key_columns() {
            return Err(TabletError::InvalidArgument(format!(
                "expected {} key columns, got {}",
                schema.num_key_columns(),
                key_values.len()
            )));
        }

        let mut buf = Vec::with_capacity(16);
        let last = key_values.len().saturating_sub(1);
        for (idx, value) in key_values.iter().enumerate() {
            let col = schema.column(idx);
            if value.is_null() || !value.matches(col.data_type) {
                return Err(TabletError::InvalidArgument(format!(
                    "bad key value {} for column {}",
                    value, col
                )));
            }
            encode_value(value, idx == last, &mut buf)?;
        }
        Ok(Self(buf))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedKey(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

fn encode_value(value: &Value, is_last: bool, buf: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Bool(v) => buf.push(*v as u8),
        Value::UInt8(v) => buf.push(*v),
        Value::UInt16(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::UInt32(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::UInt64(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::Int8(v) => buf.push((*v as u8) ^ 0x80),
        Value::Int16(v) => buf.extend_from_slice(&((*v as u16) ^ (1 << 15)).to_be_bytes()),
        Value::Int32(v) => buf.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
        Value::String(s) => encode_bytes(s.as_bytes(), is_last, buf),
        Value::Binary(b) => encode_bytes(b, is_last, buf),
        Value::Float(_) | Value::Double(_) | Value::Null => {
            return Err(TabletError::InvalidArgument(format!(
                "value {} cannot be part of a key",
                value
            )))
        }
    }
    Ok(())
}

fn encode_bytes(bytes: &[u8], is_last: bool, buf: &mut Vec<u8>) {
    if is_last {
        buf.extend_from_slice(bytes);
        return;
    }
    for &b in bytes {
        if b == 0 {
            buf.extend_from_slice(&[0, 1]);
        } else {
            buf.push(b);
        }
    }
    buf.extend_from_slice(&[0, 0]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::types::DataType;

    fn composite_schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("host", DataType::String),
                ColumnSchema::new("ts", DataType::Int64),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_integer_order() {
        let schema = Schema::new(vec![ColumnSchema::new("k", DataType::Int32)], 1).unwrap();
        let values = [-100i32, -1, 0, 1, 100];
        let keys: Vec<EncodedKey> = values
            .iter()
            .map(|v| EncodedKey::encode(&schema, &[&Value::Int32(*v)]).unwrap())
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_composite_order() {
        let schema = composite_schema();
        let a = EncodedKey::encode(&schema, &[&Value::from("a"), &Value::Int64(5)]).unwrap();
        let ab = EncodedKey::encode(&schema, &[&Value::from("ab"), &Value::Int64(1)]).unwrap();
        let a_later = EncodedKey::encode(&schema, &[&Value::from("a"), &Value::Int64(6)]).unwrap();
        let a_nul = EncodedKey::encode(&schema, &[&Value::from("a\0"), &Value::Int64(0)]).unwrap();

        assert!(a < a_later);
        assert!(a_later < a_nul);
        assert!(a_nul < ab);
    }

    #[test]
    fn test_bad_key_values() {
        let schema = composite_schema();
        assert!(EncodedKey::encode(&schema, &[&Value::from("a")]).is_err());
        assert!(EncodedKey::encode(&schema, &[&Value::Null, &Value::Int64(1)]).is_err());
        assert!(EncodedKey::encode(&schema, &[&Value::from("a"), &Value::Int32(1)]).is_err());
    }
}
