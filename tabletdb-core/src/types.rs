//! Core value types for TabletDB

use crate::{Result, TabletError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Binary,
}

impl DataType {
    /// Type name as shown in schema and row descriptions
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Binary => "binary",
        }
    }

    /// Encoded width for fixed-size types
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Double => Some(8),
            DataType::String | DataType::Binary => None,
        }
    }

    /// Floating point columns cannot be part of a primary key
    pub fn is_floating(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Stable on-disk tag
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        const ALL: [DataType; 13] = [
            DataType::Bool,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::UInt8,
            DataType::UInt16,
            DataType::UInt32,
            DataType::UInt64,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::Binary,
        ];
        ALL.get(tag as usize)
            .copied()
            .ok_or_else(|| TabletError::InvalidFormat(format!("unknown data type tag {}", tag)))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Type of a non-null value
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => DataType::Bool,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt8(_) => DataType::UInt8,
            Value::UInt16(_) => DataType::UInt16,
            Value::UInt32(_) => DataType::UInt32,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check whether the value can be stored in a column of the given type
    pub fn matches(&self, data_type: DataType) -> bool {
        match self.data_type() {
            Some(t) => t == data_type,
            None => true,
        }
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::String(s) => s.len() + 4,
            Value::Binary(b) => b.len() + 4,
            other => other
                .data_type()
                .and_then(|t| t.fixed_size())
                .unwrap_or(1),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(*v as i64),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Append the untagged binary form of a non-null value
    ///
    /// Fixed-width types are little-endian; string and binary carry a
    /// 4 byte length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => {}
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Int8(v) => buf.put_i8(*v),
            Value::Int16(v) => buf.put_i16_le(*v),
            Value::Int32(v) => buf.put_i32_le(*v),
            Value::Int64(v) => buf.put_i64_le(*v),
            Value::UInt8(v) => buf.put_u8(*v),
            Value::UInt16(v) => buf.put_u16_le(*v),
            Value::UInt32(v) => buf.put_u32_le(*v),
            Value::UInt64(v) => buf.put_u64_le(*v),
            Value::Float(v) => buf.put_f32_le(*v),
            Value::Double(v) => buf.put_f64_le(*v),
            Value::String(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Binary(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    /// Decode a value of the given type, advancing the buffer
    pub fn decode(data_type: DataType, buf: &mut &[u8]) -> Result<Value> {
        if let Some(width) = data_type.fixed_size() {
            if buf.remaining() < width {
                return Err(TabletError::InvalidFormat(format!(
                    "truncated {} value",
                    data_type
                )));
            }
        }
        Ok(match data_type {
            DataType::Bool => Value::Bool(buf.get_u8() != 0),
            DataType::Int8 => Value::Int8(buf.get_i8()),
            DataType::Int16 => Value::Int16(buf.get_i16_le()),
            DataType::Int32 => Value::Int32(buf.get_i32_le()),
            DataType::Int64 => Value::Int64(buf.get_i64_le()),
            DataType::UInt8 => Value::UInt8(buf.get_u8()),
            DataType::UInt16 => Value::UInt16(buf.get_u16_le()),
            DataType::UInt32 => Value::UInt32(buf.get_u32_le()),
            DataType::UInt64 => Value::UInt64(buf.get_u64_le()),
            DataType::Float => Value::Float(buf.get_f32_le()),
            DataType::Double => Value::Double(buf.get_f64_le()),
            DataType::String | DataType::Binary => {
                if buf.remaining() < 4 {
                    return Err(TabletError::InvalidFormat("truncated length prefix".into()));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(TabletError::InvalidFormat(format!(
                        "{} value of {} bytes exceeds buffer",
                        data_type, len
                    )));
                }
                let bytes = buf[..len].to_vec();
                buf.advance(len);
                if data_type == DataType::String {
                    Value::String(
                        String::from_utf8(bytes)
                            .map_err(|e| TabletError::InvalidFormat(e.to_string()))?,
                    )
                } else {
                    Value::Binary(bytes)
                }
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Binary(b) => {
                for byte in b {
                    if byte.is_ascii_graphic() || *byte == b' ' {
                        write!(f, "{}", *byte as char)?;
                    } else {
                        write!(f, "\\x{:02x}", byte)?;
                    }
                }
                Ok(())
            }
        }
    }
}

macro_rules! impl_from_value {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<u8> => Binary,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        let values = vec![
            Value::UInt32(1234),
            Value::Int64(-5),
            Value::String("hello 50".into()),
            Value::Binary(vec![0, 1, 2]),
            Value::Double(2.5),
        ];

        let mut buf = BytesMut::new();
        for v in &values {
            v.encode(&mut buf);
        }

        let mut data: &[u8] = &buf;
        for v in &values {
            let decoded = Value::decode(v.data_type().unwrap(), &mut data).unwrap();
            assert_eq!(&decoded, v);
        }
        assert!(data.is_empty());
    }

    #[test]
    fn test_truncated_value() {
        let mut data: &[u8] = &[1, 2];
        assert!(Value::decode(DataType::UInt32, &mut data).is_err());

        let mut data: &[u8] = &[10, 0, 0, 0, b'a'];
        assert!(Value::decode(DataType::String, &mut data).is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(DataType::UInt32.to_string(), "uint32");
        assert_eq!(DataType::String.to_string(), "string");
        assert!(Value::Null.matches(DataType::Int8));
        assert!(!Value::UInt32(1).matches(DataType::Int32));
    }
}
