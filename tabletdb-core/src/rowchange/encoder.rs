//! Row change encoder

use super::{ChangeType, RowChange};
use crate::schema::Schema;
use crate::types::Value;
use crate::{Result, TabletError};
use bytes::{BufMut, Bytes, BytesMut};

/// Builds the binary form of one row change against a schema
///
/// Column references are written as column ids for server-side schemas and
/// as column positions for client schemas, which carry no ids.
pub struct RowChangeListEncoder<'a> {
    schema: &'a Schema,
    buf: BytesMut,
    change_type: Option<ChangeType>,
}

impl<'a> RowChangeListEncoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            buf: BytesMut::new(),
            change_type: None,
        }
    }

    /// Append a column update; the first call marks the change as an UPDATE
    pub fn add_column_update(&mut self, col_idx: usize, value: &Value) {
        if self.change_type.is_none() {
            self.set_type(ChangeType::Update);
        }
        self.put_entry(col_idx, value);
    }

    pub fn set_to_delete(&mut self) {
        self.set_type(ChangeType::Delete);
    }

    /// Encode a REINSERT carrying a full row in schema order
    pub fn set_to_reinsert(&mut self, values: &[Value]) {
        self.set_type(ChangeType::Reinsert);
        for (idx, value) in values.iter().enumerate() {
            self.put_entry(idx, value);
        }
    }

    /// Encode an already decoded change against a server-side schema
    pub fn encode(schema: &'a Schema, change: &RowChange) -> Result<Bytes> {
        let mut encoder = Self::new(schema);
        match change {
            RowChange::Update(updates) => {
                for (id, value) in updates {
                    let idx = schema.find_column_by_id(*id).ok_or_else(|| {
                        TabletError::InvalidMutation(format!("unknown column id {}", id))
                    })?;
                    encoder.add_column_update(idx, value);
                }
            }
            RowChange::Delete => encoder.set_to_delete(),
            RowChange::Reinsert(row) => {
                let values: Vec<Value> = (0..schema.num_columns())
                    .map(|idx| row.value_for(schema, idx))
                    .collect();
                encoder.set_to_reinsert(&values);
            }
        }
        Ok(encoder.finish())
    }

    pub fn is_empty(&self) -> bool {
        self.change_type.is_none()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn set_type(&mut self, change_type: ChangeType) {
        self.buf.clear();
        self.buf.put_u8(change_type as u8);
        self.change_type = Some(change_type);
    }

    fn put_entry(&mut self, col_idx: usize, value: &Value) {
        let id = if self.schema.has_column_ids() {
            self.schema.column_id(col_idx)
        } else {
            col_idx as u32
        };
        self.buf.put_u32_le(id);
        if self.schema.column(col_idx).nullable {
            self.buf.put_u8(value.is_null() as u8);
        }
        value.encode(&mut self.buf);
    }
}

/// Frame a sequence of encoded changes into a batch
pub fn frame_mutations(changes: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for change in changes {
        buf.put_u32_le(change.len() as u32);
        buf.put_slice(change);
    }
    buf.freeze()
}
