//! Row change decoder

use super::{ChangeType, RowChange};
use crate::row::Row;
use crate::schema::{ColumnId, Schema};
use crate::types::Value;
use crate::{Result, TabletError};
use bytes::Buf;

/// Split a framed batch into its individual changes
///
/// Framing problems invalidate the whole batch.
pub fn split_mutations(data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut changes = Vec::new();
    let mut cursor = data;
    while !cursor.is_empty() {
        if cursor.len() < 4 {
            return Err(TabletError::InvalidMutation(format!(
                "bad mutation framing: {} trailing bytes cannot hold a length prefix",
                cursor.len()
            )));
        }
        let len = cursor.get_u32_le() as usize;
        if len > cursor.len() {
            return Err(TabletError::InvalidMutation(format!(
                "bad mutation framing: length {} exceeds remaining {} bytes",
                len,
                cursor.len()
            )));
        }
        changes.push(&cursor[..len]);
        cursor = &cursor[len..];
    }
    Ok(changes)
}

/// Decodes one row change
pub struct RowChangeListDecoder;

impl RowChangeListDecoder {
    /// Decode a change encoded against a server-side schema
    pub fn decode(schema: &Schema, data: &[u8]) -> Result<RowChange> {
        Self::decode_with(schema, data, |idx| Ok(schema.column_id(idx)))
    }

    /// Decode a change sent by a client
    ///
    /// Entries address columns of `client_schema` by position; they are
    /// translated to the ids of the matching `tablet_schema` columns.
    pub fn decode_client(client_schema: &Schema, tablet_schema: &Schema, data: &[u8]) -> Result<RowChange> {
        let change = Self::decode_with(client_schema, data, |idx| {
            let name = &client_schema.column(idx).name;
            tablet_schema
                .find_column(name)
                .map(|t| tablet_schema.column_id(t))
                .ok_or_else(|| {
                    TabletError::MismatchedSchema(format!("column {} not present in tablet", name))
                })
        })?;

        if let RowChange::Reinsert(row) = change {
            // Columns the client schema lacks take their write defaults
            let mut full = Row::new();
            for idx in 0..tablet_schema.num_columns() {
                let id = tablet_schema.column_id(idx);
                let value = match row.get(id) {
                    Some(v) => v.clone(),
                    None => tablet_schema
                        .column(idx)
                        .write_default
                        .clone()
                        .unwrap_or(Value::Null),
                };
                full.set(id, value);
            }
            return Ok(RowChange::Reinsert(full));
        }
        Ok(change)
    }

    fn decode_with<F>(schema: &Schema, data: &[u8], id_of: F) -> Result<RowChange>
    where
        F: Fn(usize) -> Result<ColumnId>,
    {
        let mut cursor = data;
        if cursor.is_empty() {
            return Err(TabletError::InvalidMutation("empty row change list".into()));
        }
        let change_type = ChangeType::try_from(cursor.get_u8())?;

        match change_type {
            ChangeType::Delete => {
                if !cursor.is_empty() {
                    return Err(TabletError::InvalidMutation(format!(
                        "{} unexpected bytes after DELETE",
                        cursor.len()
                    )));
                }
                Ok(RowChange::Delete)
            }
            ChangeType::Update => {
                let entries = Self::decode_entries(schema, &mut cursor, &id_of)?;
                if entries.is_empty() {
                    return Err(TabletError::InvalidMutation("UPDATE with no columns".into()));
                }
                for (idx, _, _) in &entries {
                    if schema.is_key_column(*idx) {
                        return Err(TabletError::InvalidMutation(format!(
                            "cannot update key column {}",
                            schema.column(*idx)
                        )));
                    }
                }
                Ok(RowChange::Update(
                    entries.into_iter().map(|(_, id, v)| (id, v)).collect(),
                ))
            }
            ChangeType::Reinsert => {
                let entries = Self::decode_entries(schema, &mut cursor, &id_of)?;
                let mut row = Row::new();
                for (_, id, value) in entries {
                    row.set(id, value);
                }
                Ok(RowChange::Reinsert(row))
            }
        }
    }

    fn decode_entries<F>(
        schema: &Schema,
        cursor: &mut &[u8],
        id_of: &F,
    ) -> Result<Vec<(usize, ColumnId, Value)>>
    where
        F: Fn(usize) -> Result<ColumnId>,
    {
        let mut entries = Vec::new();
        while !cursor.is_empty() {
            if cursor.len() < 4 {
                return Err(TabletError::InvalidMutation("truncated column id".into()));
            }
            let wire_id = cursor.get_u32_le();
            let idx = if schema.has_column_ids() {
                schema.find_column_by_id(wire_id)
            } else {
                Some(wire_id as usize).filter(|&i| i < schema.num_columns())
            }
            .ok_or_else(|| TabletError::InvalidMutation(format!("unknown column id {}", wire_id)))?;

            let col = schema.column(idx);
            let is_null = if col.nullable {
                if cursor.is_empty() {
                    return Err(TabletError::InvalidMutation("truncated null flag".into()));
                }
                cursor.get_u8() != 0
            } else {
                false
            };
            let value = if is_null {
                Value::Null
            } else {
                Value::decode(col.data_type, cursor).map_err(|e| {
                    TabletError::InvalidMutation(format!("bad value for column {}: {}", col, e))
                })?
            };
            entries.push((idx, id_of(idx)?, value));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowchange::{frame_mutations, RowChangeListEncoder};
    use crate::schema::ColumnSchema;
    use crate::types::DataType;

    fn tablet_schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("int_val", DataType::UInt32),
                ColumnSchema::new("string_val", DataType::String).nullable(),
            ],
            1,
        )
        .unwrap()
        .assign_ids()
        .unwrap()
    }

    #[test]
    fn test_client_update() {
        let tablet = tablet_schema();
        let client = tablet.without_ids();

        let mut enc = RowChangeListEncoder::new(&client);
        enc.add_column_update(1, &Value::UInt32(42));
        enc.add_column_update(2, &Value::Null);
        let bytes = enc.finish();

        let change = RowChangeListDecoder::decode_client(&client, &tablet, &bytes).unwrap();
        assert_eq!(
            change,
            RowChange::Update(vec![(1, Value::UInt32(42)), (2, Value::Null)])
        );
    }

    #[test]
    fn test_client_columns_map_by_name() {
        let tablet = tablet_schema();
        let client = Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("string_val", DataType::String).nullable(),
            ],
            1,
        )
        .unwrap();

        let mut enc = RowChangeListEncoder::new(&client);
        enc.add_column_update(1, &Value::from("x"));
        let change = RowChangeListDecoder::decode_client(&client, &tablet, &enc.finish()).unwrap();
        assert_eq!(change, RowChange::Update(vec![(2, Value::from("x"))]));
    }

    #[test]
    fn test_framing_errors() {
        assert!(split_mutations(b"\x01").is_err());
        assert!(split_mutations(b"\xff\0\0\0").is_err());

        let parts = split_mutations(b"\x01\0\0\0x").unwrap();
        assert_eq!(parts.len(), 1);
        let tablet = tablet_schema();
        let err = RowChangeListDecoder::decode_client(&tablet.without_ids(), &tablet, parts[0]).unwrap_err();
        assert!(err.to_string().contains("bad type enum value"));
    }

    #[test]
    fn test_framed_batch() {
        let tablet = tablet_schema();
        let client = tablet.without_ids();
        let mut del = RowChangeListEncoder::new(&client);
        del.set_to_delete();
        let mut upd = RowChangeListEncoder::new(&client);
        upd.add_column_update(1, &Value::UInt32(3));

        let batch = frame_mutations(&[del.finish(), upd.finish()]);
        let parts = split_mutations(&batch).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(RowChangeListDecoder::decode_client(&client, &tablet, parts[0]).unwrap(), RowChange::Delete);
    }

    #[test]
    fn test_invalid_entries() {
        let tablet = tablet_schema();

        // Unknown column id
        let err = RowChangeListDecoder::decode(&tablet, &[1, 9, 0, 0, 0, 1, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("unknown column id 9"));

        // Key column update
        let err = RowChangeListDecoder::decode(&tablet, &[1, 0, 0, 0, 0, 1, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("cannot update key column"));

        // Truncated value
        assert!(RowChangeListDecoder::decode(&tablet, &[1, 1, 0, 0, 0, 1]).is_err());

        // Empty
        assert!(RowChangeListDecoder::decode(&tablet, &[]).is_err());
    }

    #[test]
    fn test_reinsert_structurally_valid() {
        let tablet = tablet_schema();
        let client = tablet.without_ids();
        let mut enc = RowChangeListEncoder::new(&client);
        enc.set_to_reinsert(&[Value::UInt32(1), Value::UInt32(2), Value::Null]);

        let change = RowChangeListDecoder::decode_client(&client, &tablet, &enc.finish()).unwrap();
        assert!(change.is_reinsert());
    }

    #[test]
    fn test_server_schema_encoding() {
        let tablet = tablet_schema();
        let change = RowChange::Update(vec![(2, Value::from("hello"))]);
        let bytes = RowChangeListEncoder::encode(&tablet, &change).unwrap();
        assert_eq!(RowChangeListDecoder::decode(&tablet, &bytes).unwrap(), change);
    }
}
