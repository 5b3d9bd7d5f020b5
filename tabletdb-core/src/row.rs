//! Rows keyed by column id

use crate::encoding::EncodedKey;
use crate::schema::{ColumnId, Schema};
use crate::types::Value;
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored row: one cell per column id
///
/// Rows written before a column was added have no cell for it; readers
/// fall back to the column's read default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: BTreeMap<ColumnId, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from values laid out in a server-side schema
    pub fn from_values(schema: &Schema, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.num_columns() {
            return Err(TabletError::InvalidArgument(format!(
                "row has {} values but schema has {} columns",
                values.len(),
                schema.num_columns()
            )));
        }
        let mut row = Row::new();
        for (idx, value) in values.into_iter().enumerate() {
            schema.column(idx).check_value(&value)?;
            row.set(schema.column_id(idx), value);
        }
        Ok(row)
    }

    /// Build a tablet row from a client row laid out in `client_schema`
    ///
    /// Columns the client omitted receive their write default, or NULL.
    pub fn from_client(tablet_schema: &Schema, client_schema: &Schema, values: Vec<Value>) -> Result<Self> {
        if values.len() != client_schema.num_columns() {
            return Err(TabletError::InvalidArgument(format!(
                "row has {} values but client schema has {} columns",
                values.len(),
                client_schema.num_columns()
            )));
        }

        let mut provided: Vec<Option<Value>> = vec![None; tablet_schema.num_columns()];
        for (client_col, value) in client_schema.columns().iter().zip(values) {
            let idx = tablet_schema.find_column(&client_col.name).ok_or_else(|| {
                TabletError::MismatchedSchema(format!(
                    "Client provided column {} not present in tablet",
                    client_col
                ))
            })?;
            provided[idx] = Some(value);
        }

        let mut row = Row::new();
        for (idx, value) in provided.into_iter().enumerate() {
            let col = tablet_schema.column(idx);
            let value = match value {
                Some(v) => v,
                None => match &col.write_default {
                    Some(default) => default.clone(),
                    None if col.nullable => Value::Null,
                    None => {
                        return Err(TabletError::InvalidArgument(format!(
                            "missing value for column {}",
                            col
                        )))
                    }
                },
            };
            col.check_value(&value)?;
            row.set(tablet_schema.column_id(idx), value);
        }
        Ok(row)
    }

    pub fn get(&self, id: ColumnId) -> Option<&Value> {
        self.cells.get(&id)
    }

    pub fn set(&mut self, id: ColumnId, value: Value) {
        self.cells.insert(id, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ColumnId, &Value)> {
        self.cells.iter()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Apply column updates in order
    pub fn apply_updates(&mut self, updates: &[(ColumnId, Value)]) {
        for (id, value) in updates {
            self.cells.insert(*id, value.clone());
        }
    }

    /// Value of a column as seen through `schema`, falling back to the read default
    pub fn value_for(&self, schema: &Schema, idx: usize) -> Value {
        match self.cells.get(&schema.column_id(idx)) {
            Some(v) => v.clone(),
            None => schema.column(idx).missing_value(),
        }
    }

    /// Materialize the row in the column order of `projection`
    pub fn project(&self, projection: &Schema) -> Vec<Value> {
        (0..projection.num_columns())
            .map(|idx| self.value_for(projection, idx))
            .collect()
    }

    /// Key column values in schema order
    pub fn key_values(&self, schema: &Schema) -> Vec<Value> {
        (0..schema.num_key_columns())
            .map(|idx| self.value_for(schema, idx))
            .collect()
    }

    /// Encoded primary key under `schema`
    pub fn encoded_key(&self, schema: &Schema) -> Result<EncodedKey> {
        let values = self.key_values(schema);
        let refs: Vec<&Value> = values.iter().collect();
        EncodedKey::encode(schema, &refs)
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.cells.values().map(|v| v.size() + 4).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::types::DataType;

    fn tablet_schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("int_val", DataType::UInt32),
                ColumnSchema::new("c2", DataType::UInt32)
                    .with_read_default(Value::UInt32(7))
                    .with_write_default(Value::UInt32(5)),
                ColumnSchema::new("note", DataType::String).nullable(),
            ],
            1,
        )
        .unwrap()
        .assign_ids()
        .unwrap()
    }

    #[test]
    fn test_from_client_fills_defaults() {
        let schema = tablet_schema();
        let client = Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("int_val", DataType::UInt32),
            ],
            1,
        )
        .unwrap();

        let row = Row::from_client(&schema, &client, vec![Value::UInt32(1), Value::UInt32(2)]).unwrap();
        assert_eq!(row.get(2), Some(&Value::UInt32(5)));
        assert_eq!(row.get(3), Some(&Value::Null));
    }

    #[test]
    fn test_read_default_for_missing_cell() {
        let schema = tablet_schema();
        let mut row = Row::new();
        row.set(0, Value::UInt32(1));
        row.set(1, Value::UInt32(2));

        let values = row.project(&schema);
        assert_eq!(values[2], Value::UInt32(7));
        assert_eq!(values[3], Value::Null);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = tablet_schema();
        let client = schema.without_ids();
        let result = Row::from_client(
            &schema,
            &client,
            vec![Value::UInt32(1), Value::Null, Value::UInt32(1), Value::Null],
        );
        assert!(result.is_err());
    }
}
