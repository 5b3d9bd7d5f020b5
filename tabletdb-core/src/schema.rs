//! Tablet schema with stable column identifiers
//!
//! A [`Schema`] is an ordered list of columns whose first
//! `num_key_columns` entries form the primary key. Server-side schemas carry
//! one [`ColumnId`] per column; ids are handed out from `next_column_id` and
//! never reused, so an id always names the same logical column across
//! alterations. Client schemas never carry ids.

use crate::types::{DataType, Value};
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Stable server-assigned column identifier
pub type ColumnId = u32;

/// A single column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Column type
    pub data_type: DataType,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// Value reported for rows written before the column existed
    pub read_default: Option<Value>,
    /// Value stored for inserts that omit the column
    pub write_default: Option<Value>,
}

impl ColumnSchema {
    /// Create a non-nullable column without defaults
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            read_default: None,
            write_default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_read_default(mut self, value: Value) -> Self {
        self.read_default = Some(value);
        self
    }

    pub fn with_write_default(mut self, value: Value) -> Self {
        self.write_default = Some(value);
        self
    }

    /// e.g. `uint32 NOT NULL`
    pub fn type_description(&self) -> String {
        format!(
            "{} {}",
            self.data_type,
            if self.nullable { "NULLABLE" } else { "NOT NULL" }
        )
    }

    /// Same type and nullability
    pub fn type_equals(&self, other: &ColumnSchema) -> bool {
        self.data_type == other.data_type && self.nullable == other.nullable
    }

    /// Value a reader sees when the row has no cell for this column
    pub fn missing_value(&self) -> Value {
        self.read_default.clone().unwrap_or(Value::Null)
    }

    /// Check that a value may be stored in this column
    pub fn check_value(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(TabletError::InvalidArgument(format!(
                    "NULL value for non-nullable column {}",
                    self
                )));
            }
            return Ok(());
        }
        if !value.matches(self.data_type) {
            return Err(TabletError::InvalidArgument(format!(
                "value {} does not match type of column {}",
                value, self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.type_description())
    }
}

/// Ordered column set with a primary key prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    /// Empty for client schemas
    column_ids: Vec<ColumnId>,
    num_key_columns: usize,
    version: u32,
    next_column_id: ColumnId,
}

impl Schema {
    /// Create a schema without column ids
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if num_key_columns > columns.len() {
            return Err(TabletError::InvalidSchema(format!(
                "{} key columns requested but only {} columns defined",
                num_key_columns,
                columns.len()
            )));
        }

        let mut names = HashSet::new();
        for (idx, col) in columns.iter().enumerate() {
            if !names.insert(col.name.as_str()) {
                return Err(TabletError::InvalidSchema(format!(
                    "Duplicate column name: {}",
                    col.name
                )));
            }
            if idx < num_key_columns {
                if col.nullable {
                    return Err(TabletError::InvalidSchema(format!(
                        "Key column may not be nullable: {}",
                        col
                    )));
                }
                if col.data_type.is_floating() {
                    return Err(TabletError::InvalidSchema(format!(
                        "Key column may not have type {}: {}",
                        col.data_type, col.name
                    )));
                }
            }
            for default in [&col.read_default, &col.write_default].into_iter().flatten() {
                col.check_value(default).map_err(|_| {
                    TabletError::InvalidSchema(format!("Bad default value for column {}", col))
                })?;
            }
        }

        Ok(Self {
            columns,
            column_ids: Vec::new(),
            num_key_columns,
            version: 0,
            next_column_id: 0,
        })
    }

    /// Schema with no columns, as sent by clients that omit it
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            column_ids: Vec::new(),
            num_key_columns: 0,
            version: 0,
            next_column_id: 0,
        }
    }

    /// Build a client schema and attach explicit ids (client-side misuse in tests)
    pub fn with_column_ids(mut self, ids: Vec<ColumnId>) -> Result<Self> {
        if ids.len() != self.columns.len() {
            return Err(TabletError::InvalidSchema("One column id per column required".into()));
        }
        self.next_column_id = ids.iter().max().map(|m| m + 1).unwrap_or(0);
        self.column_ids = ids;
        Ok(self)
    }

    /// Turn a client schema into a tablet schema, assigning ids from zero
    pub fn assign_ids(&self) -> Result<Schema> {
        if self.has_column_ids() {
            return Err(TabletError::InvalidSchema(
                "User requests should not have Column IDs".into(),
            ));
        }
        if self.num_key_columns == 0 {
            return Err(TabletError::InvalidSchema(
                "Schema must have at least one key column".into(),
            ));
        }
        let mut schema = self.clone();
        schema.column_ids = (0..self.columns.len() as ColumnId).collect();
        schema.next_column_id = self.columns.len() as ColumnId;
        schema.version = 0;
        Ok(schema)
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &ColumnSchema {
        &self.columns[idx]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn is_key_column(&self, idx: usize) -> bool {
        idx < self.num_key_columns
    }

    pub fn has_column_ids(&self) -> bool {
        !self.column_ids.is_empty()
    }

    pub fn column_ids(&self) -> &[ColumnId] {
        &self.column_ids
    }

    /// Id of the column at `idx`; only valid for server-side schemas
    pub fn column_id(&self, idx: usize) -> ColumnId {
        self.column_ids[idx]
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn next_column_id(&self) -> ColumnId {
        self.next_column_id
    }

    /// Index of the column with the given name
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index of the column with the given id
    pub fn find_column_by_id(&self, id: ColumnId) -> Option<usize> {
        self.column_ids.iter().position(|&c| c == id)
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.find_column_by_id(id).map(|idx| &self.columns[idx])
    }

    /// The same columns with ids stripped, as a client would see them
    pub fn without_ids(&self) -> Schema {
        Schema {
            columns: self.columns.clone(),
            column_ids: Vec::new(),
            num_key_columns: self.num_key_columns,
            version: 0,
            next_column_id: 0,
        }
    }

    /// Schema made of the key columns only
    pub fn key_projection(&self) -> Schema {
        Schema {
            columns: self.key_columns().to_vec(),
            column_ids: self.column_ids.iter().take(self.num_key_columns).copied().collect(),
            num_key_columns: self.num_key_columns,
            version: self.version,
            next_column_id: self.next_column_id,
        }
    }

    /// Validate a client schema sent along with a write
    ///
    /// `required` asks that every column a new row needs (key columns and
    /// non-nullable columns without a write default) be present.
    pub fn validate_client_schema(&self, client: &Schema, required: bool) -> Result<()> {
        if client.has_column_ids() {
            return Err(TabletError::InvalidSchema(
                "User requests should not have Column IDs".into(),
            ));
        }

        for col in client.columns() {
            let idx = self.find_column(&col.name).ok_or_else(|| {
                TabletError::MismatchedSchema(format!(
                    "Client provided column {} not present in tablet",
                    col
                ))
            })?;
            self.check_column_type(&self.columns[idx], col)?;
        }

        if required {
            for (idx, col) in self.columns.iter().enumerate() {
                let needed = self.is_key_column(idx) || (!col.nullable && col.write_default.is_none());
                if needed && client.find_column(&col.name).is_none() {
                    return Err(TabletError::MismatchedSchema(format!(
                        "Client missing required column: {}",
                        col
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve a client projection against this schema, returning it with ids
    pub fn resolve_projection(&self, projection: &Schema) -> Result<Schema> {
        if projection.has_column_ids() {
            return Err(TabletError::InvalidSchema(
                "User requests should not have Column IDs".into(),
            ));
        }

        let missing: Vec<&str> = projection
            .columns()
            .iter()
            .filter(|c| self.find_column(&c.name).is_none())
            .map(|c| c.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(TabletError::MismatchedSchema(format!(
                "Some columns are not present in the current schema: {}",
                missing.join(", ")
            )));
        }

        let mut columns = Vec::with_capacity(projection.num_columns());
        let mut ids = Vec::with_capacity(projection.num_columns());
        for col in projection.columns() {
            // presence checked above
            let idx = self.find_column(&col.name).ok_or_else(|| {
                TabletError::Internal(format!("column {} vanished", col.name))
            })?;
            let tablet_col = &self.columns[idx];
            self.check_column_type(tablet_col, col)?;
            columns.push(tablet_col.clone());
            ids.push(self.column_ids[idx]);
        }

        Ok(Schema {
            columns,
            column_ids: ids,
            num_key_columns: 0,
            version: self.version,
            next_column_id: self.next_column_id,
        })
    }

    /// Compute the schema that results from altering this one to `requested`
    ///
    /// Columns are matched by name. Existing columns keep their ids and type,
    /// new columns receive fresh ids, and the key may not change.
    pub fn alter(&self, requested: &Schema) -> Result<Schema> {
        if requested.has_column_ids() {
            return Err(TabletError::InvalidSchema(
                "User requests should not have Column IDs".into(),
            ));
        }
        if requested.num_key_columns != self.num_key_columns {
            return Err(TabletError::InvalidSchema(
                "Altering the primary key is not supported".into(),
            ));
        }

        let mut next_id = self.next_column_id;
        let mut ids = Vec::with_capacity(requested.num_columns());
        for (idx, col) in requested.columns().iter().enumerate() {
            match self.find_column(&col.name) {
                Some(existing) => {
                    if self.is_key_column(existing) != requested.is_key_column(idx)
                        || (self.is_key_column(existing) && existing != idx)
                    {
                        return Err(TabletError::InvalidSchema(format!(
                            "Key columns must not change: {}",
                            col
                        )));
                    }
                    if !self.columns[existing].type_equals(col) {
                        return Err(TabletError::InvalidSchema(format!(
                            "Cannot change the type of column {} to {}",
                            self.columns[existing],
                            col.type_description()
                        )));
                    }
                    ids.push(self.column_ids[existing]);
                }
                None => {
                    if requested.is_key_column(idx) {
                        return Err(TabletError::InvalidSchema(format!(
                            "Key columns must not change: {}",
                            col
                        )));
                    }
                    if !col.nullable && col.read_default.is_none() {
                        return Err(TabletError::InvalidSchema(format!(
                            "Added non-nullable column {} requires a read default",
                            col
                        )));
                    }
                    ids.push(next_id);
                    next_id += 1;
                }
            }
        }

        Ok(Schema {
            columns: requested.columns.clone(),
            column_ids: ids,
            num_key_columns: self.num_key_columns,
            version: self.version + 1,
            next_column_id: next_id,
        })
    }

    /// Human readable rendering of a row laid out in this schema
    pub fn debug_row(&self, values: &[Value]) -> String {
        let cells: Vec<String> = self
            .columns
            .iter()
            .zip(values)
            .map(|(col, v)| format!("{} {}={}", col.data_type, col.name, v))
            .collect();
        format!("({})", cells.join(", "))
    }

    fn check_column_type(&self, tablet_col: &ColumnSchema, client_col: &ColumnSchema) -> Result<()> {
        if !tablet_col.type_equals(client_col) {
            return Err(TabletError::MismatchedSchema(format!(
                "The column '{}' must have type {} found {}",
                tablet_col.name,
                tablet_col.type_description(),
                client_col.type_description()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(f, "Schema [{}] (version {})", cols.join(", "), self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
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
    fn test_column_display() {
        let col = ColumnSchema::new("key", DataType::UInt32);
        assert_eq!(col.to_string(), "key[uint32 NOT NULL]");
        assert_eq!(col.nullable().to_string(), "key[uint32 NULLABLE]");
    }

    #[test]
    fn test_missing_key_column() {
        let schema = test_schema();
        let err = schema.validate_client_schema(&Schema::empty(), true).unwrap_err();
        assert_eq!(err.code(), crate::TabletServerErrorCode::MismatchedSchema);
        assert!(err
            .to_string()
            .contains("Client missing required column: key[uint32 NOT NULL]"));

        // An empty schema is fine when nothing is being written
        schema.validate_client_schema(&Schema::empty(), false).unwrap();
    }

    #[test]
    fn test_extra_client_column() {
        let schema = test_schema();
        let mut cols = schema.columns().to_vec();
        cols.push(ColumnSchema::new("col_doesnt_exist", DataType::UInt32));
        let client = Schema::new(cols, 1).unwrap();

        let err = schema.validate_client_schema(&client, true).unwrap_err();
        assert!(err.to_string().contains(
            "Client provided column col_doesnt_exist[uint32 NOT NULL] not present in tablet"
        ));
    }

    #[test]
    fn test_client_ids_rejected() {
        let schema = test_schema();
        let err = schema.validate_client_schema(&schema, true).unwrap_err();
        assert_eq!(err.code(), crate::TabletServerErrorCode::InvalidSchema);
        assert!(err.to_string().contains("User requests should not have Column IDs"));
    }

    #[test]
    fn test_projection_errors() {
        let schema = test_schema();

        let bad = Schema::new(vec![ColumnSchema::new("col_doesnt_exist", DataType::UInt32)], 0).unwrap();
        let err = schema.resolve_projection(&bad).unwrap_err();
        assert!(err
            .to_string()
            .contains("Some columns are not present in the current schema: col_doesnt_exist"));

        let nullable = Schema::new(vec![ColumnSchema::new("int_val", DataType::UInt32).nullable()], 0).unwrap();
        let err = schema.resolve_projection(&nullable).unwrap_err();
        assert!(err
            .to_string()
            .contains("The column 'int_val' must have type uint32 NOT NULL found uint32 NULLABLE"));

        let wrong_type = Schema::new(vec![ColumnSchema::new("int_val", DataType::Int32)], 0).unwrap();
        let err = schema.resolve_projection(&wrong_type).unwrap_err();
        assert!(err
            .to_string()
            .contains("The column 'int_val' must have type uint32 NOT NULL found int32 NOT NULL"));

        let ok = Schema::new(vec![ColumnSchema::new("string_val", DataType::String).nullable()], 0).unwrap();
        let resolved = schema.resolve_projection(&ok).unwrap();
        assert_eq!(resolved.column_ids(), &[2]);
    }

    #[test]
    fn test_alter_never_reuses_ids() {
        let schema = test_schema();

        // Drop int_val, then add a column with the same name back
        let dropped = Schema::new(
            vec![schema.column(0).clone(), schema.column(2).clone()],
            1,
        )
        .unwrap();
        let v1 = schema.alter(&dropped).unwrap();
        assert_eq!(v1.version(), 1);
        assert_eq!(v1.column_ids(), &[0, 2]);

        let readded = Schema::new(
            vec![
                schema.column(0).clone(),
                schema.column(2).clone(),
                ColumnSchema::new("int_val", DataType::UInt32).with_read_default(Value::UInt32(0)),
            ],
            1,
        )
        .unwrap();
        let v2 = v1.alter(&readded).unwrap();
        assert_eq!(v2.version(), 2);
        assert_eq!(v2.column_ids(), &[0, 2, 3]);
        assert_eq!(v2.next_column_id(), 4);
    }

    #[test]
    fn test_alter_rejects_key_change_and_bare_non_null() {
        let schema = test_schema();

        let rekeyed = Schema::new(
            vec![schema.column(1).clone(), schema.column(0).clone()],
            1,
        )
        .unwrap();
        assert!(schema.alter(&rekeyed).is_err());

        let mut cols = schema.columns().to_vec();
        cols.push(ColumnSchema::new("c2", DataType::UInt32));
        let no_default = Schema::new(cols, 1).unwrap();
        assert!(schema.alter(&no_default).is_err());
    }

    #[test]
    fn test_key_column_rules() {
        assert!(Schema::new(vec![ColumnSchema::new("k", DataType::Double)], 1).is_err());
        assert!(Schema::new(vec![ColumnSchema::new("k", DataType::UInt32).nullable()], 1).is_err());
        assert!(Schema::new(vec![ColumnSchema::new("k", DataType::UInt32)], 2).is_err());
    }

    #[test]
    fn test_debug_row() {
        let schema = test_schema();
        let row = schema.debug_row(&[
            Value::UInt32(50),
            Value::UInt32(100),
            Value::String("hello 50".into()),
        ]);
        assert_eq!(row, "(uint32 key=50, uint32 int_val=100, string string_val=hello 50)");
    }
}
