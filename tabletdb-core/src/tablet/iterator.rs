//! Projected, filtered scans over a tablet snapshot

use crate::row::Row;
use crate::rowset::RowIterator;
use crate::schema::Schema;
use crate::types::Value;
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Inclusive range condition on one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRangePredicate {
    pub column: String,
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl ColumnRangePredicate {
    pub fn new(column: impl Into<String>, lower: Option<Value>, upper: Option<Value>) -> Self {
        Self {
            column: column.into(),
            lower,
            upper,
        }
    }

    pub fn equals(column: impl Into<String>, value: Value) -> Self {
        Self::new(column, Some(value.clone()), Some(value))
    }
}

/// A predicate bound to a column of the tablet schema
#[derive(Debug, Clone)]
struct BoundPredicate {
    col_idx: usize,
    lower: Option<Value>,
    upper: Option<Value>,
}

impl BoundPredicate {
    fn bind(schema: &Schema, pred: &ColumnRangePredicate) -> Result<Self> {
        let col_idx = schema.find_column(&pred.column).ok_or_else(|| {
            TabletError::MismatchedSchema(format!(
                "Some columns are not present in the current schema: {}",
                pred.column
            ))
        })?;
        let col = schema.column(col_idx);
        for bound in [&pred.lower, &pred.upper].into_iter().flatten() {
            if bound.is_null() || !bound.matches(col.data_type) {
                return Err(TabletError::InvalidArgument(format!(
                    "bad predicate bound {} for column {}",
                    bound, col
                )));
            }
        }
        Ok(Self {
            col_idx,
            lower: pred.lower.clone(),
            upper: pred.upper.clone(),
        })
    }

    fn matches(&self, schema: &Schema, row: &Row) -> bool {
        let value = row.value_for(schema, self.col_idx);
        if value.is_null() {
            return false;
        }
        if let Some(lower) = &self.lower {
            if &value < lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if &value > upper {
                return false;
            }
        }
        true
    }
}

/// Rows of a tablet in key order, filtered and projected
pub struct TabletIterator {
    rows: RowIterator,
    schema: Arc<Schema>,
    projection: Schema,
    predicates: Vec<BoundPredicate>,
}

impl TabletIterator {
    pub(crate) fn new(
        rows: RowIterator,
        schema: Arc<Schema>,
        projection: Schema,
        predicates: &[ColumnRangePredicate],
    ) -> Result<Self> {
        let predicates = predicates
            .iter()
            .map(|p| BoundPredicate::bind(&schema, p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rows,
            schema,
            projection,
            predicates,
        })
    }

    /// Projection with tablet column ids resolved
    pub fn projection(&self) -> &Schema {
        &self.projection
    }
}

impl Iterator for TabletIterator {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, row) = match self.rows.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };
            if self.predicates.iter().all(|p| p.matches(&self.schema, &row)) {
                return Some(Ok(row.project(&self.projection)));
            }
        }
    }
}
