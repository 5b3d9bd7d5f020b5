//! Row mutations and their binary encoding
//!
//! A [`RowChange`] is an UPDATE, DELETE or REINSERT applied to an existing
//! row. The wire form is a one byte type tag followed, for UPDATE and
//! REINSERT, by `(column id, null flag, value)` entries. Client batches frame
//! each change with a 4 byte little-endian length.

mod decoder;
mod encoder;

pub use decoder::{split_mutations, RowChangeListDecoder};
pub use encoder::{frame_mutations, RowChangeListEncoder};

use crate::row::Row;
use crate::schema::ColumnId;
use crate::types::Value;
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};

/// Row change type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeType {
    Update = 1,
    Delete = 2,
    Reinsert = 3,
}

impl TryFrom<u8> for ChangeType {
    type Error = TabletError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ChangeType::Update),
            2 => Ok(ChangeType::Delete),
            3 => Ok(ChangeType::Reinsert),
            _ => Err(TabletError::InvalidMutation("bad type enum value".into())),
        }
    }
}

/// A decoded mutation against a single row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    /// New values for a set of non-key columns
    Update(Vec<(ColumnId, Value)>),
    /// Remove the row
    Delete,
    /// Bring a deleted row back with the given contents
    Reinsert(Row),
}

impl RowChange {
    pub fn change_type(&self) -> ChangeType {
        match self {
            RowChange::Update(_) => ChangeType::Update,
            RowChange::Delete => ChangeType::Delete,
            RowChange::Reinsert(_) => ChangeType::Reinsert,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowChange::Delete)
    }

    pub fn is_reinsert(&self) -> bool {
        matches!(self, RowChange::Reinsert(_))
    }

    /// Apply this change to the row state, `None` meaning deleted
    pub fn apply(&self, row: &mut Option<Row>) {
        match self {
            RowChange::Update(updates) => {
                if let Some(r) = row.as_mut() {
                    r.apply_updates(updates);
                }
            }
            RowChange::Delete => *row = None,
            RowChange::Reinsert(new_row) => *row = Some(new_row.clone()),
        }
    }

    /// The one change with the same effect as `self` then `later`
    pub fn followed_by(self, later: RowChange) -> RowChange {
        match (self, later) {
            (_, RowChange::Delete) => RowChange::Delete,
            (_, RowChange::Reinsert(row)) => RowChange::Reinsert(row),
            (RowChange::Update(mut updates), RowChange::Update(later)) => {
                for (id, value) in later {
                    match updates.iter_mut().find(|(existing, _)| *existing == id) {
                        Some(slot) => slot.1 = value,
                        None => updates.push((id, value)),
                    }
                }
                RowChange::Update(updates)
            }
            (RowChange::Delete, RowChange::Update(_)) => RowChange::Delete,
            (RowChange::Reinsert(mut row), RowChange::Update(updates)) => {
                row.apply_updates(&updates);
                RowChange::Reinsert(row)
            }
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        match self {
            RowChange::Update(updates) => 1 + updates.iter().map(|(_, v)| v.size() + 4).sum::<usize>(),
            RowChange::Delete => 1,
            RowChange::Reinsert(row) => 1 + row.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sequence() {
        let mut base = Row::new();
        base.set(0, Value::UInt32(1));
        base.set(1, Value::UInt32(10));

        let mut state = Some(base.clone());
        RowChange::Update(vec![(1, Value::UInt32(11))]).apply(&mut state);
        assert_eq!(state.as_ref().unwrap().get(1), Some(&Value::UInt32(11)));

        RowChange::Delete.apply(&mut state);
        assert!(state.is_none());

        // Updates do not resurrect a deleted row
        RowChange::Update(vec![(1, Value::UInt32(12))]).apply(&mut state);
        assert!(state.is_none());

        RowChange::Reinsert(base).apply(&mut state);
        assert_eq!(state.as_ref().unwrap().get(1), Some(&Value::UInt32(10)));
    }

    #[test]
    fn test_followed_by_matches_sequential_apply() {
        let mut base = Row::new();
        base.set(0, Value::UInt32(1));
        base.set(1, Value::UInt32(10));
        base.set(2, Value::UInt32(20));
        let mut revived = base.clone();
        revived.set(1, Value::UInt32(99));

        let changes = [
            RowChange::Update(vec![(1, Value::UInt32(11))]),
            RowChange::Update(vec![(2, Value::UInt32(21)), (1, Value::UInt32(12))]),
            RowChange::Delete,
            RowChange::Reinsert(revived),
            RowChange::Update(vec![(2, Value::UInt32(22))]),
        ];
        for first in &changes {
            for second in &changes {
                let mut sequential = Some(base.clone());
                first.apply(&mut sequential);
                second.apply(&mut sequential);

                let mut folded = Some(base.clone());
                first.clone().followed_by(second.clone()).apply(&mut folded);
                assert_eq!(folded, sequential, "{:?} then {:?}", first, second);
            }
        }
    }

    #[test]
    fn test_bad_type_tag() {
        let err = ChangeType::try_from(b'x').unwrap_err();
        assert!(err.to_string().contains("bad type enum value"));
    }
}
