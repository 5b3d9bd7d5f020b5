//! Delta tracking for on-disk row sets
//!
//! Base data of a DiskRowSet never changes. Updates and deletes that reach
//! its rows afterwards are recorded as deltas keyed by `(row index,
//! timestamp)`: first in a mutable [`DeltaMemStore`], then in immutable
//! [`DeltaFile`]s once the memstore is flushed. Reads merge the deltas of a
//! row in increasing timestamp order on top of the base row.

mod file;
mod memstore;
mod tracker;

pub use file::DeltaFile;
pub use memstore::DeltaMemStore;
pub use tracker::DeltaTracker;

use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use serde::{Deserialize, Serialize};

/// Position of a delta: the row it applies to and when
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeltaKey {
    pub row_idx: u32,
    pub ts: Timestamp,
}

impl DeltaKey {
    pub fn new(row_idx: u32, ts: Timestamp) -> Self {
        Self { row_idx, ts }
    }
}

/// Common read interface of delta stores
pub trait DeltaStore: Send + Sync {
    /// Deltas of one row in timestamp order
    fn deltas_for_row(&self, row_idx: u32) -> Vec<(Timestamp, RowChange)>;

    /// Every delta committed in `upto` but not in `since`
    fn deltas_between(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Vec<(DeltaKey, RowChange)>;

    fn contains(&self, key: &DeltaKey) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply deltas visible in `snapshot` to a base row
///
/// `deltas` must be sorted by timestamp. A DELETE removes the row; a later
/// REINSERT brings it back.
pub fn apply_deltas(base: Row, deltas: &[(Timestamp, RowChange)], snapshot: &MvccSnapshot) -> Option<Row> {
    let mut state = Some(base);
    for (ts, change) in deltas {
        if snapshot.is_committed(*ts) {
            change.apply(&mut state);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_apply_respects_snapshot() {
        let mut base = Row::new();
        base.set(1, Value::UInt32(1));
        let deltas = vec![
            (Timestamp::new(5), RowChange::Update(vec![(1, Value::UInt32(2))])),
            (Timestamp::new(6), RowChange::Delete),
            (Timestamp::new(8), RowChange::Reinsert(base.clone())),
        ];

        let at = |t| apply_deltas(base.clone(), &deltas, &MvccSnapshot::committed_before(Timestamp::new(t)));
        assert_eq!(at(5).unwrap().get(1), Some(&Value::UInt32(1)));
        assert_eq!(at(6).unwrap().get(1), Some(&Value::UInt32(2)));
        assert!(at(7).is_none());
        assert_eq!(at(9).unwrap().get(1), Some(&Value::UInt32(1)));
    }
}
