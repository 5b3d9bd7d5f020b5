//! Mutable in-memory delta store

use super::{DeltaKey, DeltaStore};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowchange::RowChange;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deltas accepted since the last delta flush
#[derive(Default)]
pub struct DeltaMemStore {
    deltas: SkipMap<DeltaKey, RowChange>,
    size_bytes: AtomicUsize,
}

impl DeltaMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change to a base row
    ///
    /// A second change to the same row at the same timestamp is folded into
    /// the first. Callers hold the row lock.
    pub fn update(&self, row_idx: u32, ts: Timestamp, change: RowChange) {
        let key = DeltaKey::new(row_idx, ts);
        let change = match self.deltas.get(&key) {
            Some(earlier) => earlier.value().clone().followed_by(change),
            None => change,
        };
        self.size_bytes.fetch_add(change.size() + 12, Ordering::Relaxed);
        self.deltas.insert(key, change);
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// All deltas in key order
    pub fn entries(&self) -> Vec<(DeltaKey, RowChange)> {
        self.deltas
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

impl DeltaStore for DeltaMemStore {
    fn deltas_for_row(&self, row_idx: u32) -> Vec<(Timestamp, RowChange)> {
        let start = DeltaKey::new(row_idx, Timestamp::MIN);
        let end = DeltaKey::new(row_idx, Timestamp::MAX);
        self.deltas
            .range(start..=end)
            .map(|e| (e.key().ts, e.value().clone()))
            .collect()
    }

    fn deltas_between(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Vec<(DeltaKey, RowChange)> {
        self.deltas
            .iter()
            .filter(|e| upto.is_newly_committed(since, e.key().ts))
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    fn contains(&self, key: &DeltaKey) -> bool {
        self.deltas.contains_key(key)
    }

    fn len(&self) -> usize {
        self.deltas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_row_deltas_in_order() {
        let dms = DeltaMemStore::new();
        dms.update(1, Timestamp::new(9), RowChange::Delete);
        dms.update(2, Timestamp::new(3), RowChange::Delete);
        dms.update(1, Timestamp::new(4), RowChange::Update(vec![(1, Value::UInt32(4))]));

        let deltas = dms.deltas_for_row(1);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].0, Timestamp::new(4));
        assert_eq!(deltas[1].0, Timestamp::new(9));
        assert!(dms.contains(&DeltaKey::new(2, Timestamp::new(3))));
        assert!(dms.size() > 0);
    }

    #[test]
    fn test_same_transaction_changes_fold() {
        let dms = DeltaMemStore::new();
        let ts = Timestamp::new(7);
        dms.update(3, ts, RowChange::Update(vec![(1, Value::UInt32(10))]));
        dms.update(3, ts, RowChange::Update(vec![(2, Value::UInt32(20))]));

        assert_eq!(dms.len(), 1);
        assert_eq!(
            dms.deltas_for_row(3),
            vec![(ts, RowChange::Update(vec![(1, Value::UInt32(10)), (2, Value::UInt32(20))]))]
        );

        dms.update(3, ts, RowChange::Delete);
        assert_eq!(dms.deltas_for_row(3), vec![(ts, RowChange::Delete)]);
    }
}
