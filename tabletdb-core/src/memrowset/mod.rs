//! In-memory row store
//!
//! The MemRowSet receives every insert made since the last flush. Rows are
//! kept in a concurrent skip list ordered by encoded primary key; each row
//! carries its insertion timestamp and the list of mutations applied to it
//! afterwards. Writers on the same key are serialized by the tablet's row
//! locks, so per-row mutation lists are in timestamp order.

use crate::encoding::EncodedKey;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::rowset::{MissedMutation, RowIterator, RowSet, RowSetId, RowSetKind};
use crate::{Result, TabletError};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A row resident in the MemRowSet
struct MemRow {
    insert_ts: Timestamp,
    base: Row,
    mutations: RwLock<Vec<(Timestamp, RowChange)>>,
}

impl MemRow {
    /// Row state as of `snapshot`, `None` if invisible or deleted
    fn state_at(&self, snapshot: &MvccSnapshot) -> Option<Row> {
        if !snapshot.is_committed(self.insert_ts) {
            return None;
        }
        let mut state = Some(self.base.clone());
        for (ts, change) in self.mutations.read().iter() {
            if snapshot.is_committed(*ts) {
                change.apply(&mut state);
            }
        }
        state
    }

    /// Whether the row is live once every applied mutation is considered
    fn is_live(&self) -> bool {
        let mutations = self.mutations.read();
        let mut live = true;
        for (_, change) in mutations.iter() {
            live = match change {
                RowChange::Delete => false,
                RowChange::Reinsert(_) => true,
                RowChange::Update(_) => live,
            };
        }
        live
    }
}

/// In-memory row store for recent inserts
pub struct MemRowSet {
    id: RowSetId,
    rows: SkipMap<EncodedKey, Arc<MemRow>>,
    size_bytes: AtomicUsize,
}

impl MemRowSet {
    pub fn new(id: RowSetId) -> Self {
        Self {
            id,
            rows: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
        }
    }

    /// Insert a new row
    ///
    /// Inserting over a deleted row turns into a REINSERT mutation of that row.
    pub fn insert(&self, key: EncodedKey, row: Row, ts: Timestamp) -> Result<()> {
        let entry_size = key.len() + row.size();
        if let Some(entry) = self.rows.get(&key) {
            let existing = entry.value();
            if existing.is_live() {
                return Err(TabletError::AlreadyPresent(format!("key already present: {:?}", key)));
            }
            existing.mutations.write().push((ts, RowChange::Reinsert(row)));
            self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
            return Ok(());
        }

        self.rows.insert(
            key,
            Arc::new(MemRow {
                insert_ts: ts,
                base: row,
                mutations: RwLock::new(Vec::new()),
            }),
        );
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a mutation to a live row
    pub fn mutate(&self, key: &EncodedKey, change: &RowChange, ts: Timestamp) -> Result<()> {
        let entry = self
            .rows
            .get(key)
            .ok_or_else(|| TabletError::NotFound("key not found".into()))?;
        let row = entry.value();
        if !row.is_live() {
            return Err(TabletError::NotFound("key not found (deleted)".into()));
        }
        row.mutations.write().push((ts, change.clone()));
        self.size_bytes.fetch_add(change.size() + 8, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a live row with this key exists
    pub fn check_row_present(&self, key: &EncodedKey) -> bool {
        self.rows.get(key).map(|e| e.value().is_live()).unwrap_or(false)
    }

    /// Row state for one key as of `snapshot`
    pub fn get(&self, key: &EncodedKey, snapshot: &MvccSnapshot) -> Option<Row> {
        self.rows.get(key).and_then(|e| e.value().state_at(snapshot))
    }

    /// Number of entries, including deleted rows
    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }
}

impl RowSet for MemRowSet {
    fn id(&self) -> RowSetId {
        self.id
    }

    fn kind(&self) -> RowSetKind {
        RowSetKind::Memory
    }

    fn check_row_present(&self, key: &EncodedKey) -> Result<bool> {
        Ok(MemRowSet::check_row_present(self, key))
    }

    fn mutate_row(&self, key: &EncodedKey, change: &RowChange, ts: Timestamp) -> Result<()> {
        self.mutate(key, change, ts)
    }

    fn new_row_iterator(self: Arc<Self>, snapshot: MvccSnapshot) -> RowIterator {
        Box::new(MemRowSetIterator {
            mrs: self,
            snapshot,
            last_key: None,
        })
    }

    fn missed_mutations(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Result<Vec<MissedMutation>> {
        let mut missed = Vec::new();
        for entry in self.rows.iter() {
            for (ts, change) in entry.value().mutations.read().iter() {
                if upto.is_newly_committed(since, *ts) {
                    missed.push(MissedMutation {
                        key: entry.key().clone(),
                        ts: *ts,
                        change: change.clone(),
                    });
                }
            }
        }
        Ok(missed)
    }

    fn is_mutation_durable(&self, _key: &EncodedKey, _ts: Timestamp) -> Result<bool> {
        Ok(false)
    }

    fn memory_footprint(&self) -> usize {
        self.size()
    }

    fn describe(&self) -> String {
        format!("MemRowSet({})", self.id)
    }
}

/// Restartable cursor over a MemRowSet
///
/// Each step re-seeks past the last returned key, so concurrent inserts
/// never invalidate the iterator.
struct MemRowSetIterator {
    mrs: Arc<MemRowSet>,
    snapshot: MvccSnapshot,
    last_key: Option<EncodedKey>,
}

impl Iterator for MemRowSetIterator {
    type Item = Result<(EncodedKey, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match &self.last_key {
                None => self.mrs.rows.front(),
                Some(last) => self.mrs.rows.lower_bound(Bound::Excluded(last)),
            }?;
            let key = entry.key().clone();
            let state = entry.value().state_at(&self.snapshot);
            self.last_key = Some(key.clone());
            if let Some(row) = state {
                return Some(Ok((key, row)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{LogicalClock, MvccManager};
    use crate::types::Value;

    fn key(k: u32) -> EncodedKey {
        EncodedKey::from_bytes(k.to_be_bytes().to_vec())
    }

    fn row(k: u32, v: u32) -> Row {
        let mut r = Row::new();
        r.set(0, Value::UInt32(k));
        r.set(1, Value::UInt32(v));
        r
    }

    fn write<F: FnOnce(Timestamp)>(mvcc: &MvccManager, f: F) -> Timestamp {
        let ts = mvcc.start_transaction();
        f(ts);
        mvcc.commit_transaction(ts);
        ts
    }

    #[test]
    fn test_insert_and_duplicate() {
        let mvcc = MvccManager::new(Arc::new(LogicalClock::new()));
        let mrs = MemRowSet::new(0);

        write(&mvcc, |ts| mrs.insert(key(1), row(1, 1), ts).unwrap());
        let ts = mvcc.start_transaction();
        let err = mrs.insert(key(1), row(1, 2), ts).unwrap_err();
        assert!(matches!(err, TabletError::AlreadyPresent(_)));
        mvcc.abort_transaction(ts);
        assert_eq!(mrs.entry_count(), 1);
    }

    #[test]
    fn test_snapshot_iteration() {
        let mvcc = MvccManager::new(Arc::new(LogicalClock::new()));
        let mrs = Arc::new(MemRowSet::new(0));

        for k in [3, 1, 2] {
            write(&mvcc, |ts| mrs.insert(key(k), row(k, k), ts).unwrap());
        }
        let before_update = mvcc.snapshot_at_latest();
        write(&mvcc, |ts| {
            mrs.mutate(&key(2), &RowChange::Update(vec![(1, Value::UInt32(20))]), ts)
                .unwrap()
        });
        write(&mvcc, |ts| mrs.mutate(&key(3), &RowChange::Delete, ts).unwrap());

        let rows: Vec<_> = mrs
            .clone()
            .new_row_iterator(mvcc.snapshot_at_latest())
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(rows, vec![row(1, 1), row(2, 20)]);

        let old: Vec<_> = mrs
            .clone()
            .new_row_iterator(before_update)
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(old, vec![row(1, 1), row(2, 2), row(3, 3)]);
    }

    #[test]
    fn test_deleted_row_semantics() {
        let mvcc = MvccManager::new(Arc::new(LogicalClock::new()));
        let mrs = MemRowSet::new(0);

        write(&mvcc, |ts| mrs.insert(key(1), row(1, 1), ts).unwrap());
        write(&mvcc, |ts| mrs.mutate(&key(1), &RowChange::Delete, ts).unwrap());

        assert!(!mrs.check_row_present(&key(1)));
        let ts = mvcc.start_transaction();
        assert!(matches!(
            mrs.mutate(&key(1), &RowChange::Delete, ts),
            Err(TabletError::NotFound(_))
        ));
        mvcc.abort_transaction(ts);

        // Insert over a deleted row becomes a reinsert
        write(&mvcc, |ts| mrs.insert(key(1), row(1, 9), ts).unwrap());
        assert!(mrs.check_row_present(&key(1)));
        assert_eq!(mrs.get(&key(1), &mvcc.snapshot_at_latest()), Some(row(1, 9)));
        assert_eq!(mrs.entry_count(), 1);
    }

    #[test]
    fn test_missed_mutations() {
        let mvcc = MvccManager::new(Arc::new(LogicalClock::new()));
        let mrs = MemRowSet::new(0);

        write(&mvcc, |ts| mrs.insert(key(1), row(1, 1), ts).unwrap());
        let s1 = mvcc.snapshot_at_latest();
        let t = write(&mvcc, |ts| {
            mrs.mutate(&key(1), &RowChange::Update(vec![(1, Value::UInt32(5))]), ts)
                .unwrap()
        });
        let s2 = mvcc.snapshot_at_latest();

        let missed = mrs.missed_mutations(&s1, &s2).unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].ts, t);
        assert_eq!(missed[0].key, key(1));
        assert!(mrs.missed_mutations(&s2, &s2).unwrap().is_empty());
    }

    #[test]
    fn test_iterator_sees_concurrent_inserts_after_cursor() {
        let mvcc = MvccManager::new(Arc::new(LogicalClock::new()));
        let mrs = Arc::new(MemRowSet::new(0));
        write(&mvcc, |ts| mrs.insert(key(1), row(1, 1), ts).unwrap());
        write(&mvcc, |ts| mrs.insert(key(5), row(5, 5), ts).unwrap());

        let mut iter = mrs.clone().new_row_iterator(MvccSnapshot::all());
        assert_eq!(iter.next().unwrap().unwrap().0, key(1));
        write(&mvcc, |ts| mrs.insert(key(3), row(3, 3), ts).unwrap());
        assert_eq!(iter.next().unwrap().unwrap().0, key(3));
        assert_eq!(iter.next().unwrap().unwrap().0, key(5));
        assert!(iter.next().is_none());
    }
}
