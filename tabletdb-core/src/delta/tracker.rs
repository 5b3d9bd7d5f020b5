//! Per row set delta bookkeeping

use super::{apply_deltas, DeltaFile, DeltaKey, DeltaMemStore, DeltaStore};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct DeltaStores {
    dms: Arc<DeltaMemStore>,
    /// Memstore being written out; still readable until its file is installed
    flushing: Option<Arc<DeltaMemStore>>,
    files: Vec<Arc<DeltaFile>>,
}

impl DeltaStores {
    fn all(&self) -> Vec<Arc<dyn DeltaStore>> {
        let mut stores: Vec<Arc<dyn DeltaStore>> = Vec::with_capacity(self.files.len() + 2);
        for file in &self.files {
            stores.push(file.clone());
        }
        if let Some(flushing) = &self.flushing {
            stores.push(flushing.clone());
        }
        stores.push(self.dms.clone());
        stores
    }
}

/// Tracks the delta stores of one DiskRowSet
pub struct DeltaTracker {
    dir: PathBuf,
    stores: RwLock<DeltaStores>,
    next_file_id: AtomicU64,
}

impl DeltaTracker {
    /// Open the durable delta files listed in row set metadata
    pub fn open(dir: &Path, file_ids: &[u64]) -> Result<Self> {
        let mut files = Vec::with_capacity(file_ids.len());
        for &id in file_ids {
            files.push(Arc::new(DeltaFile::open(&Self::file_path(dir, id), id)?));
        }
        let next_id = file_ids.iter().max().map(|m| m + 1).unwrap_or(0);

        Ok(Self {
            dir: dir.to_path_buf(),
            stores: RwLock::new(DeltaStores {
                dms: Arc::new(DeltaMemStore::new()),
                flushing: None,
                files,
            }),
            next_file_id: AtomicU64::new(next_id),
        })
    }

    fn file_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("delta_{:010}.dlt", id))
    }

    /// Record a mutation of a base row
    pub fn update(&self, row_idx: u32, change: RowChange, ts: Timestamp) {
        // Held across the insert so a concurrent flush cannot swap the memstore out from under us
        let stores = self.stores.read();
        stores.dms.update(row_idx, ts, change);
    }

    /// Deltas of one row from every store, in timestamp order
    pub fn deltas_for_row(&self, row_idx: u32) -> Vec<(Timestamp, RowChange)> {
        let stores = self.stores.read().all();
        let mut deltas: Vec<(Timestamp, RowChange)> = stores
            .iter()
            .flat_map(|s| s.deltas_for_row(row_idx))
            .collect();
        deltas.sort_by_key(|(ts, _)| *ts);
        deltas
    }

    /// Row contents as of `snapshot`, `None` if deleted
    pub fn row_state(&self, row_idx: u32, base: Row, snapshot: &MvccSnapshot) -> Option<Row> {
        let deltas = self.deltas_for_row(row_idx);
        apply_deltas(base, &deltas, snapshot)
    }

    /// Whether the row is deleted once every applied delta is considered
    pub fn is_deleted(&self, row_idx: u32) -> bool {
        let mut deleted = false;
        for (_, change) in self.deltas_for_row(row_idx) {
            match change {
                RowChange::Delete => deleted = true,
                RowChange::Reinsert(_) => deleted = false,
                RowChange::Update(_) => {}
            }
        }
        deleted
    }

    /// Deltas committed in `upto` but not in `since`, across all stores
    pub fn deltas_between(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Vec<(DeltaKey, RowChange)> {
        let stores = self.stores.read().all();
        let mut deltas: Vec<(DeltaKey, RowChange)> = stores
            .iter()
            .flat_map(|s| s.deltas_between(since, upto))
            .collect();
        deltas.sort_by_key(|(k, _)| *k);
        deltas
    }

    /// Whether a flushed delta file holds this delta
    pub fn durable_contains(&self, key: &DeltaKey) -> bool {
        self.stores.read().files.iter().any(|f| f.contains(key))
    }

    /// Ids of the durable delta files
    pub fn file_ids(&self) -> Vec<u64> {
        self.stores.read().files.iter().map(|f| f.id()).collect()
    }

    /// Largest timestamp held in durable delta files
    pub fn max_durable_ts(&self) -> Option<Timestamp> {
        self.stores
            .read()
            .files
            .iter()
            .filter(|f| !f.is_empty())
            .map(|f| f.max_ts())
            .max()
    }

    pub fn dms_size(&self) -> usize {
        self.stores.read().dms.size()
    }

    /// Write the memstore to a new delta file
    ///
    /// Returns the new file id, or `None` if the memstore was empty. The
    /// caller records the id in row set metadata.
    pub fn flush_dms(&self) -> Result<Option<u64>> {
        let flushing = {
            let mut stores = self.stores.write();
            if stores.dms.is_empty() {
                return Ok(None);
            }
            let old = std::mem::replace(&mut stores.dms, Arc::new(DeltaMemStore::new()));
            stores.flushing = Some(old.clone());
            old
        };

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = Self::file_path(&self.dir, id);
        match DeltaFile::write(&path, id, flushing.entries()) {
            Ok(file) => {
                let mut stores = self.stores.write();
                stores.files.push(Arc::new(file));
                stores.flushing = None;
                debug!("Flushed {} deltas to {:?}", flushing.len(), path);
                Ok(Some(id))
            }
            Err(e) => {
                // Reinstate the old memstore with anything newer folded on top
                let mut stores = self.stores.write();
                let newer = std::mem::replace(&mut stores.dms, flushing);
                for (key, change) in newer.entries() {
                    stores.dms.update(key.row_idx, key.ts, change);
                }
                stores.flushing = None;
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Merge all delta files into one
    ///
    /// Returns the new file id and the files it replaced. The replaced files
    /// stay on disk until the caller has persisted the new file list and
    /// deletes them.
    pub fn compact_files(&self) -> Result<Option<(u64, Vec<Arc<DeltaFile>>)>> {
        let inputs = {
            let stores = self.stores.read();
            if stores.files.len() < 2 {
                return Ok(None);
            }
            stores.files.clone()
        };

        // Files are in flush order, so a key seen again is the later change
        let mut merged: BTreeMap<DeltaKey, RowChange> = BTreeMap::new();
        for (key, change) in inputs.iter().flat_map(|f| f.entries()) {
            let folded = match merged.remove(key) {
                Some(earlier) => earlier.followed_by(change.clone()),
                None => change.clone(),
            };
            merged.insert(*key, folded);
        }

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = Self::file_path(&self.dir, id);
        let file = DeltaFile::write(&path, id, merged.into_iter().collect())?;

        let mut stores = self.stores.write();
        let input_ids: Vec<u64> = inputs.iter().map(|f| f.id()).collect();
        stores.files.retain(|f| !input_ids.contains(&f.id()));
        stores.files.insert(0, Arc::new(file));
        debug!("Compacted delta files {:?} into {}", input_ids, id);
        Ok(Some((id, inputs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use tempfile::TempDir;

    fn base() -> Row {
        let mut r = Row::new();
        r.set(0, Value::UInt32(1));
        r.set(1, Value::UInt32(10));
        r
    }

    #[test]
    fn test_merge_across_stores() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = DeltaTracker::open(temp_dir.path(), &[]).unwrap();

        tracker.update(0, RowChange::Update(vec![(1, Value::UInt32(11))]), Timestamp::new(2));
        assert_eq!(tracker.flush_dms().unwrap(), Some(0));
        tracker.update(0, RowChange::Update(vec![(1, Value::UInt32(12))]), Timestamp::new(5));

        let latest = tracker.row_state(0, base(), &MvccSnapshot::all()).unwrap();
        assert_eq!(latest.get(1), Some(&Value::UInt32(12)));

        let earlier = tracker
            .row_state(0, base(), &MvccSnapshot::committed_before(Timestamp::new(5)))
            .unwrap();
        assert_eq!(earlier.get(1), Some(&Value::UInt32(11)));

        assert!(tracker.durable_contains(&DeltaKey::new(0, Timestamp::new(2))));
        assert!(!tracker.durable_contains(&DeltaKey::new(0, Timestamp::new(5))));
    }

    #[test]
    fn test_reopen_and_compact_files() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = DeltaTracker::open(temp_dir.path(), &[]).unwrap();
        tracker.update(0, RowChange::Delete, Timestamp::new(3));
        tracker.flush_dms().unwrap();
        tracker.update(1, RowChange::Delete, Timestamp::new(4));
        tracker.flush_dms().unwrap();
        assert_eq!(tracker.file_ids(), vec![0, 1]);
        assert_eq!(tracker.flush_dms().unwrap(), None);

        let (new_id, replaced) = tracker.compact_files().unwrap().unwrap();
        assert_eq!(new_id, 2);
        for f in replaced {
            f.delete().unwrap();
        }

        let reopened = DeltaTracker::open(temp_dir.path(), &tracker.file_ids()).unwrap();
        assert!(reopened.is_deleted(0));
        assert!(reopened.is_deleted(1));
        assert_eq!(reopened.max_durable_ts(), Some(Timestamp::new(4)));
    }

    #[test]
    fn test_deltas_between() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = DeltaTracker::open(temp_dir.path(), &[]).unwrap();
        tracker.update(0, RowChange::Delete, Timestamp::new(3));
        tracker.update(1, RowChange::Delete, Timestamp::new(7));

        let s1 = MvccSnapshot::committed_before(Timestamp::new(5));
        let s2 = MvccSnapshot::committed_before(Timestamp::new(10));
        let missed = tracker.deltas_between(&s1, &s2);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].0, DeltaKey::new(1, Timestamp::new(7)));
    }
}
