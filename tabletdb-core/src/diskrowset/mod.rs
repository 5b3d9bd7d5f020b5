//! On-disk row sets
//!
//! A DiskRowSet is a directory holding immutable, key-sorted base data
//! (`base.drs`) written as of an MVCC snapshot, plus the delta files that
//! record later updates and deletes of its rows. Row sets retired by a flush
//! or compaction are marked obsolete; their directory is removed once the
//! last reader lets go.

mod block;
mod bloom;
mod reader;
mod writer;

pub use block::{ColumnBlock, ColumnBlockBuilder};
pub use bloom::KeyBloomFilter;
pub use reader::BaseDataReader;
pub use writer::BaseDataWriter;

use crate::delta::{DeltaFile, DeltaKey, DeltaTracker};
use crate::encoding::EncodedKey;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::rowset::{MissedMutation, RowIterator, RowSet, RowSetId, RowSetKind};
use crate::schema::Schema;
use crate::{Result, TabletError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) const MAGIC: &[u8; 4] = b"TDRS";
pub(crate) const FORMAT_VERSION: u32 = 1;
pub(crate) const FOOTER_SIZE: usize = 52;

const BASE_FILE: &str = "base.drs";

/// DiskRowSet write options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRowSetConfig {
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
    /// LZ4 compress column blocks
    pub compression: bool,
}

impl Default for DiskRowSetConfig {
    fn default() -> Self {
        Self {
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            compression: true,
        }
    }
}

/// Persistent description of a DiskRowSet, kept in the tablet superblock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSetMetadata {
    pub id: RowSetId,
    /// Snapshot the base data reflects
    pub base_snapshot: MvccSnapshot,
    /// Durable delta files, oldest first
    pub delta_ids: Vec<u64>,
}

/// Immutable base data plus deltas
pub struct DiskRowSet {
    id: RowSetId,
    dir: PathBuf,
    base_snapshot: MvccSnapshot,
    base: BaseDataReader,
    deltas: DeltaTracker,
    obsolete: AtomicBool,
}

impl DiskRowSet {
    /// Directory of row set `id` under the tablet's row set root
    pub fn dir_for(rowsets_dir: &Path, id: RowSetId) -> PathBuf {
        rowsets_dir.join(format!("rs_{}", id))
    }

    /// Open a row set described by the superblock
    pub fn open(rowsets_dir: &Path, meta: &RowSetMetadata) -> Result<Self> {
        let dir = Self::dir_for(rowsets_dir, meta.id);
        let base = BaseDataReader::open(&dir.join(BASE_FILE))?;
        let deltas = DeltaTracker::open(&dir, &meta.delta_ids)?;
        debug!(
            "Opened DiskRowSet {} with {} rows and {} delta files",
            meta.id,
            base.row_count(),
            meta.delta_ids.len()
        );

        Ok(Self {
            id: meta.id,
            dir,
            base_snapshot: meta.base_snapshot.clone(),
            base,
            deltas,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Write a new row set from key-ordered rows
    ///
    /// On failure the partially written directory is removed.
    pub fn write<I>(
        rowsets_dir: &Path,
        id: RowSetId,
        schema: &Schema,
        config: &DiskRowSetConfig,
        base_snapshot: MvccSnapshot,
        rows: I,
    ) -> Result<Self>
    where
        I: Iterator<Item = Result<(EncodedKey, Row)>>,
    {
        let dir = Self::dir_for(rowsets_dir, id);
        match Self::write_base(&dir, schema, config, rows) {
            Ok(()) => {}
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!("Failed to remove partial row set {:?}: {}", dir, cleanup);
                }
                return Err(e);
            }
        }
        Self::open(
            rowsets_dir,
            &RowSetMetadata {
                id,
                base_snapshot,
                delta_ids: Vec::new(),
            },
        )
    }

    fn write_base<I>(dir: &Path, schema: &Schema, config: &DiskRowSetConfig, rows: I) -> Result<()>
    where
        I: Iterator<Item = Result<(EncodedKey, Row)>>,
    {
        if dir.exists() {
            // Leftover of an earlier attempt that never made it into the superblock
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;

        let mut writer = BaseDataWriter::new(&dir.join(BASE_FILE), schema, config);
        for item in rows {
            let (key, row) = item?;
            writer.append(key, &row)?;
        }
        let rows = writer.row_count();
        let size = writer.finish()?;
        fs::File::open(dir)?.sync_all()?;
        debug!("Wrote {} rows ({} bytes) to {:?}", rows, size, dir);
        Ok(())
    }

    pub fn metadata(&self) -> RowSetMetadata {
        RowSetMetadata {
            id: self.id,
            base_snapshot: self.base_snapshot.clone(),
            delta_ids: self.deltas.file_ids(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_snapshot(&self) -> &MvccSnapshot {
        &self.base_snapshot
    }

    pub fn row_count(&self) -> usize {
        self.base.row_count()
    }

    pub fn delta_tracker(&self) -> &DeltaTracker {
        &self.deltas
    }

    /// Row index of `key` in the base data
    pub fn row_index_of(&self, key: &EncodedKey) -> Option<u32> {
        self.base.find_row(key)
    }

    /// Record a mutation by key without liveness checks
    ///
    /// Used to carry mutations over from the inputs of a flush or
    /// compaction into this row set.
    pub fn apply_to_dms_by_key(&self, key: &EncodedKey, change: RowChange, ts: Timestamp) -> Result<()> {
        let row_idx = self.row_index_of(key).ok_or_else(|| {
            TabletError::Internal(format!(
                "mutation for {:?} has no row in DiskRowSet {}",
                key, self.id
            ))
        })?;
        self.deltas.update(row_idx, change, ts);
        Ok(())
    }

    /// Flush the delta memstore; true if a file was written
    pub fn flush_deltas(&self) -> Result<bool> {
        Ok(self.deltas.flush_dms()?.is_some())
    }

    /// Merge all delta files into one
    ///
    /// Returns the replaced files. They remain on disk until the caller has
    /// persisted the new metadata and deletes them.
    pub fn minor_compact_deltas(&self) -> Result<Vec<Arc<DeltaFile>>> {
        Ok(self
            .deltas
            .compact_files()?
            .map(|(_, replaced)| replaced)
            .unwrap_or_default())
    }

    pub fn dms_size(&self) -> usize {
        self.deltas.dms_size()
    }

    /// Largest timestamp this row set holds durably
    pub fn max_durable_ts(&self) -> Option<Timestamp> {
        self.base_snapshot.max_committed().max(self.deltas.max_durable_ts())
    }

    /// Remove the directory once the last reference is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    fn row_state(&self, row_idx: u32, snapshot: &MvccSnapshot) -> Result<Option<Row>> {
        let base = self.base.row(row_idx)?;
        Ok(self.deltas.row_state(row_idx, base, snapshot))
    }
}

impl Drop for DiskRowSet {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => debug!("Removed obsolete DiskRowSet {:?}", self.dir),
                Err(e) => warn!("Failed to remove obsolete DiskRowSet {:?}: {}", self.dir, e),
            }
        }
    }
}

impl RowSet for DiskRowSet {
    fn id(&self) -> RowSetId {
        self.id
    }

    fn kind(&self) -> RowSetKind {
        RowSetKind::Disk
    }

    fn check_row_present(&self, key: &EncodedKey) -> Result<bool> {
        Ok(match self.row_index_of(key) {
            Some(row_idx) => !self.deltas.is_deleted(row_idx),
            None => false,
        })
    }

    fn mutate_row(&self, key: &EncodedKey, change: &RowChange, ts: Timestamp) -> Result<()> {
        let row_idx = self
            .row_index_of(key)
            .ok_or_else(|| TabletError::NotFound("key not found".into()))?;
        if self.deltas.is_deleted(row_idx) {
            return Err(TabletError::NotFound("key not found (deleted)".into()));
        }
        self.deltas.update(row_idx, change.clone(), ts);
        Ok(())
    }

    fn new_row_iterator(self: Arc<Self>, snapshot: MvccSnapshot) -> RowIterator {
        Box::new(DiskRowSetIterator {
            drs: self,
            snapshot,
            next_idx: 0,
        })
    }

    fn missed_mutations(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Result<Vec<MissedMutation>> {
        self.deltas
            .deltas_between(since, upto)
            .into_iter()
            .map(|(DeltaKey { row_idx, ts }, change)| {
                let key = self.base.key_at(row_idx).cloned().ok_or_else(|| {
                    TabletError::Corruption(format!(
                        "delta for row {} beyond the {} rows of DiskRowSet {}",
                        row_idx,
                        self.base.row_count(),
                        self.id
                    ))
                })?;
                Ok(MissedMutation { key, ts, change })
            })
            .collect()
    }

    fn is_mutation_durable(&self, key: &EncodedKey, ts: Timestamp) -> Result<bool> {
        let row_idx = self
            .row_index_of(key)
            .ok_or_else(|| TabletError::NotFound("key not found".into()))?;
        Ok(self.base_snapshot.is_committed(ts) || self.deltas.durable_contains(&DeltaKey::new(row_idx, ts)))
    }

    fn memory_footprint(&self) -> usize {
        self.deltas.dms_size()
    }

    fn on_disk_size(&self) -> u64 {
        self.base.file_size()
    }

    fn describe(&self) -> String {
        format!("DiskRowSet({}, {} rows)", self.id, self.base.row_count())
    }

    fn as_disk_rowset(self: Arc<Self>) -> Option<Arc<DiskRowSet>> {
        Some(self)
    }
}

struct DiskRowSetIterator {
    drs: Arc<DiskRowSet>,
    snapshot: MvccSnapshot,
    next_idx: u32,
}

impl Iterator for DiskRowSetIterator {
    type Item = Result<(EncodedKey, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        while (self.next_idx as usize) < self.drs.row_count() {
            let row_idx = self.next_idx;
            self.next_idx += 1;
            match self.drs.row_state(row_idx, &self.snapshot) {
                Ok(Some(row)) => {
                    let key = self.drs.base.key_at(row_idx)?.clone();
                    return Some(Ok((key, row)));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
