//! A tablet: one horizontal partition of a table
//!
//! Recent inserts live in the MemRowSet; older rows in DiskRowSets whose
//! deltas absorb later updates and deletes. Writes are logged before they
//! are applied and become visible when their MVCC transaction commits.
//!
//! Lock order: row locks, then the component lock, then the superblock.
//! Writers hold the component lock shared from before logging until commit;
//! scans only take it long enough to clone the current components.

mod bootstrap;
mod consensus;
mod iterator;
mod metadata;

pub use bootstrap::{ReplayStats, TabletBootstrap};
pub use consensus::{LocalConsensus, PeerRole, QuorumConfig, QuorumPeer};
pub use iterator::{ColumnRangePredicate, TabletIterator};
pub use metadata::{TabletMetadata, METADATA_FILE};

use crate::compaction::{self, CompactionPolicy, LifecycleHooks, NoopHooks};
use crate::diskrowset::{DiskRowSet, DiskRowSetConfig};
use crate::encoding::EncodedKey;
use crate::lock_manager::LockManager;
use crate::memrowset::MemRowSet;
use crate::mvcc::{LogicalClock, MvccManager, MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::rowset::{MergeIterator, RowSet, RowSetId, RowSetKind};
use crate::schema::Schema;
use crate::types::Value;
use crate::wal::{RowOperation, WalConfig, WalEntry, WalWriter};
use crate::{Result, TabletError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const ROWSETS_DIR: &str = "rowsets";
pub(crate) const WAL_DIR: &str = "wal";
pub(crate) const WAL_RECOVERY_DIR: &str = "wal-recovery";

/// Tablet tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletConfig {
    /// Log settings; the directory is always `<tablet dir>/wal`
    pub wal: WalConfig,
    pub diskrowset: DiskRowSetConfig,
    /// MemRowSet size that triggers a flush
    pub flush_threshold_bytes: usize,
    /// DeltaMemStore size that triggers a delta flush
    pub dms_flush_threshold_bytes: usize,
    /// DiskRowSet count that triggers a budgeted compaction
    pub compaction_trigger: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            diskrowset: DiskRowSetConfig::default(),
            flush_threshold_bytes: crate::config::MEMROWSET_FLUSH_THRESHOLD,
            dms_flush_threshold_bytes: crate::config::DMS_FLUSH_THRESHOLD,
            compaction_trigger: crate::config::COMPACTION_TRIGGER,
        }
    }
}

/// The row sets of a tablet at one point in time
///
/// Replaced wholesale under the component write lock; readers clone the
/// `Arc` and work on their copy.
pub struct TabletComponents {
    pub memrowset: Arc<MemRowSet>,
    /// Everything but the active MemRowSet
    pub rowsets: Vec<Arc<dyn RowSet>>,
}

impl TabletComponents {
    /// Active MemRowSet first, then the other row sets
    pub fn all_rowsets(&self) -> Vec<Arc<dyn RowSet>> {
        let mut all: Vec<Arc<dyn RowSet>> = Vec::with_capacity(self.rowsets.len() + 1);
        all.push(self.memrowset.clone());
        all.extend(self.rowsets.iter().cloned());
        all
    }

    /// The row set holding the live row for `key`
    pub fn find_live(&self, key: &EncodedKey) -> Result<Option<Arc<dyn RowSet>>> {
        if self.memrowset.check_row_present(key) {
            return Ok(Some(self.memrowset.clone()));
        }
        for rowset in &self.rowsets {
            if rowset.check_row_present(key)? {
                return Ok(Some(rowset.clone()));
            }
        }
        Ok(None)
    }

    fn with_rowsets(&self, rowsets: Vec<Arc<dyn RowSet>>) -> Self {
        Self {
            memrowset: self.memrowset.clone(),
            rowsets,
        }
    }
}

/// Outcome of a write batch
#[derive(Debug, Default)]
pub struct WriteResult {
    /// Set when at least one operation was applied
    pub timestamp: Option<Timestamp>,
    /// Operations that were rejected, by position in the batch
    pub failed_ops: Vec<(usize, TabletError)>,
}

impl WriteResult {
    pub fn is_fully_applied(&self) -> bool {
        self.failed_ops.is_empty()
    }
}

/// Work done by one [`Tablet::run_maintenance`] pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub flushed_memrowset: bool,
    pub flushed_dms: bool,
    pub compacted: bool,
}

impl MaintenanceReport {
    pub fn did_work(&self) -> bool {
        self.flushed_memrowset || self.flushed_dms || self.compacted
    }
}

/// Size counters of a tablet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabletStats {
    pub memrowset_entries: usize,
    pub memrowset_bytes: usize,
    pub num_rowsets: usize,
    pub on_disk_bytes: u64,
    pub dms_bytes: usize,
    pub schema_version: u32,
}

pub struct Tablet {
    tablet_id: String,
    table_name: String,
    dir: PathBuf,
    config: TabletConfig,
    pub(crate) schema: RwLock<Arc<Schema>>,
    pub(crate) components: RwLock<Arc<TabletComponents>>,
    pub(crate) mvcc: MvccManager,
    lock_manager: LockManager,
    wal: WalWriter,
    metadata: Mutex<TabletMetadata>,
    next_rowset_id: AtomicU64,
    /// Serializes flushes, compactions and delta maintenance
    pub(crate) compaction_lock: Mutex<()>,
    consensus: LocalConsensus,
}

impl Tablet {
    /// Create the on-disk layout of a new tablet and open it
    pub fn create(
        dir: &Path,
        tablet_id: &str,
        table_name: &str,
        schema: Schema,
        quorum: QuorumConfig,
        config: TabletConfig,
    ) -> Result<Arc<Tablet>> {
        if TabletMetadata::exists(dir) {
            return Err(TabletError::TabletAlreadyExists(tablet_id.to_string()));
        }
        std::fs::create_dir_all(dir.join(ROWSETS_DIR))?;

        let schema = if schema.has_column_ids() { schema } else { schema.assign_ids()? };
        let metadata = TabletMetadata::new(tablet_id, table_name, schema, quorum);
        metadata.save(dir)?;
        info!("Created tablet {} ({}) in {:?}", tablet_id, table_name, dir);

        TabletBootstrap::new(dir, config).bootstrap()
    }

    /// Open an existing tablet, replaying its log
    pub fn open(dir: &Path, config: TabletConfig) -> Result<Arc<Tablet>> {
        TabletBootstrap::new(dir, config).bootstrap()
    }

    /// Assemble a tablet from durable state; used by bootstrap before replay
    pub(crate) fn from_parts(
        dir: &Path,
        config: TabletConfig,
        metadata: TabletMetadata,
        disk_rowsets: Vec<Arc<DiskRowSet>>,
        wal: WalWriter,
    ) -> Self {
        let next_id = metadata.next_rowset_id;
        let memrowset = Arc::new(MemRowSet::new(next_id));
        let rowsets: Vec<Arc<dyn RowSet>> = disk_rowsets.into_iter().map(|d| d as Arc<dyn RowSet>).collect();

        Self {
            tablet_id: metadata.tablet_id.clone(),
            table_name: metadata.table_name.clone(),
            dir: dir.to_path_buf(),
            config,
            schema: RwLock::new(Arc::new(metadata.schema.clone())),
            components: RwLock::new(Arc::new(TabletComponents { memrowset, rowsets })),
            mvcc: MvccManager::new(Arc::new(LogicalClock::new())),
            lock_manager: LockManager::new(),
            wal,
            consensus: LocalConsensus::new(metadata.quorum.clone()),
            metadata: Mutex::new(metadata),
            next_rowset_id: AtomicU64::new(next_id + 1),
            compaction_lock: Mutex::new(()),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().clone()
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    pub fn consensus(&self) -> &LocalConsensus {
        &self.consensus
    }

    /// Encode key column values under the current schema
    pub fn encode_key(&self, key_values: &[Value]) -> Result<EncodedKey> {
        let refs: Vec<&Value> = key_values.iter().collect();
        EncodedKey::encode(&self.schema(), &refs)
    }

    /// Current row sets
    ///
    /// Readers never queue behind a flush waiting for the exclusive lock.
    pub fn components(&self) -> Arc<TabletComponents> {
        self.components.read_recursive().clone()
    }

    pub(crate) fn rowsets_dir(&self) -> PathBuf {
        self.dir.join(ROWSETS_DIR)
    }

    pub(crate) fn allocate_rowset_id(&self) -> RowSetId {
        self.next_rowset_id.fetch_add(1, Ordering::SeqCst)
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Insert one row
    pub fn insert(&self, row: Row) -> Result<Timestamp> {
        Self::single(self.write(vec![RowOperation::Insert { row }])?)
    }

    /// Mutate the live row with `key`
    pub fn mutate(&self, key: EncodedKey, change: RowChange) -> Result<Timestamp> {
        Self::single(self.write(vec![RowOperation::Mutate { key, change }])?)
    }

    fn single(mut result: WriteResult) -> Result<Timestamp> {
        if let Some((_, err)) = result.failed_ops.pop() {
            return Err(err);
        }
        result
            .timestamp
            .ok_or_else(|| TabletError::Internal("write applied nothing".into()))
    }

    /// Apply a batch of row operations in one transaction
    ///
    /// Each operation is checked on its own; rejected operations are
    /// reported and never logged, the rest are logged and applied together.
    /// Consecutive mutations of one row are folded into a single change, so
    /// a row takes at most one delta per transaction. A log failure fails the
    /// whole batch.
    pub fn write(&self, ops: Vec<RowOperation>) -> Result<WriteResult> {
        let schema = self.schema();
        let mut result = WriteResult::default();

        let mut keyed = Vec::with_capacity(ops.len());
        for (idx, op) in ops.into_iter().enumerate() {
            match Self::op_key(&schema, &op) {
                Ok(key) => keyed.push((idx, key, op)),
                Err(e) => result.failed_ops.push((idx, e)),
            }
        }

        let _locks = self.lock_manager.lock_rows(keyed.iter().map(|(_, key, _)| key.clone()));
        let components = self.components.read();

        // Liveness of keys touched earlier in this batch
        let mut overlay: HashMap<EncodedKey, bool> = HashMap::new();
        let mut accepted = Vec::with_capacity(keyed.len());
        for (idx, key, op) in keyed {
            let present = match overlay.get(&key) {
                Some(present) => *present,
                None => components.find_live(&key)?.is_some(),
            };
            let verdict = match &op {
                RowOperation::Insert { .. } if present => {
                    Err(TabletError::AlreadyPresent("key already present".into()))
                }
                RowOperation::Insert { .. } => Ok(true),
                RowOperation::Mutate { change, .. } if change.is_reinsert() => Err(
                    TabletError::InvalidMutation("User may not specify REINSERT".into()),
                ),
                RowOperation::Mutate { .. } if !present => Err(TabletError::NotFound("key not found".into())),
                RowOperation::Mutate { change, .. } => Ok(!change.is_delete()),
            };
            match verdict {
                Ok(live_after) => {
                    overlay.insert(key.clone(), live_after);
                    accepted.push((idx, key, op));
                }
                Err(e) => result.failed_ops.push((idx, e)),
            }
        }
        result.failed_ops.sort_by_key(|(idx, _)| *idx);

        if accepted.is_empty() {
            return Ok(result);
        }
        let accepted = Self::coalesce(accepted);

        let ts = self.mvcc.start_transaction();
        let logged: Vec<RowOperation> = accepted.iter().map(|(_, _, op)| op.clone()).collect();
        if let Err(e) = self.wal.append(&WalEntry::write(ts, schema.version(), logged)) {
            self.mvcc.abort_transaction(ts);
            return Err(e);
        }

        for (idx, key, op) in accepted {
            if let Err(e) = Self::apply_op(&components, key, op, ts) {
                warn!("Tablet {}: logged operation failed to apply: {}", self.tablet_id, e);
                result.failed_ops.push((idx, e));
            }
        }
        self.mvcc.commit_transaction(ts);
        result.timestamp = Some(ts);
        Ok(result)
    }

    /// Fold each run of mutations to one key into its first mutation
    ///
    /// An insert of the key ends the run. The tag of a folded run is the tag
    /// of its first operation.
    fn coalesce<T>(ops: Vec<(T, EncodedKey, RowOperation)>) -> Vec<(T, EncodedKey, RowOperation)> {
        let mut folded: Vec<(T, EncodedKey, RowOperation)> = Vec::with_capacity(ops.len());
        let mut open_runs: HashMap<EncodedKey, usize> = HashMap::new();
        for (tag, key, op) in ops {
            match op {
                RowOperation::Mutate { key: target, change } => {
                    if let Some(&pos) = open_runs.get(&key) {
                        if let RowOperation::Mutate { change: earlier, .. } = &mut folded[pos].2 {
                            let first = std::mem::replace(earlier, RowChange::Delete);
                            *earlier = first.followed_by(change);
                            continue;
                        }
                    }
                    open_runs.insert(key.clone(), folded.len());
                    folded.push((tag, key, RowOperation::Mutate { key: target, change }));
                }
                RowOperation::Insert { row } => {
                    open_runs.remove(&key);
                    folded.push((tag, key, RowOperation::Insert { row }));
                }
            }
        }
        folded
    }

    fn op_key(schema: &Schema, op: &RowOperation) -> Result<EncodedKey> {
        match op {
            RowOperation::Insert { row } => row.encoded_key(schema),
            RowOperation::Mutate { key, .. } => Ok(key.clone()),
        }
    }

    fn apply_op(components: &TabletComponents, key: EncodedKey, op: RowOperation, ts: Timestamp) -> Result<()> {
        match op {
            RowOperation::Insert { row } => components.memrowset.insert(key, row, ts),
            RowOperation::Mutate { key, change } => match components.find_live(&key)? {
                Some(rowset) => rowset.mutate_row(&key, &change, ts),
                None => Err(TabletError::NotFound("key not found".into())),
            },
        }
    }

    // ---------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------

    pub(crate) fn is_insert_durable(&self, ts: Timestamp) -> bool {
        self.metadata.lock().flushed_snapshot.is_committed(ts)
    }

    /// Whether a logged mutation survives in flushed state
    ///
    /// Without a live target row the incarnation it touched was compacted
    /// away, so its effect is already reflected on disk.
    pub(crate) fn is_mutation_durable(&self, key: &EncodedKey, ts: Timestamp) -> Result<bool> {
        match self.components().find_live(key)? {
            Some(rowset) => rowset.is_mutation_durable(key, ts),
            None => Ok(true),
        }
    }

    /// Apply logged operations at their original timestamp and log them again
    pub(crate) fn replay_write(&self, ts: Timestamp, schema_version: u32, ops: Vec<RowOperation>) -> Result<()> {
        let schema = self.schema();
        let keys = ops
            .iter()
            .map(|op| Self::op_key(&schema, op))
            .collect::<Result<Vec<_>>>()?;

        let _locks = self.lock_manager.lock_rows(keys.iter().cloned());
        let ops = Self::coalesce(
            keys.into_iter()
                .zip(ops)
                .map(|(key, op)| ((), key, op))
                .collect(),
        );
        let logged: Vec<RowOperation> = ops.iter().map(|(_, _, op)| op.clone()).collect();

        let components = self.components.read();
        self.mvcc.start_transaction_at(ts);
        self.wal.append(&WalEntry::write(ts, schema_version, logged))?;
        for ((), key, op) in ops {
            Self::apply_op(&components, key, op, ts).map_err(|e| {
                TabletError::WalRecovery(format!("failed to replay operation at {}: {}", ts, e))
            })?;
        }
        self.mvcc.commit_transaction(ts);
        Ok(())
    }

    pub(crate) fn replay_alter(&self, ts: Timestamp, schema: Schema) -> Result<()> {
        let _components = self.components.write();
        self.mvcc.start_transaction_at(ts);
        self.wal.append(&WalEntry::alter_schema(ts, schema.clone()))?;
        self.install_schema(schema)?;
        self.mvcc.commit_transaction(ts);
        Ok(())
    }

    pub(crate) fn sync_wal(&self) -> Result<()> {
        self.wal.sync()
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Scan the latest committed state
    pub fn new_row_iterator(
        &self,
        projection: &Schema,
        predicates: &[ColumnRangePredicate],
    ) -> Result<TabletIterator> {
        let (components, snapshot) = {
            let guard = self.components.read_recursive();
            (guard.clone(), self.mvcc.snapshot_at_latest())
        };
        self.iterator_at(components, snapshot, projection, predicates)
    }

    /// Scan as of `snapshot`
    pub fn new_row_iterator_at(
        &self,
        snapshot: MvccSnapshot,
        projection: &Schema,
        predicates: &[ColumnRangePredicate],
    ) -> Result<TabletIterator> {
        self.iterator_at(self.components(), snapshot, projection, predicates)
    }

    fn iterator_at(
        &self,
        components: Arc<TabletComponents>,
        snapshot: MvccSnapshot,
        projection: &Schema,
        predicates: &[ColumnRangePredicate],
    ) -> Result<TabletIterator> {
        let schema = self.schema();
        let projection = schema.resolve_projection(projection)?;
        let iters = components
            .all_rowsets()
            .into_iter()
            .map(|rowset| rowset.new_row_iterator(snapshot.clone()))
            .collect();
        TabletIterator::new(Box::new(MergeIterator::new(iters)), schema, projection, predicates)
    }

    /// Number of live rows at the latest snapshot
    pub fn count_rows(&self) -> Result<usize> {
        let schema = self.schema();
        let mut count = 0;
        for row in self.new_row_iterator(&schema.key_projection().without_ids(), &[])? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    pub fn num_rowsets(&self) -> usize {
        self.components.read_recursive().rowsets.len()
    }

    pub fn memrowset_size(&self) -> usize {
        self.components.read_recursive().memrowset.size()
    }

    pub fn stats(&self) -> TabletStats {
        let components = self.components();
        TabletStats {
            memrowset_entries: components.memrowset.entry_count(),
            memrowset_bytes: components.memrowset.size(),
            num_rowsets: components.rowsets.len(),
            on_disk_bytes: components.rowsets.iter().map(|r| r.on_disk_size()).sum(),
            dms_bytes: components.rowsets.iter().map(|r| r.memory_footprint()).sum(),
            schema_version: self.schema().version(),
        }
    }

    // ---------------------------------------------------------------
    // Flush and compaction
    // ---------------------------------------------------------------

    /// Write the MemRowSet out as a new DiskRowSet
    pub fn flush(&self) -> Result<()> {
        self.flush_with_hooks(&NoopHooks)
    }

    pub fn flush_with_hooks(&self, hooks: &dyn LifecycleHooks) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        compaction::flush(self, hooks)
    }

    /// Merge DiskRowSets chosen by `policy` into one
    pub fn compact(&self, policy: CompactionPolicy) -> Result<()> {
        self.compact_with_hooks(policy, &NoopHooks)
    }

    pub fn compact_with_hooks(&self, policy: CompactionPolicy, hooks: &dyn LifecycleHooks) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        compaction::compact(self, policy, hooks)
    }

    /// Flush the largest DeltaMemStore; returns whether anything was written
    pub fn flush_biggest_dms(&self) -> Result<bool> {
        let _guard = self.compaction_lock.lock();
        let biggest = self
            .disk_rowsets()
            .into_iter()
            .filter(|d| d.dms_size() > 0)
            .max_by_key(|d| d.dms_size());
        match biggest {
            Some(drs) => {
                let flushed = drs.flush_deltas()?;
                if flushed {
                    self.persist_metadata(None)?;
                    debug!("Tablet {}: flushed deltas of DiskRowSet {}", self.tablet_id, drs.id());
                }
                Ok(flushed)
            }
            None => Ok(false),
        }
    }

    /// Flush every DeltaMemStore
    pub fn flush_all_dms(&self) -> Result<usize> {
        let _guard = self.compaction_lock.lock();
        let mut flushed = 0;
        for drs in self.disk_rowsets() {
            if drs.flush_deltas()? {
                flushed += 1;
            }
        }
        if flushed > 0 {
            self.persist_metadata(None)?;
            debug!("Tablet {}: flushed {} DeltaMemStores", self.tablet_id, flushed);
        }
        Ok(flushed)
    }

    /// Merge the delta files of each DiskRowSet; returns how many were merged
    pub fn minor_compact_deltas(&self) -> Result<usize> {
        let _guard = self.compaction_lock.lock();
        let mut replaced = Vec::new();
        let mut compacted = 0;
        for drs in self.disk_rowsets() {
            let files = drs.minor_compact_deltas()?;
            if !files.is_empty() {
                compacted += 1;
                replaced.extend(files);
            }
        }
        if compacted > 0 {
            self.persist_metadata(None)?;
            for file in replaced {
                file.delete()?;
            }
            info!("Tablet {}: merged delta files of {} DiskRowSets", self.tablet_id, compacted);
        }
        Ok(compacted)
    }

    pub(crate) fn disk_rowsets(&self) -> Vec<Arc<DiskRowSet>> {
        self.components()
            .rowsets
            .iter()
            .filter_map(|r| r.clone().as_disk_rowset())
            .collect()
    }

    /// Replace the row sets with ids in `remove` by `add`, keeping list order
    pub(crate) fn replace_rowsets(&self, remove: &[RowSetId], add: Vec<Arc<dyn RowSet>>) {
        let mut components = self.components.write();
        let new = Self::replaced(&components, remove, add);
        *components = Arc::new(new);
    }

    pub(crate) fn replaced(
        components: &TabletComponents,
        remove: &[RowSetId],
        add: Vec<Arc<dyn RowSet>>,
    ) -> TabletComponents {
        let mut rowsets: Vec<Arc<dyn RowSet>> = components
            .rowsets
            .iter()
            .filter(|r| !remove.contains(&r.id()))
            .cloned()
            .collect();
        rowsets.extend(add);
        components.with_rowsets(rowsets)
    }

    /// Write the superblock from the current components
    ///
    /// `flushed` replaces the flushed snapshot after a MemRowSet flush.
    pub(crate) fn persist_metadata(&self, flushed: Option<&MvccSnapshot>) -> Result<()> {
        let components = self.components();
        let rowsets = components
            .rowsets
            .iter()
            .filter(|r| r.kind() == RowSetKind::Disk)
            .filter_map(|r| r.clone().as_disk_rowset())
            .map(|d| d.metadata())
            .collect();

        let mut metadata = self.metadata.lock();
        let mut updated = metadata.clone();
        updated.rowsets = rowsets;
        updated.next_rowset_id = self.next_rowset_id.load(Ordering::SeqCst);
        if let Some(snapshot) = flushed {
            updated.flushed_snapshot = snapshot.clone();
        }
        updated.save(&self.dir)?;
        *metadata = updated;
        Ok(())
    }

    pub fn metadata(&self) -> TabletMetadata {
        self.metadata.lock().clone()
    }

    // ---------------------------------------------------------------
    // Schema and config
    // ---------------------------------------------------------------

    /// Replace the schema with `new_schema`, whose version must be the next one
    pub fn alter_schema(&self, new_schema: Schema) -> Result<()> {
        // Exclusive: no write may straddle the schema change
        let _components = self.components.write();
        let current = self.schema();
        if new_schema.version() != current.version() + 1 {
            return Err(TabletError::InvalidSchema(format!(
                "Expected schema version {}, got {}",
                current.version() + 1,
                new_schema.version()
            )));
        }

        let ts = self.mvcc.start_transaction();
        if let Err(e) = self.wal.append(&WalEntry::alter_schema(ts, new_schema.clone())) {
            self.mvcc.abort_transaction(ts);
            return Err(e);
        }
        let installed = self.install_schema(new_schema);
        self.mvcc.commit_transaction(ts);
        installed?;
        info!(
            "Tablet {}: altered schema to version {}",
            self.tablet_id,
            current.version() + 1
        );
        Ok(())
    }

    fn install_schema(&self, schema: Schema) -> Result<()> {
        *self.schema.write() = Arc::new(schema.clone());
        let mut metadata = self.metadata.lock();
        let mut updated = metadata.clone();
        updated.schema = schema;
        updated.save(&self.dir)?;
        *metadata = updated;
        Ok(())
    }

    /// Record a new start in the quorum config and persist it
    pub(crate) fn start_consensus(&self) -> Result<QuorumConfig> {
        let config = self.consensus.start();
        self.persist_quorum(config.clone())?;
        Ok(config)
    }

    pub fn change_config(&self, new_config: QuorumConfig) -> Result<QuorumConfig> {
        let config = self.consensus.change_config(new_config)?;
        self.persist_quorum(config.clone())?;
        Ok(config)
    }

    fn persist_quorum(&self, quorum: QuorumConfig) -> Result<()> {
        let mut metadata = self.metadata.lock();
        let mut updated = metadata.clone();
        updated.quorum = quorum;
        updated.save(&self.dir)?;
        *metadata = updated;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    /// Run whatever flush or compaction the thresholds call for
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if self.memrowset_size() >= self.config.flush_threshold_bytes {
            self.flush()?;
            report.flushed_memrowset = true;
        }
        let biggest_dms = self.disk_rowsets().iter().map(|d| d.dms_size()).max().unwrap_or(0);
        if biggest_dms >= self.config.dms_flush_threshold_bytes {
            report.flushed_dms = self.flush_biggest_dms()?;
        }
        if self.num_rowsets() >= self.config.compaction_trigger {
            self.compact(CompactionPolicy::Budgeted)?;
            report.compacted = true;
        }
        Ok(report)
    }
}
