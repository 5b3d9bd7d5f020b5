//! MemRowSet flushes and DiskRowSet compactions
//!
//! Both follow the same procedure. The inputs are fronted by a
//! [`DuplicatingRowSet`] and snapshot S1 is taken in one exclusive
//! section, so readers and writers never see a gap. The merged state as of
//! S1 is written to a new DiskRowSet. The output is then attached to the
//! duplicating row set, which from that moment copies every mutation onto
//! it, and snapshot S2 is taken. Mutations committed between S1 and S2 are
//! carried over before the output replaces the inputs.
//!
//! Callers hold the tablet's compaction lock.

mod hooks;

pub use hooks::{HookRegistry, LifecycleEvent, LifecycleHooks, NoopHooks};

use crate::diskrowset::DiskRowSet;
use crate::memrowset::MemRowSet;
use crate::mvcc::MvccSnapshot;
use crate::rowset::{DuplicatingRowSet, RowSet, RowSetId, RowSetKind};
use crate::schema::Schema;
use crate::tablet::{Tablet, TabletComponents};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Which DiskRowSets a compaction merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionPolicy {
    /// Every DiskRowSet, if there is at least one
    ForceCompactAll,
    /// Every DiskRowSet once their number reaches the tablet's trigger
    Budgeted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Flush,
    Compaction,
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Flush => "Flush",
            Kind::Compaction => "Compaction",
        }
    }
}

/// State shared by the steps after the inputs were replaced
struct Job<'a> {
    tablet: &'a Tablet,
    hooks: &'a dyn LifecycleHooks,
    kind: Kind,
    dup: Arc<DuplicatingRowSet>,
    snap1: MvccSnapshot,
    schema: Arc<Schema>,
}

/// Flush the MemRowSet, together with any left behind by a failed flush
pub(crate) fn flush(tablet: &Tablet, hooks: &dyn LifecycleHooks) -> Result<()> {
    let start = Instant::now();
    let output_id = tablet.allocate_rowset_id();

    let job = {
        let mut components = tablet.components.write();
        let mut inputs: Vec<Arc<dyn RowSet>> = components
            .rowsets
            .iter()
            .filter(|r| r.kind() == RowSetKind::Memory)
            .cloned()
            .collect();
        if components.memrowset.is_empty() && inputs.is_empty() {
            debug!("Tablet {}: nothing to flush", tablet.tablet_id());
            return Ok(());
        }
        inputs.push(components.memrowset.clone());

        let input_ids: Vec<RowSetId> = inputs.iter().map(|r| r.id()).collect();
        let dup = Arc::new(DuplicatingRowSet::new(output_id, inputs));
        let swapped = Tablet::replaced(&components, &input_ids, vec![dup.clone() as Arc<dyn RowSet>]);
        *components = Arc::new(TabletComponents {
            memrowset: Arc::new(MemRowSet::new(tablet.allocate_rowset_id())),
            rowsets: swapped.rowsets,
        });

        Job {
            tablet,
            hooks,
            kind: Kind::Flush,
            dup,
            snap1: tablet.mvcc.snapshot_at_latest(),
            schema: tablet.schema(),
        }
    };

    info!(
        "Tablet {}: flushing {} into DiskRowSet {}",
        tablet.tablet_id(),
        job.dup.describe(),
        output_id
    );
    job.run()?;
    info!(
        "Tablet {}: flush to DiskRowSet {} completed in {:?}",
        tablet.tablet_id(),
        output_id,
        start.elapsed()
    );
    Ok(())
}

/// Merge the DiskRowSets `policy` selects into one
pub(crate) fn compact(tablet: &Tablet, policy: CompactionPolicy, hooks: &dyn LifecycleHooks) -> Result<()> {
    let start = Instant::now();
    let inputs = select_inputs(tablet, policy);
    if inputs.is_empty() {
        debug!("Tablet {}: no compaction needed ({:?})", tablet.tablet_id(), policy);
        return Ok(());
    }
    hooks.on_event(LifecycleEvent::InputsSelected)?;

    let output_id = tablet.allocate_rowset_id();
    let input_ids: Vec<RowSetId> = inputs.iter().map(|r| r.id()).collect();
    let job = {
        let mut components = tablet.components.write();
        let inputs: Vec<Arc<dyn RowSet>> = inputs.into_iter().map(|d| d as Arc<dyn RowSet>).collect();
        let dup = Arc::new(DuplicatingRowSet::new(output_id, inputs));
        *components = Arc::new(Tablet::replaced(
            &components,
            &input_ids,
            vec![dup.clone() as Arc<dyn RowSet>],
        ));

        Job {
            tablet,
            hooks,
            kind: Kind::Compaction,
            dup,
            snap1: tablet.mvcc.snapshot_at_latest(),
            schema: tablet.schema(),
        }
    };

    info!(
        "Tablet {}: compacting DiskRowSets {:?} into {}",
        tablet.tablet_id(),
        input_ids,
        output_id
    );
    job.run()?;
    info!(
        "Tablet {}: compaction into DiskRowSet {} completed in {:?}",
        tablet.tablet_id(),
        output_id,
        start.elapsed()
    );
    Ok(())
}

fn select_inputs(tablet: &Tablet, policy: CompactionPolicy) -> Vec<Arc<DiskRowSet>> {
    let disk = tablet.disk_rowsets();
    match policy {
        CompactionPolicy::ForceCompactAll => disk,
        CompactionPolicy::Budgeted if disk.len() >= tablet.config().compaction_trigger => disk,
        CompactionPolicy::Budgeted => Vec::new(),
    }
}

impl Job<'_> {
    fn run(self) -> Result<()> {
        if let Err(e) = self.fire_setup_events() {
            self.restore_inputs(None);
            return Err(e);
        }

        let output = match self.write_output() {
            Ok(output) => output,
            Err(e) => {
                error!(
                    "Tablet {}: {} failed writing base data: {}",
                    self.tablet.tablet_id(),
                    self.kind.name(),
                    e
                );
                self.restore_inputs(None);
                return Err(e);
            }
        };

        if let Err(e) = self.catch_up(&output) {
            self.restore_inputs(Some(&output));
            return Err(e);
        }

        self.tablet.replace_rowsets(&[self.dup.id()], vec![output.clone() as Arc<dyn RowSet>]);

        let flushed = match self.kind {
            Kind::Flush => Some(&self.snap1),
            Kind::Compaction => None,
        };
        self.tablet.persist_metadata(flushed)?;

        for input in self.dup.inputs() {
            if let Some(drs) = input.clone().as_disk_rowset() {
                drs.mark_obsolete();
            }
        }
        self.hooks.on_event(LifecycleEvent::NewRowSetSwappedIn)
    }

    fn fire_setup_events(&self) -> Result<()> {
        self.hooks.on_event(LifecycleEvent::SnapshotTaken)?;
        if self.kind == Kind::Flush {
            self.hooks.on_event(LifecycleEvent::MemStoreSwapped)?;
        }
        self.hooks.on_event(LifecycleEvent::DuplicatingRowSetInstalled)
    }

    /// Write the inputs' state as of S1
    fn write_output(&self) -> Result<Arc<DiskRowSet>> {
        let rows = self.dup.clone().new_row_iterator(self.snap1.clone());
        let output = DiskRowSet::write(
            &self.tablet.rowsets_dir(),
            self.dup.id(),
            &self.schema,
            &self.tablet.config().diskrowset,
            self.snap1.clone(),
            rows,
        )?;
        debug!(
            "Tablet {}: wrote {} rows to DiskRowSet {}",
            self.tablet.tablet_id(),
            output.row_count(),
            output.id()
        );
        Ok(Arc::new(output))
    }

    /// Bring the output up to date with mutations that raced the write
    fn catch_up(&self, output: &Arc<DiskRowSet>) -> Result<()> {
        self.hooks.on_event(LifecycleEvent::BaseDataWritten)?;

        let snap2 = {
            // No writer is in flight while the component lock is exclusive
            let _components = self.tablet.components.write();
            self.dup.attach_output(output.clone());
            self.tablet.mvcc.snapshot_at_latest()
        };

        let mut missed = self.dup.missed_mutations(&self.snap1, &snap2)?;
        missed.sort_by_key(|m| m.ts);
        let count = missed.len();
        for m in missed {
            output.apply_to_dms_by_key(&m.key, m.change, m.ts)?;
        }
        if count > 0 {
            debug!(
                "Tablet {}: reapplied {} mutations to DiskRowSet {}",
                self.tablet.tablet_id(),
                count,
                output.id()
            );
        }

        self.hooks.on_event(LifecycleEvent::MissedDeltasReapplied)
    }

    /// Put the inputs back in place of the duplicating row set
    fn restore_inputs(&self, output: Option<&Arc<DiskRowSet>>) {
        warn!(
            "Tablet {}: {} aborted, restoring {}",
            self.tablet.tablet_id(),
            self.kind.name(),
            self.dup.describe()
        );
        self.tablet.replace_rowsets(&[self.dup.id()], self.dup.inputs().to_vec());
        if let Some(output) = output {
            output.mark_obsolete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use crate::rowchange::RowChange;
    use crate::schema::ColumnSchema;
    use crate::tablet::{QuorumConfig, TabletConfig};
    use crate::types::{DataType, Value};
    use crate::TabletError;
    use tempfile::TempDir;

    fn open_tablet(dir: &TempDir) -> Arc<Tablet> {
        let schema = Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("val", DataType::UInt32),
            ],
            1,
        )
        .unwrap();
        Tablet::create(
            dir.path(),
            "t1",
            "test",
            schema,
            QuorumConfig::initial("local"),
            TabletConfig::default(),
        )
        .unwrap()
    }

    fn insert(tablet: &Tablet, k: u32, v: u32) {
        let row = Row::from_values(&tablet.schema(), vec![Value::UInt32(k), Value::UInt32(v)]).unwrap();
        tablet.insert(row).unwrap();
    }

    fn scan(tablet: &Tablet) -> Vec<(u32, u32)> {
        let projection = tablet.schema().without_ids();
        tablet
            .new_row_iterator(&projection, &[])
            .unwrap()
            .map(|r| {
                let r = r.unwrap();
                (r[0].as_u32().unwrap(), r[1].as_u32().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_flush_then_compact() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(&dir);

        for k in 0..10 {
            insert(&tablet, k, k);
        }
        tablet.flush().unwrap();
        for k in 10..20 {
            insert(&tablet, k, k);
        }
        tablet.flush().unwrap();
        assert_eq!(tablet.num_rowsets(), 2);

        let schema = tablet.schema();
        let key = Row::from_values(&schema, vec![Value::UInt32(3), Value::UInt32(0)])
            .unwrap()
            .encoded_key(&schema)
            .unwrap();
        tablet.mutate(key, RowChange::Delete).unwrap();

        tablet.compact(CompactionPolicy::ForceCompactAll).unwrap();
        assert_eq!(tablet.num_rowsets(), 1);
        let rows = scan(&tablet);
        assert_eq!(rows.len(), 19);
        assert!(!rows.iter().any(|(k, _)| *k == 3));
        assert_eq!(tablet.metadata().rowsets.len(), 1);
    }

    #[test]
    fn test_budgeted_waits_for_trigger() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(&dir);

        insert(&tablet, 1, 1);
        tablet.flush().unwrap();
        tablet.compact(CompactionPolicy::Budgeted).unwrap();
        assert_eq!(tablet.num_rowsets(), 1);
        assert_eq!(tablet.metadata().rowsets[0].id, tablet.disk_rowsets()[0].id());
    }

    #[test]
    fn test_failed_hook_restores_inputs() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(&dir);
        for k in 0..5 {
            insert(&tablet, k, k);
        }

        let hooks = HookRegistry::new().on(LifecycleEvent::MissedDeltasReapplied, || {
            Err(TabletError::Internal("injected".into()))
        });
        assert!(tablet.flush_with_hooks(&hooks).is_err());

        // The old MemRowSet is still readable and is flushed next time
        assert_eq!(scan(&tablet).len(), 5);
        assert!(tablet.metadata().rowsets.is_empty());
        tablet.flush().unwrap();
        assert_eq!(tablet.disk_rowsets().len(), 1);
        assert_eq!(tablet.num_rowsets(), 1);
        assert_eq!(scan(&tablet).len(), 5);
    }

    fn rowset_dirs(tablet: &Tablet) -> usize {
        std::fs::read_dir(tablet.rowsets_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .count()
    }

    /// Put a plain file where the next row set's directory goes
    fn block_next_output(tablet: &Tablet) -> std::path::PathBuf {
        let next = tablet.allocate_rowset_id() + 1;
        let path = tablet.rowsets_dir().join(format!("rs_{}", next));
        std::fs::write(&path, b"not a directory").unwrap();
        path
    }

    #[test]
    fn test_failed_base_write_restores_inputs() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(&dir);
        for k in 0..5 {
            insert(&tablet, k, k);
        }

        let blocker = block_next_output(&tablet);
        assert!(tablet.flush().is_err());
        assert!(blocker.is_file());
        assert_eq!(rowset_dirs(&tablet), 0);
        assert!(tablet.metadata().rowsets.is_empty());
        assert_eq!(scan(&tablet).len(), 5);

        tablet.flush().unwrap();
        assert_eq!(tablet.disk_rowsets().len(), 1);
        assert_eq!(rowset_dirs(&tablet), 1);

        for k in 5..10 {
            insert(&tablet, k, k);
        }
        tablet.flush().unwrap();
        assert_eq!(rowset_dirs(&tablet), 2);

        block_next_output(&tablet);
        assert!(tablet.compact(CompactionPolicy::ForceCompactAll).is_err());
        assert_eq!(tablet.disk_rowsets().len(), 2);
        assert_eq!(rowset_dirs(&tablet), 2);
        assert_eq!(scan(&tablet).len(), 10);

        tablet.compact(CompactionPolicy::ForceCompactAll).unwrap();
        assert_eq!(tablet.disk_rowsets().len(), 1);
        assert_eq!(tablet.metadata().rowsets.len(), 1);
        assert_eq!(scan(&tablet).len(), 10);

        drop(tablet);
        let tablet = Tablet::open(dir.path(), TabletConfig::default()).unwrap();
        assert_eq!(scan(&tablet).len(), 10);
    }
}
