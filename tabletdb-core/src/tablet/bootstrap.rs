//! Opening a tablet from disk and replaying its log
//!
//! The old log is moved aside to `wal-recovery/` before anything is
//! replayed. Every operation that is not already durable in flushed state is
//! applied again at its original timestamp and appended to a fresh log, so
//! a crash in the middle of bootstrap loses nothing and a second bootstrap
//! replays the same operations.

use super::metadata::TabletMetadata;
use super::{Tablet, TabletConfig, ROWSETS_DIR, WAL_DIR, WAL_RECOVERY_DIR};
use crate::diskrowset::DiskRowSet;
use crate::encoding::EncodedKey;
use crate::mvcc::Timestamp;
use crate::wal::{RowOperation, WalConfig, WalEntry, WalOperation, WalReader, WalWriter};
use crate::Result;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters from one replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub entries: usize,
    pub ops_replayed: usize,
    pub ops_skipped: usize,
    pub alters_replayed: usize,
}

pub struct TabletBootstrap {
    dir: PathBuf,
    config: TabletConfig,
}

impl TabletBootstrap {
    pub fn new(dir: &Path, config: TabletConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config,
        }
    }

    pub fn bootstrap(self) -> Result<Arc<Tablet>> {
        let start = Instant::now();
        let metadata = TabletMetadata::load(&self.dir)?;
        info!(
            "Bootstrapping tablet {} with {} DiskRowSets",
            metadata.tablet_id,
            metadata.rowsets.len()
        );

        let rowsets_dir = self.dir.join(ROWSETS_DIR);
        fs::create_dir_all(&rowsets_dir)?;
        let disk_rowsets = metadata
            .rowsets
            .iter()
            .map(|meta| DiskRowSet::open(&rowsets_dir, meta).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let recovery_dir = self.prepare_recovery_dir()?;
        let mut entries = match &recovery_dir {
            Some(dir) => WalReader::new(dir).read_all()?,
            None => Vec::new(),
        };
        entries.sort_by_key(|e| e.timestamp);

        let wal_config = WalConfig {
            dir: self.dir.join(WAL_DIR),
            ..self.config.wal.clone()
        };
        let wal = WalWriter::open(wal_config)?;

        let mut max_ts = entries.iter().map(|e| e.timestamp).max();
        for drs in &disk_rowsets {
            max_ts = max_ts.max(drs.max_durable_ts());
        }
        max_ts = max_ts.max(metadata.flushed_snapshot.max_committed());

        let tablet = Tablet::from_parts(&self.dir, self.config, metadata, disk_rowsets, wal);
        let stats = Self::replay(&tablet, entries)?;
        tablet.sync_wal()?;

        if let Some(dir) = recovery_dir {
            fs::remove_dir_all(&dir)?;
        }
        if let Some(ts) = max_ts {
            tablet.mvcc.advance_to(ts);
        }
        let quorum = tablet.start_consensus()?;

        info!(
            "Tablet {} bootstrapped in {:?}: {} log entries, {} operations replayed, {} already durable, config seqno {}",
            tablet.tablet_id(),
            start.elapsed(),
            stats.entries,
            stats.ops_replayed,
            stats.ops_skipped,
            quorum.seqno
        );
        Ok(Arc::new(tablet))
    }

    /// Move the log aside, or reuse a recovery directory left by a crash
    ///
    /// Once `wal-recovery/` exists it is the complete log; a `wal/` next to
    /// it holds only a partial re-log from the interrupted bootstrap.
    fn prepare_recovery_dir(&self) -> Result<Option<PathBuf>> {
        let wal_dir = self.dir.join(WAL_DIR);
        let recovery_dir = self.dir.join(WAL_RECOVERY_DIR);

        if recovery_dir.exists() {
            warn!(
                "Found {:?} from an interrupted bootstrap, replaying it again",
                recovery_dir
            );
            if wal_dir.exists() {
                fs::remove_dir_all(&wal_dir)?;
            }
            return Ok(Some(recovery_dir));
        }
        if wal_dir.exists() {
            fs::rename(&wal_dir, &recovery_dir)?;
            return Ok(Some(recovery_dir));
        }
        Ok(None)
    }

    fn replay(tablet: &Tablet, entries: Vec<WalEntry>) -> Result<ReplayStats> {
        let mut stats = ReplayStats {
            entries: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let ts = entry.timestamp;
            match entry.op {
                WalOperation::Write { schema_version, ops } => {
                    let schema = tablet.schema();
                    let mut pending = Vec::with_capacity(ops.len());
                    // A row touched by an earlier pending op of this entry is not durable either
                    let mut pending_keys = HashSet::new();
                    for op in ops {
                        let key = match &op {
                            RowOperation::Insert { row } => row.encoded_key(&schema)?,
                            RowOperation::Mutate { key, .. } => key.clone(),
                        };
                        if !pending_keys.contains(&key) && Self::is_durable(tablet, &op, &key, ts)? {
                            stats.ops_skipped += 1;
                        } else {
                            pending_keys.insert(key);
                            pending.push(op);
                        }
                    }
                    if pending.is_empty() {
                        continue;
                    }
                    stats.ops_replayed += pending.len();
                    tablet.replay_write(ts, schema_version, pending)?;
                }
                WalOperation::AlterSchema { schema } => {
                    if schema.version() <= tablet.schema().version() {
                        debug!("Skipping durable schema change to version {}", schema.version());
                        continue;
                    }
                    tablet.replay_alter(ts, schema)?;
                    stats.alters_replayed += 1;
                }
            }
        }
        Ok(stats)
    }

    fn is_durable(tablet: &Tablet, op: &RowOperation, key: &EncodedKey, ts: Timestamp) -> Result<bool> {
        match op {
            RowOperation::Insert { .. } => Ok(tablet.is_insert_durable(ts)),
            RowOperation::Mutate { .. } => tablet.is_mutation_durable(key, ts),
        }
    }
}
