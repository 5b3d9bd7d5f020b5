//! Tablet superblock
//!
//! `tablet-meta.json` names everything durable about a tablet: its schema,
//! the DiskRowSets that make it up, and the snapshot of the last MemRowSet
//! flush. It is replaced atomically on every change.

use super::consensus::QuorumConfig;
use crate::diskrowset::RowSetMetadata;
use crate::mvcc::MvccSnapshot;
use crate::rowset::RowSetId;
use crate::schema::Schema;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "tablet-meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub tablet_id: String,
    pub table_name: String,
    pub schema: Schema,
    pub rowsets: Vec<RowSetMetadata>,
    pub next_rowset_id: RowSetId,
    /// Every insert committed here lives in a DiskRowSet
    pub flushed_snapshot: MvccSnapshot,
    pub quorum: QuorumConfig,
    pub created_at: DateTime<Utc>,
}

impl TabletMetadata {
    pub fn new(tablet_id: &str, table_name: &str, schema: Schema, quorum: QuorumConfig) -> Self {
        Self {
            tablet_id: tablet_id.to_string(),
            table_name: table_name.to_string(),
            schema,
            rowsets: Vec::new(),
            next_rowset_id: 0,
            flushed_snapshot: MvccSnapshot::none(),
            quorum,
            created_at: Utc::now(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(Self::path(dir))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write to a temp file, fsync, then rename over the old superblock
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        let data = serde_json::to_vec_pretty(self)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, Self::path(dir))?;
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Timestamp;
    use crate::schema::ColumnSchema;
    use crate::types::DataType;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let schema = Schema::new(vec![ColumnSchema::new("key", DataType::UInt32)], 1)
            .unwrap()
            .assign_ids()
            .unwrap();
        let mut meta = TabletMetadata::new("t1", "table", schema, QuorumConfig::initial("ts"));
        meta.rowsets.push(RowSetMetadata {
            id: 0,
            base_snapshot: MvccSnapshot::committed_before(Timestamp::new(9)),
            delta_ids: vec![0, 1],
        });
        meta.next_rowset_id = 2;
        meta.save(temp_dir.path()).unwrap();

        assert!(TabletMetadata::exists(temp_dir.path()));
        assert_eq!(TabletMetadata::load(temp_dir.path()).unwrap(), meta);
    }
}
