//! Write-ahead log
//!
//! Every accepted write is appended here before it is applied in memory.
//! The log is a sequence of numbered segment files `wal_<20 digits>.log`,
//! each holding length-prefixed, CRC32-checked entries.

mod entry;
mod reader;
mod writer;

pub use entry::{RowOperation, WalEntry, WalEntryType, WalOperation};
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// When appended entries are fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// Sync after every append
    Immediate,
    /// Sync after N appends
    EveryN(usize),
    /// Sync when at least this long has passed since the last sync
    Interval { millis: u64 },
    /// Leave it to the OS
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory for segment files
    pub dir: PathBuf,
    pub sync_policy: SyncPolicy,
    /// Segment size that triggers rotation
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

impl WalConfig {
    /// Same settings, different directory
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }
}

pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", segment_id))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment files in `dir`, ordered by segment id
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
