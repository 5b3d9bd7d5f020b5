//! WAL writer

use super::{list_segments, segment_path, SyncPolicy, WalConfig, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Appends entries to the active segment; single writer behind a mutex
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
    entries_written: AtomicU64,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Open the log in `config.dir`, continuing its latest segment
    pub fn open(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = Self::find_latest_segment(&config.dir)?;
        let file = Self::open_segment(&config.dir, segment_id)?;
        let bytes_written = file.metadata()?.len() as usize;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            bytes_written,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
            entries_written: AtomicU64::new(0),
        })
    }

    /// Append an entry, syncing according to the policy
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let serialized = entry.serialize_with_checksum()?;
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0 && inner.bytes_written + serialized.len() > self.config.segment_size {
            self.rotate_segment(&mut inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else {
            inner.file.flush()?;
        }

        self.entries_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Entries appended through this writer
    pub fn entries_written(&self) -> u64 {
        self.entries_written.load(Ordering::Relaxed)
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => inner.last_sync.elapsed().as_millis() >= millis as u128,
            SyncPolicy::None => false,
        }
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        Self::sync_inner(inner)?;

        inner.segment_id += 1;
        inner.file = BufWriter::new(Self::open_segment(&self.config.dir, inner.segment_id)?);
        inner.bytes_written = 0;
        Ok(())
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        Ok(list_segments(dir)?.last().map(|(id, _)| *id).unwrap_or(0))
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, segment_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Timestamp;
    use crate::wal::RowOperation;
    use crate::encoding::EncodedKey;
    use crate::rowchange::RowChange;
    use tempfile::TempDir;

    #[test]
    fn test_segment_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_policy: SyncPolicy::EveryN(4),
            segment_size: 128,
        };

        let writer = WalWriter::open(config).unwrap();
        for i in 0..10u64 {
            let entry = WalEntry::write(
                Timestamp::new(i + 1),
                0,
                vec![RowOperation::Mutate {
                    key: EncodedKey::from_bytes(vec![i as u8; 16]),
                    change: RowChange::Delete,
                }],
            );
            writer.append(&entry).unwrap();
        }
        writer.sync().unwrap();

        assert_eq!(writer.entries_written(), 10);
        assert!(writer.current_segment() > 0);
        assert_eq!(
            list_segments(temp_dir.path()).unwrap().len() as u64,
            writer.current_segment() + 1
        );
    }
}
