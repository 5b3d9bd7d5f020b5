//! TabletDB Core - MVCC tablet storage engine
//!
//! A tablet stores one horizontal partition of a table:
//!
//! - **MemRowSet**: in-memory skip-list holding recent inserts and their mutations
//! - **DiskRowSet**: immutable base data on disk plus delta stores for later updates and deletes
//! - **MVCC**: every write commits at a timestamp; readers see a consistent snapshot
//! - **WAL (Write-Ahead Log)**: every write is logged before it is applied and replayed on restart
//! - **Flush and compaction**: move data to new DiskRowSets without blocking writers
//!
//! The [`tserver`] module hosts tablets and serves write, scan and schema
//! requests against them.

pub mod compaction;
pub mod delta;
pub mod diskrowset;
pub mod encoding;
pub mod lock_manager;
pub mod memrowset;
pub mod mvcc;
pub mod row;
pub mod rowchange;
pub mod rowset;
pub mod schema;
pub mod tablet;
pub mod tserver;
pub mod types;
pub mod wal;

mod error;

pub use error::{Result, TabletError, TabletServerErrorCode};

/// TabletDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// MemRowSet size that triggers a flush (64MB)
    pub const MEMROWSET_FLUSH_THRESHOLD: usize = 64 * 1024 * 1024;

    /// DeltaMemStore size that triggers a delta flush (8MB)
    pub const DMS_FLUSH_THRESHOLD: usize = 8 * 1024 * 1024;

    /// DiskRowSets per tablet before a budgeted compaction
    pub const COMPACTION_TRIGGER: usize = 4;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Bloom filter bits per key in DiskRowSets
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Idle time after which a scanner expires
    pub const SCANNER_TTL: Duration = Duration::from_secs(60);

    /// Period of background maintenance
    pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
}
