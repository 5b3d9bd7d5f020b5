//! Open scanners, keyed by server-assigned ids

use crate::tablet::TabletIterator;
use crate::types::Value;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct ScannerState {
    iter: TabletIterator,
    /// Row read ahead to answer "more results?"
    peeked: Option<Vec<Value>>,
    last_access: Instant,
}

/// A scan in progress
pub struct Scanner {
    id: String,
    tablet_id: String,
    state: Mutex<ScannerState>,
}

impl Scanner {
    pub fn new(tablet_id: &str, iter: TabletIterator) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tablet_id: tablet_id.to_string(),
            state: Mutex::new(ScannerState {
                iter,
                peeked: None,
                last_access: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// Read rows until their size reaches `batch_size_bytes`
    ///
    /// Returns the rows and whether more remain. A zero batch size only
    /// checks for more results.
    pub fn next_batch(&self, batch_size_bytes: usize) -> Result<(Vec<Vec<Value>>, bool)> {
        let mut state = self.state.lock();
        state.last_access = Instant::now();

        let mut rows = Vec::new();
        let mut bytes = 0;
        while bytes < batch_size_bytes {
            let next = match state.peeked.take() {
                Some(row) => Some(row),
                None => state.iter.next().transpose()?,
            };
            match next {
                Some(row) => {
                    bytes += row.iter().map(|v| v.size()).sum::<usize>();
                    rows.push(row);
                }
                None => return Ok((rows, false)),
            }
        }

        if state.peeked.is_none() {
            state.peeked = state.iter.next().transpose()?;
        }
        let has_more = state.peeked.is_some();
        Ok((rows, has_more))
    }

    pub fn idle_time(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }
}

#[derive(Default)]
pub struct ScannerManager {
    scanners: RwLock<HashMap<String, Arc<Scanner>>>,
}

impl ScannerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scanner: Arc<Scanner>) {
        debug!("Registered scanner {} on tablet {}", scanner.id(), scanner.tablet_id());
        self.scanners.write().insert(scanner.id().to_string(), scanner);
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Scanner>> {
        self.scanners.read().get(id).cloned()
    }

    /// Returns whether the scanner was registered
    pub fn unregister(&self, id: &str) -> bool {
        self.scanners.write().remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.scanners.read().len()
    }

    /// Drop scanners idle for longer than `idle_timeout`
    pub fn remove_expired(&self, idle_timeout: Duration) -> usize {
        let mut scanners = self.scanners.write();
        let before = scanners.len();
        scanners.retain(|id, scanner| {
            let keep = scanner.idle_time() <= idle_timeout;
            if !keep {
                info!("Expiring scanner {} on tablet {}", id, scanner.tablet_id());
            }
            keep
        });
        before - scanners.len()
    }

    /// Drop every scanner of a tablet
    pub fn remove_for_tablet(&self, tablet_id: &str) -> usize {
        let mut scanners = self.scanners.write();
        let before = scanners.len();
        scanners.retain(|_, scanner| scanner.tablet_id() != tablet_id);
        before - scanners.len()
    }
}
