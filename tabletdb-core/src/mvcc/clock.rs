//! Timestamp sources

use super::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of monotonically increasing timestamps
pub trait Clock: Send + Sync {
    /// Next timestamp, strictly greater than any previously returned
    fn now(&self) -> Timestamp;

    /// Make sure later calls to `now` return values above `ts`
    fn update(&self, ts: Timestamp);
}

/// Counter-based clock
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update(&self, ts: Timestamp) {
        self.last.fetch_max(ts.value(), Ordering::SeqCst);
    }
}
