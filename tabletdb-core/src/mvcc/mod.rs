//! Multi-version concurrency control
//!
//! Every write runs under a transaction timestamp handed out by the
//! [`MvccManager`]. Readers take an [`MvccSnapshot`], which names the set of
//! committed timestamps they may observe: everything below
//! `all_committed_before` plus an explicit list of later commits. A
//! timestamp that is still in flight is never part of a snapshot, even when
//! later timestamps have already committed.

mod clock;

pub use clock::{Clock, LogicalClock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Transaction timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Smaller than every issued timestamp
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of committed timestamps visible to a reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccSnapshot {
    all_committed_before: Timestamp,
    /// Sorted commits at or above `all_committed_before`
    committed_timestamps: Vec<Timestamp>,
}

impl MvccSnapshot {
    /// Snapshot that sees nothing
    pub fn none() -> Self {
        Self {
            all_committed_before: Timestamp::MIN,
            committed_timestamps: Vec::new(),
        }
    }

    /// Snapshot that sees everything
    pub fn all() -> Self {
        Self {
            all_committed_before: Timestamp::MAX,
            committed_timestamps: Vec::new(),
        }
    }

    /// Snapshot of everything committed strictly before `ts`
    pub fn committed_before(ts: Timestamp) -> Self {
        Self {
            all_committed_before: ts,
            committed_timestamps: Vec::new(),
        }
    }

    pub fn is_committed(&self, ts: Timestamp) -> bool {
        ts < self.all_committed_before || self.committed_timestamps.binary_search(&ts).is_ok()
    }

    /// Committed here but not in `earlier`
    pub fn is_newly_committed(&self, earlier: &MvccSnapshot, ts: Timestamp) -> bool {
        self.is_committed(ts) && !earlier.is_committed(ts)
    }

    pub fn all_committed_before(&self) -> Timestamp {
        self.all_committed_before
    }

    /// Largest timestamp known to be committed, if bounded
    pub fn max_committed(&self) -> Option<Timestamp> {
        if self.all_committed_before == Timestamp::MAX {
            return None;
        }
        let below = self.all_committed_before.value().checked_sub(1).map(Timestamp::new);
        self.committed_timestamps.last().copied().max(below)
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MvccSnapshot[committed={{T|T < {}", self.all_committed_before)?;
        if !self.committed_timestamps.is_empty() {
            let extra: Vec<String> = self.committed_timestamps.iter().map(|t| t.to_string()).collect();
            write!(f, " or T in {{{}}}", extra.join(","))?;
        }
        write!(f, "}}]")
    }
}

struct MvccState {
    in_flight: BTreeSet<Timestamp>,
    /// Commits above the watermark
    committed: BTreeSet<Timestamp>,
    all_committed_before: Timestamp,
    last_issued: Timestamp,
}

impl MvccState {
    fn adjust_watermark(&mut self) {
        self.all_committed_before = match self.in_flight.iter().next() {
            Some(&earliest) => earliest,
            None => Timestamp::new(self.last_issued.value() + 1),
        };
        let watermark = self.all_committed_before;
        self.committed = self.committed.split_off(&watermark);
    }
}

/// Hands out transaction timestamps and tracks which ones are committed
pub struct MvccManager {
    clock: Arc<dyn Clock>,
    state: Mutex<MvccState>,
}

impl MvccManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MvccState {
                in_flight: BTreeSet::new(),
                committed: BTreeSet::new(),
                all_committed_before: Timestamp::new(1),
                last_issued: Timestamp::MIN,
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reserve a timestamp for a new transaction
    pub fn start_transaction(&self) -> Timestamp {
        let mut state = self.state.lock();
        let mut ts = self.clock.now();
        if ts <= state.last_issued {
            self.clock.update(state.last_issued);
            ts = self.clock.now();
        }
        state.last_issued = ts;
        state.in_flight.insert(ts);
        state.adjust_watermark();
        ts
    }

    /// Start a transaction at a timestamp chosen elsewhere (log replay)
    ///
    /// Timestamps must be issued in increasing order.
    pub fn start_transaction_at(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        assert!(
            ts > state.last_issued,
            "timestamp {} not above last issued {}",
            ts,
            state.last_issued
        );
        self.clock.update(ts);
        state.last_issued = ts;
        state.in_flight.insert(ts);
        state.adjust_watermark();
    }

    /// Make a transaction visible to new snapshots
    ///
    /// # Panics
    ///
    /// Committing a timestamp that is not in flight is a programming error.
    pub fn commit_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        assert!(
            state.in_flight.remove(&ts),
            "trying to commit transaction {} which is not in flight",
            ts
        );
        state.committed.insert(ts);
        state.adjust_watermark();
    }

    /// Drop a transaction that applied nothing
    pub fn abort_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        assert!(
            state.in_flight.remove(&ts),
            "trying to abort transaction {} which is not in flight",
            ts
        );
        state.adjust_watermark();
    }

    /// Treat everything up to `ts` as issued and committed
    ///
    /// Used after recovery for timestamps whose effects were already durable.
    pub fn advance_to(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        self.clock.update(ts);
        if ts > state.last_issued {
            state.last_issued = ts;
        }
        state.adjust_watermark();
    }

    /// Snapshot of everything committed so far
    pub fn snapshot_at_latest(&self) -> MvccSnapshot {
        let state = self.state.lock();
        MvccSnapshot {
            all_committed_before: state.all_committed_before,
            committed_timestamps: state.committed.iter().copied().collect(),
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MvccManager {
        MvccManager::new(Arc::new(LogicalClock::new()))
    }

    #[test]
    fn test_in_flight_is_invisible() {
        let mvcc = manager();
        let t1 = mvcc.start_transaction();
        let t2 = mvcc.start_transaction();

        mvcc.commit_transaction(t2);
        let snap = mvcc.snapshot_at_latest();
        assert!(!snap.is_committed(t1));
        assert!(snap.is_committed(t2));

        mvcc.commit_transaction(t1);
        let snap = mvcc.snapshot_at_latest();
        assert!(snap.is_committed(t1));
        assert!(snap.is_committed(t2));
        assert_eq!(snap.all_committed_before(), Timestamp::new(t2.value() + 1));
    }

    #[test]
    fn test_snapshots_are_monotonic() {
        let mvcc = manager();
        let t1 = mvcc.start_transaction();
        mvcc.commit_transaction(t1);
        let early = mvcc.snapshot_at_latest();

        let t2 = mvcc.start_transaction();
        mvcc.commit_transaction(t2);
        let late = mvcc.snapshot_at_latest();

        assert!(late.is_committed(t1));
        assert!(late.is_newly_committed(&early, t2));
        assert!(!late.is_newly_committed(&early, t1));
    }

    #[test]
    #[should_panic(expected = "not in flight")]
    fn test_double_commit_panics() {
        let mvcc = manager();
        let t = mvcc.start_transaction();
        mvcc.commit_transaction(t);
        mvcc.commit_transaction(t);
    }

    #[test]
    #[should_panic(expected = "not in flight")]
    fn test_commit_without_begin_panics() {
        let mvcc = manager();
        mvcc.commit_transaction(Timestamp::new(42));
    }

    #[test]
    fn test_replay_and_advance() {
        let clock = Arc::new(LogicalClock::new());
        let mvcc = MvccManager::new(clock.clone());
        mvcc.start_transaction_at(Timestamp::new(10));
        mvcc.commit_transaction(Timestamp::new(10));
        mvcc.advance_to(Timestamp::new(20));

        let snap = mvcc.snapshot_at_latest();
        assert!(snap.is_committed(Timestamp::new(20)));
        assert!(mvcc.start_transaction() > Timestamp::new(20));
        assert!(clock.now() > Timestamp::new(21));
    }

    #[test]
    fn test_snapshot_bounds() {
        assert!(!MvccSnapshot::none().is_committed(Timestamp::new(1)));
        assert!(MvccSnapshot::all().is_committed(Timestamp::new(u64::MAX - 1)));
        assert_eq!(MvccSnapshot::all().max_committed(), None);
        assert_eq!(
            MvccSnapshot::committed_before(Timestamp::new(5)).max_committed(),
            Some(Timestamp::new(4))
        );
        assert_eq!(MvccSnapshot::none().max_committed(), None);
    }
}
