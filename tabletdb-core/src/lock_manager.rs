//! Per-row locks serializing writers on the same primary key

use crate::encoding::EncodedKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Row lock table
///
/// Writers lock every key they touch before applying a batch. Keys are
/// always acquired in sorted order, so two batches can never deadlock.
#[derive(Default)]
pub struct LockManager {
    held: Mutex<HashSet<EncodedKey>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock all `keys`, blocking while another writer holds any of them
    pub fn lock_rows(&self, keys: impl IntoIterator<Item = EncodedKey>) -> RowLocks<'_> {
        let mut keys: Vec<EncodedKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut held = self.held.lock();
        for key in &keys {
            while held.contains(key) {
                self.released.wait(&mut held);
            }
            held.insert(key.clone());
        }

        RowLocks { manager: self, keys }
    }

    /// Number of keys currently locked
    pub fn num_locked(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, keys: &[EncodedKey]) {
        let mut held = self.held.lock();
        for key in keys {
            held.remove(key);
        }
        self.released.notify_all();
    }
}

/// Locks held by one writer; released on drop
pub struct RowLocks<'a> {
    manager: &'a LockManager,
    keys: Vec<EncodedKey>,
}

impl RowLocks<'_> {
    pub fn keys(&self) -> &[EncodedKey] {
        &self.keys
    }
}

impl Drop for RowLocks<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn key(k: u8) -> EncodedKey {
        EncodedKey::from_bytes(vec![k])
    }

    #[test]
    fn test_lock_and_release() {
        let manager = LockManager::new();
        {
            let locks = manager.lock_rows(vec![key(2), key(1), key(2)]);
            assert_eq!(locks.keys(), &[key(1), key(2)]);
            assert_eq!(manager.num_locked(), 2);
        }
        assert_eq!(manager.num_locked(), 0);
    }

    #[test]
    fn test_writers_serialize_on_key() {
        let manager = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    // Overlapping key sets in different orders
                    let keys = if i % 2 == 0 { vec![key(1), key(2)] } else { vec![key(2), key(1)] };
                    for _ in 0..50 {
                        let _locks = manager.lock_rows(keys.clone());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(manager.num_locked(), 0);
    }
}
