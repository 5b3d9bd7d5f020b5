//! Lifecycle events of flushes and compactions

use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Points in a flush or compaction where hooks run
///
/// Hooks fire with no tablet lock held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Compaction inputs chosen (compaction only)
    InputsSelected,
    /// Snapshot S1 taken
    SnapshotTaken,
    /// A fresh MemRowSet replaced the one being flushed (flush only)
    MemStoreSwapped,
    /// The inputs are fronted by a duplicating row set
    DuplicatingRowSetInstalled,
    /// Base data as of S1 is on disk
    BaseDataWritten,
    /// Mutations committed between S1 and S2 were carried over
    MissedDeltasReapplied,
    /// The new row set replaced the inputs
    NewRowSetSwappedIn,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives lifecycle events; an error aborts the operation
pub trait LifecycleHooks: Send + Sync {
    fn on_event(&self, event: LifecycleEvent) -> Result<()>;
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {
    fn on_event(&self, _event: LifecycleEvent) -> Result<()> {
        Ok(())
    }
}

type Handler = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Hooks assembled from per-event closures
#[derive(Default)]
pub struct HookRegistry {
    handlers: Mutex<HashMap<LifecycleEvent, Vec<Handler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` every time `event` fires
    pub fn register<F>(&self, event: LifecycleEvent, handler: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.lock().entry(event).or_default().push(Arc::new(handler));
    }

    /// Builder form of [`HookRegistry::register`]
    pub fn on<F>(self, event: LifecycleEvent, handler: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.register(event, handler);
        self
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl LifecycleHooks for HookRegistry {
    fn on_event(&self, event: LifecycleEvent) -> Result<()> {
        // Handlers may register, clear or flush again
        let handlers: Vec<Handler> = match self.handlers.lock().get(&event) {
            Some(list) => list.clone(),
            None => return Ok(()),
        };
        for handler in handlers {
            handler()?;
        }
        Ok(())
    }
}
