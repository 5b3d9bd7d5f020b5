//! Row set abstraction shared by memory, disk and in-flight compaction stores

use crate::diskrowset::DiskRowSet;
use crate::encoding::EncodedKey;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::row::Row;
use crate::rowchange::RowChange;
use crate::{Result, TabletError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a row set within a tablet
pub type RowSetId = u64;

/// Lazy, snapshot-consistent stream of `(key, row)` in key order
pub type RowIterator = Box<dyn Iterator<Item = Result<(EncodedKey, Row)>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSetKind {
    Memory,
    Disk,
    Duplicating,
}

impl fmt::Display for RowSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowSetKind::Memory => write!(f, "memory"),
            RowSetKind::Disk => write!(f, "disk"),
            RowSetKind::Duplicating => write!(f, "duplicating"),
        }
    }
}

/// A mutation committed between two snapshots, addressed by key
#[derive(Debug, Clone, PartialEq)]
pub struct MissedMutation {
    pub key: EncodedKey,
    pub ts: Timestamp,
    pub change: RowChange,
}

/// A set of rows with a disjoint set of live keys
pub trait RowSet: Send + Sync {
    fn id(&self) -> RowSetId;

    fn kind(&self) -> RowSetKind;

    /// Whether a live (not deleted) row with `key` exists
    fn check_row_present(&self, key: &EncodedKey) -> Result<bool>;

    /// Apply a mutation to the live row with `key`, `NotFound` otherwise
    fn mutate_row(&self, key: &EncodedKey, change: &RowChange, ts: Timestamp) -> Result<()>;

    /// Rows visible in `snapshot`, in key order
    fn new_row_iterator(self: Arc<Self>, snapshot: MvccSnapshot) -> RowIterator;

    /// Mutations committed in `upto` but not in `since`
    fn missed_mutations(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Result<Vec<MissedMutation>>;

    /// Whether the mutation of `key` at `ts` already survives a restart
    fn is_mutation_durable(&self, key: &EncodedKey, ts: Timestamp) -> Result<bool>;

    fn memory_footprint(&self) -> usize;

    fn on_disk_size(&self) -> u64 {
        0
    }

    fn describe(&self) -> String;

    fn as_disk_rowset(self: Arc<Self>) -> Option<Arc<DiskRowSet>> {
        None
    }
}

/// Merges row iterators with disjoint live keys into one key-ordered stream
pub struct MergeIterator {
    inputs: Vec<RowIterator>,
    heads: Vec<Option<(EncodedKey, Row)>>,
    primed: bool,
}

impl MergeIterator {
    pub fn new(inputs: Vec<RowIterator>) -> Self {
        let heads = inputs.iter().map(|_| None).collect();
        Self {
            inputs,
            heads,
            primed: false,
        }
    }

    fn advance(&mut self, idx: usize) -> Result<()> {
        self.heads[idx] = self.inputs[idx].next().transpose()?;
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(EncodedKey, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for idx in 0..self.inputs.len() {
                if let Err(e) = self.advance(idx) {
                    return Some(Err(e));
                }
            }
        }

        let (_, idx) = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(idx, head)| head.as_ref().map(|(key, _)| (key, idx)))
            .min()?;
        let item = self.heads[idx].take();
        if let Err(e) = self.advance(idx) {
            return Some(Err(e));
        }
        item.map(Ok)
    }
}

/// Stand-in for row sets being flushed or compacted
///
/// Reads and mutations go to the inputs. Once an output is attached, every
/// mutation is also duplicated onto it so the output stays current while the
/// swap is prepared.
pub struct DuplicatingRowSet {
    id: RowSetId,
    inputs: Vec<Arc<dyn RowSet>>,
    output: RwLock<Option<Arc<DiskRowSet>>>,
}

impl DuplicatingRowSet {
    pub fn new(id: RowSetId, inputs: Vec<Arc<dyn RowSet>>) -> Self {
        Self {
            id,
            inputs,
            output: RwLock::new(None),
        }
    }

    pub fn inputs(&self) -> &[Arc<dyn RowSet>] {
        &self.inputs
    }

    /// Start duplicating mutations onto `output`
    pub fn attach_output(&self, output: Arc<DiskRowSet>) {
        *self.output.write() = Some(output);
    }
}

impl RowSet for DuplicatingRowSet {
    fn id(&self) -> RowSetId {
        self.id
    }

    fn kind(&self) -> RowSetKind {
        RowSetKind::Duplicating
    }

    fn check_row_present(&self, key: &EncodedKey) -> Result<bool> {
        for input in &self.inputs {
            if input.check_row_present(key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn mutate_row(&self, key: &EncodedKey, change: &RowChange, ts: Timestamp) -> Result<()> {
        let mut applied = false;
        for input in &self.inputs {
            match input.mutate_row(key, change, ts) {
                Ok(()) => {
                    applied = true;
                    break;
                }
                Err(TabletError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if !applied {
            return Err(TabletError::NotFound("key not found".into()));
        }

        if let Some(output) = self.output.read().as_ref() {
            output.apply_to_dms_by_key(key, change.clone(), ts)?;
        }
        Ok(())
    }

    fn new_row_iterator(self: Arc<Self>, snapshot: MvccSnapshot) -> RowIterator {
        let iters = self
            .inputs
            .iter()
            .map(|input| input.clone().new_row_iterator(snapshot.clone()))
            .collect();
        Box::new(MergeIterator::new(iters))
    }

    fn missed_mutations(&self, since: &MvccSnapshot, upto: &MvccSnapshot) -> Result<Vec<MissedMutation>> {
        let mut missed = Vec::new();
        for input in &self.inputs {
            missed.extend(input.missed_mutations(since, upto)?);
        }
        Ok(missed)
    }

    fn is_mutation_durable(&self, key: &EncodedKey, ts: Timestamp) -> Result<bool> {
        for input in &self.inputs {
            if input.check_row_present(key)? {
                return input.is_mutation_durable(key, ts);
            }
        }
        Ok(true)
    }

    fn memory_footprint(&self) -> usize {
        self.inputs.iter().map(|i| i.memory_footprint()).sum()
    }

    fn on_disk_size(&self) -> u64 {
        self.inputs.iter().map(|i| i.on_disk_size()).sum()
    }

    fn describe(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(|i| i.describe()).collect();
        format!("DuplicatingRowSet({}: [{}])", self.id, inputs.join(", "))
    }
}
