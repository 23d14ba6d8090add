//! Detection of shared-memory UTXOs consumed twice along one branch of undecided blocks.
//!
//! For a block being verified, the scanner accumulates the inputs consumed by its ancestors back
//! to the most recent accepted (or genesis) block. Cumulative sets are memoized per block, so a
//! descendant only walks down to the nearest memoized ancestor. The memo is advisory: an evicted
//! entry only makes the next walk longer.
//!
//! Inputs consumed by recently accepted blocks are remembered separately, so a block built on an
//! accepted ancestor that has since been overtaken by a sibling still sees what the sibling
//! consumed.

use std::sync::Arc;

use log::trace;
use lru_time_cache::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::{Id, IdSet};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("atomic input {0} is already consumed")]
    AtomicInputConflict(Id),
    #[error("ancestor {0} is unknown")]
    UnknownAncestor(Id),
}

/// What the scanner needs to know about an ancestor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ancestor {
    pub id: Id,
    pub parent: Id,
    /// Accepted blocks (and genesis) stop the walk.
    pub decided: bool,
    /// Inputs consumed by the atomic tx of this block, empty without one.
    pub inputs: IdSet,
}

pub trait AncestrySource {
    fn ancestor(&self, id: &Id) -> Option<Ancestor>;
}

pub struct ConflictScanner {
    ancestor_inputs: Mutex<LruCache<Id, Arc<IdSet>>>,
    accepted_inputs: Mutex<LruCache<Id, ()>>,
}

impl ConflictScanner {
    pub fn new(ancestor_cache_size: usize, accepted_cache_size: usize) -> Self {
        Self {
            ancestor_inputs: Mutex::new(LruCache::with_capacity(
                ancestor_cache_size,
            )),
            accepted_inputs: Mutex::new(LruCache::with_capacity(
                accepted_cache_size,
            )),
        }
    }

    /// Inputs consumed by the undecided ancestors of a block whose parent is `parent`, including
    /// `parent` itself.
    pub fn ancestor_inputs(
        &self, source: &dyn AncestrySource, parent: &Id,
    ) -> Result<Arc<IdSet>, ConflictError> {
        let mut path = Vec::new();
        let mut inputs = IdSet::new();
        let mut cur = *parent;
        loop {
            let anc = source
                .ancestor(&cur)
                .ok_or(ConflictError::UnknownAncestor(cur))?;
            if anc.decided {
                break
            }
            if let Some(cached) = self.ancestor_inputs.lock().get(&cur) {
                inputs = IdSet::clone(cached);
                break
            }
            cur = anc.parent;
            path.push(anc);
        }
        trace!("conflict scan of {} walked {} ancestors", parent, path.len());

        let mut snapshot = Arc::new(inputs);
        let mut cache = self.ancestor_inputs.lock();
        for anc in path.into_iter().rev() {
            if !anc.inputs.is_empty() {
                let mut next = IdSet::clone(&snapshot);
                next.extend(anc.inputs);
                snapshot = Arc::new(next);
            }
            cache.insert(anc.id, snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Fails if any of `inputs` is consumed by an undecided ancestor or a recently accepted
    /// block.
    pub fn scan(
        &self, source: &dyn AncestrySource, parent: &Id, inputs: &IdSet,
    ) -> Result<(), ConflictError> {
        if inputs.is_empty() {
            return Ok(())
        }
        {
            let mut accepted = self.accepted_inputs.lock();
            for id in inputs {
                if accepted.get(id).is_some() {
                    return Err(ConflictError::AtomicInputConflict(*id))
                }
            }
        }
        let ancestors = self.ancestor_inputs(source, parent)?;
        match inputs.iter().find(|id| ancestors.contains(id)) {
            Some(id) => Err(ConflictError::AtomicInputConflict(*id)),
            None => Ok(()),
        }
    }

    pub fn record_accepted(&self, inputs: &IdSet) {
        let mut accepted = self.accepted_inputs.lock();
        for id in inputs {
            accepted.insert(*id, ());
        }
    }

    /// Whether a cumulative set is memoized for `id`.
    pub fn is_memoized(&self, id: &Id) -> bool {
        self.ancestor_inputs.lock().get(id).is_some()
    }
}
