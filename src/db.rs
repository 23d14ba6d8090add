//! Key-value database interface and the persisted acceptance index.

use std::sync::Arc;

use thiserror::Error;

use crate::common::Id;

const DB_PREFIX_ACCEPTED: &[u8] = b"accepted"; // height => accepted block id
const DB_PREFIX_META: &[u8] = b"meta"; // VM metadata
const LAST_ACCEPTED_KEY: &[u8] = b"last_accepted";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("database closed")]
    Closed,
    #[error("corrupted value under key {0}")]
    Corrupted(String),
    #[error("database failure: {0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A local key-value store. Calls may block on disk I/O.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;
    fn delete(&self, key: &[u8]) -> Result<(), DatabaseError>;
    /// Apply all `ops` atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), DatabaseError>;
}

/// Buffered writes against a [Database], applied in one atomic step by [Batch::write].
pub struct Batch {
    db: Arc<dyn Database>,
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, ops: Vec::new() }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()))
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()))
    }

    pub fn write(self) -> Result<(), DatabaseError> {
        self.db.write_batch(self.ops)
    }
}

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + 1 + key.len());
    k.extend_from_slice(prefix);
    k.push(b'/');
    k.extend_from_slice(key);
    k
}

/// `height (u64, big-endian) => accepted block id`, plus the last accepted pointer.
#[derive(Clone)]
pub struct AcceptedIndex {
    db: Arc<dyn Database>,
}

impl AcceptedIndex {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    fn height_key(height: u64) -> Vec<u8> {
        prefixed(DB_PREFIX_ACCEPTED, &height.to_be_bytes())
    }

    fn last_accepted_key() -> Vec<u8> {
        prefixed(DB_PREFIX_META, LAST_ACCEPTED_KEY)
    }

    pub fn get(&self, height: u64) -> Result<Option<Id>, DatabaseError> {
        let key = Self::height_key(height);
        match self.db.get(&key)? {
            None => Ok(None),
            Some(v) => Id::try_from(&v[..]).map(Some).map_err(|_| {
                DatabaseError::Corrupted(hex::encode(&key))
            }),
        }
    }

    pub fn last_accepted(&self) -> Result<Option<Id>, DatabaseError> {
        let key = Self::last_accepted_key();
        match self.db.get(&key)? {
            None => Ok(None),
            Some(v) => Id::try_from(&v[..]).map(Some).map_err(|_| {
                DatabaseError::Corrupted(hex::encode(&key))
            }),
        }
    }

    /// Start a batch recording `id` as accepted at `height`.
    pub fn accept_batch(&self, height: u64, id: &Id) -> Batch {
        let mut batch = Batch::new(self.db.clone());
        batch.put(&Self::height_key(height), id.as_bytes());
        batch.put(&Self::last_accepted_key(), id.as_bytes());
        batch
    }
}
