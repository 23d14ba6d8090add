//! A [Database] on top of RocksDB, every key living under one prefix.

use log::debug;
use parking_lot::Mutex;
use rocksdb::{WriteBatch, DB};

use qcoreth::db::{BatchOp, Database, DatabaseError};

pub struct RocksDatabase {
    prefix: Vec<u8>,
    db: Mutex<Option<DB>>,
}

fn db_error(e: rocksdb::Error) -> DatabaseError {
    DatabaseError::Other(e.into_string())
}

impl RocksDatabase {
    pub fn new(rocksdb: DB, prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.to_vec(),
            db: Mutex::new(Some(rocksdb)),
        }
    }

    /// Release the underlying RocksDB handle; later calls fail with [DatabaseError::Closed].
    pub fn close(&self) -> Option<DB> {
        self.db.lock().take()
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut k = self.prefix.clone();
        k.extend_from_slice(key);
        k
    }
}

impl Database for RocksDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let db = self.db.lock();
        let db = db.as_ref().ok_or(DatabaseError::Closed)?;
        db.get(self.prefixed(key)).map_err(db_error)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let db = self.db.lock();
        let db = db.as_ref().ok_or(DatabaseError::Closed)?;
        db.put(self.prefixed(key), value).map_err(db_error)
    }

    fn delete(&self, key: &[u8]) -> Result<(), DatabaseError> {
        let db = self.db.lock();
        let db = db.as_ref().ok_or(DatabaseError::Closed)?;
        db.delete(self.prefixed(key)).map_err(db_error)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), DatabaseError> {
        let db = self.db.lock();
        let db = db.as_ref().ok_or(DatabaseError::Closed)?;
        let mut wb = WriteBatch::default();
        debug!("writing a batch of {} ops", ops.len());
        for op in ops {
            match op {
                BatchOp::Put(k, v) => wb.put(self.prefixed(&k), v),
                BatchOp::Delete(k) => wb.delete(self.prefixed(&k)),
            }
        }
        db.write(wb).map_err(db_error)
    }
}
