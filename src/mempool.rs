//! Atomic transactions waiting for a block, and the worker feeding gossiped ones in.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::atomic::Tx;
use crate::common::Id;
use crate::vm::Vm;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("issued queue is full ({0} txs)")]
    Full(usize),
    #[error("atomic tx {0} is already pending")]
    Duplicate(Id),
    #[error("tx intake is closed")]
    IntakeClosed,
    #[error("tx intake is busy")]
    IntakeFull,
}

/// A queued transaction. `rotated` marks an import that was already pushed back once because its
/// UTXOs could not be read.
#[derive(Clone, Debug)]
pub struct Pending {
    pub tx: Arc<Tx>,
    pub rotated: bool,
}

/// Two FIFOs: transactions whose carrier block was rejected, drained first, and freshly issued
/// ones.
pub struct AtomicMempool {
    reissue: Mutex<VecDeque<Pending>>,
    issued: Mutex<VecDeque<Pending>>,
    reissue_capacity: usize,
    issued_capacity: usize,
}

impl AtomicMempool {
    pub fn new(issued_capacity: usize, reissue_capacity: usize) -> Self {
        Self {
            reissue: Mutex::new(VecDeque::new()),
            issued: Mutex::new(VecDeque::new()),
            reissue_capacity,
            issued_capacity,
        }
    }

    fn contains(&self, id: &Id) -> bool {
        self.reissue.lock().iter().any(|p| p.tx.id() == id) ||
            self.issued.lock().iter().any(|p| p.tx.id() == id)
    }

    pub fn issue(&self, tx: Arc<Tx>) -> Result<(), MempoolError> {
        if self.contains(tx.id()) {
            return Err(MempoolError::Duplicate(*tx.id()))
        }
        let mut issued = self.issued.lock();
        if issued.len() >= self.issued_capacity {
            return Err(MempoolError::Full(issued.len()))
        }
        issued.push_back(Pending { tx, rotated: false });
        Ok(())
    }

    /// Queue a transaction of a rejected block. When over capacity the oldest entry is dropped.
    pub fn reissue(&self, tx: Arc<Tx>) -> Result<(), MempoolError> {
        if self.contains(tx.id()) {
            return Err(MempoolError::Duplicate(*tx.id()))
        }
        let mut reissue = self.reissue.lock();
        reissue.push_back(Pending { tx, rotated: false });
        while reissue.len() > self.reissue_capacity {
            if let Some(dropped) = reissue.pop_front() {
                warn!(
                    "re-issue queue over capacity, dropping atomic tx {}",
                    dropped.tx.id()
                );
            }
        }
        Ok(())
    }

    /// Take the next candidate for a block: re-issued transactions first.
    pub fn next(&self) -> Option<Pending> {
        if let Some(p) = self.reissue.lock().pop_front() {
            return Some(p)
        }
        self.issued.lock().pop_front()
    }

    /// Push an import whose UTXOs are not readable yet to the tail of the issued queue.
    pub fn rotate(&self, tx: Arc<Tx>) {
        self.issued.lock().push_back(Pending { tx, rotated: true })
    }

    /// Put a candidate that was taken but not used back at the head of its queue.
    pub fn restore(&self, pending: Pending, reissued: bool) {
        if reissued {
            self.reissue.lock().push_front(pending)
        } else {
            self.issued.lock().push_front(pending)
        }
    }

    /// Drop a transaction that made it into an accepted block.
    pub fn remove(&self, id: &Id) {
        self.reissue.lock().retain(|p| p.tx.id() != id);
        self.issued.lock().retain(|p| p.tx.id() != id);
    }

    /// Id of the head of the re-issue queue.
    pub fn reissue_head(&self) -> Option<Id> {
        self.reissue.lock().front().map(|p| *p.tx.id())
    }

    pub fn len(&self) -> usize {
        self.reissue.lock().len() + self.issued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A worker thread that decodes gossiped atomic transactions and issues them to the VM.
pub struct TxIntake {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TxIntake {
    pub fn spawn(vm: Vm, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(capacity);
        let handle = thread::spawn(move || {
            for bytes in receiver {
                match Tx::from_bytes(&bytes) {
                    Ok(tx) => {
                        let id = *tx.id();
                        if let Err(e) = vm.issue_tx(tx) {
                            debug!("gossiped atomic tx {} not issued: {}", id, e);
                        }
                    }
                    Err(e) => debug!("dropping undecodable atomic tx: {}", e),
                }
            }
        });
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Hand raw tx bytes to the worker without blocking.
    pub fn submit(&self, bytes: Vec<u8>) -> Result<(), MempoolError> {
        let sender = self.sender.as_ref().ok_or(MempoolError::IntakeClosed)?;
        sender.try_send(bytes).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => MempoolError::IntakeFull,
            mpsc::TrySendError::Disconnected(_) => MempoolError::IntakeClosed,
        })
    }

    /// Stop accepting bytes and wait for the worker to drain what it has.
    pub fn shutdown(mut self) {
        self.stop()
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tx intake worker panicked");
            }
        }
    }
}

impl Drop for TxIntake {
    fn drop(&mut self) {
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{ExportTx, UnsignedAtomicTx};
    use crate::avax::TransferableOutput;
    use crate::secp256k1fx::{OutputOwners, TransferOutput};

    fn tx(n: u8) -> Arc<Tx> {
        let unsigned = UnsignedAtomicTx::Export(ExportTx::new(
            1,
            Id::new([1; 32]),
            Id::new([2; 32]),
            Vec::new(),
            vec![TransferableOutput {
                asset_id: Id::new([n; 32]),
                out: TransferOutput {
                    amt: n as u64 + 1,
                    owners: OutputOwners::new(0, 0, Vec::new()),
                },
            }],
        ));
        Arc::new(Tx::sign(unsigned, &[]))
    }

    fn next_id(pool: &AtomicMempool) -> Option<Id> {
        pool.next().map(|p| *p.tx.id())
    }

    #[test]
    fn test_issue_bounds() {
        let pool = AtomicMempool::new(2, 2);
        pool.issue(tx(1)).unwrap();
        assert_eq!(pool.issue(tx(1)), Err(MempoolError::Duplicate(*tx(1).id())));
        pool.issue(tx(2)).unwrap();
        assert_eq!(pool.issue(tx(3)), Err(MempoolError::Full(2)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_reissue_first_and_oldest_drop() {
        let pool = AtomicMempool::new(8, 2);
        pool.issue(tx(1)).unwrap();
        pool.reissue(tx(2)).unwrap();
        pool.reissue(tx(3)).unwrap();
        pool.reissue(tx(4)).unwrap();
        assert_eq!(pool.reissue_head(), Some(*tx(3).id()));
        assert_eq!(next_id(&pool), Some(*tx(3).id()));
        assert_eq!(next_id(&pool), Some(*tx(4).id()));
        assert_eq!(next_id(&pool), Some(*tx(1).id()));
        assert_eq!(next_id(&pool), None);
    }

    #[test]
    fn test_rotate_restore_remove() {
        let pool = AtomicMempool::new(8, 8);
        pool.issue(tx(1)).unwrap();
        pool.issue(tx(2)).unwrap();

        let first = pool.next().unwrap();
        assert!(!first.rotated);
        pool.rotate(first.tx.clone());
        let second = pool.next().unwrap();
        assert_eq!(second.tx.id(), tx(2).id());
        pool.restore(second, false);
        assert_eq!(next_id(&pool), Some(*tx(2).id()));
        let rotated = pool.next().unwrap();
        assert!(rotated.rotated);
        assert_eq!(rotated.tx.id(), tx(1).id());

        pool.issue(tx(5)).unwrap();
        pool.reissue(tx(6)).unwrap();
        pool.remove(tx(5).id());
        pool.remove(tx(6).id());
        assert!(pool.is_empty());
    }
}
