//! In-memory stand-ins for the collaborators the VM talks to: EVM state and engine, shared
//! memory, and the key-value database.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;

use qcoreth::chain::{EngineError, EthBlock, EthTx, EvmEngine, Header};
use qcoreth::common::{Addr, Hash, Id, U256};
use qcoreth::db::{Batch, BatchOp, Database, DatabaseError};
use qcoreth::shared_memory::{
    Element, Requests, SharedMemory, SharedMemoryError,
};
use qcoreth::state::StateDB;

#[derive(Clone, Default, Debug)]
struct DummyAccount {
    balance: U256,
    multi_coin: BTreeMap<Id, U256>,
    nonce: u64,
}

#[derive(Clone, Default, Debug)]
pub struct DummyState {
    accounts: BTreeMap<Addr, DummyAccount>,
}

impl DummyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances(alloc: &[(Addr, U256)]) -> Self {
        let mut s = Self::new();
        for (addr, balance) in alloc {
            s.get_account(addr).balance = *balance;
        }
        s
    }

    fn get_account(&mut self, account: &Addr) -> &mut DummyAccount {
        self.accounts
            .entry(account.clone())
            .or_insert_with(DummyAccount::default)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}

impl StateDB for DummyState {
    fn get_balance(&self, account: &Addr) -> U256 {
        self.accounts
            .get(account)
            .map(|acc| acc.balance)
            .unwrap_or_else(U256::zero)
    }
    fn add_balance(&mut self, account: &Addr, amount: &U256) {
        info!("add_balance({}, {})", account, amount);
        let acc = self.get_account(account);
        acc.balance = acc.balance.saturating_add(*amount)
    }
    fn sub_balance(&mut self, account: &Addr, amount: &U256) {
        info!("sub_balance({}, {})", account, amount);
        let acc = self.get_account(account);
        acc.balance = acc.balance.saturating_sub(*amount)
    }
    fn get_balance_multi_coin(&self, account: &Addr, coin: &Id) -> U256 {
        self.accounts
            .get(account)
            .and_then(|acc| acc.multi_coin.get(coin))
            .copied()
            .unwrap_or_else(U256::zero)
    }
    fn add_balance_multi_coin(
        &mut self, account: &Addr, coin: &Id, amount: &U256,
    ) {
        info!("add_balance_multi_coin({}, {}, {})", account, coin, amount);
        let b = self
            .get_account(account)
            .multi_coin
            .entry(*coin)
            .or_insert_with(U256::zero);
        *b = b.saturating_add(*amount)
    }
    fn sub_balance_multi_coin(
        &mut self, account: &Addr, coin: &Id, amount: &U256,
    ) {
        info!("sub_balance_multi_coin({}, {}, {})", account, coin, amount);
        let b = self
            .get_account(account)
            .multi_coin
            .entry(*coin)
            .or_insert_with(U256::zero);
        *b = b.saturating_sub(*amount)
    }
    fn get_nonce(&self, account: &Addr) -> u64 {
        self.accounts.get(account).map(|acc| acc.nonce).unwrap_or(0)
    }
    fn set_nonce(&mut self, account: &Addr, nonce: u64) {
        info!("set_nonce({}, {})", account, nonce);
        self.get_account(account).nonce = nonce
    }
    fn root(&self) -> Hash {
        let mut buff = Vec::new();
        let mut word = [0u8; 32];
        for (addr, acc) in self.accounts.iter() {
            buff.extend_from_slice(addr.as_bytes());
            acc.balance.to_big_endian(&mut word);
            buff.extend_from_slice(&word);
            buff.extend_from_slice(&acc.nonce.to_be_bytes());
            for (coin, amount) in acc.multi_coin.iter() {
                buff.extend_from_slice(coin.as_bytes());
                amount.to_big_endian(&mut word);
                buff.extend_from_slice(&word);
            }
        }
        Hash::hash(&buff)
    }
    fn snapshot(&self) -> Box<dyn StateDB> {
        Box::new(self.clone())
    }
}

struct DummyEngineInner {
    blocks: HashMap<Hash, (EthBlock, Box<dyn StateDB>)>,
    accepted: HashSet<Hash>,
    preferred: Hash,
    pending: VecDeque<EthTx>,
}

/// Executes plain value transfers; contract calls are rejected.
pub struct DummyEngine {
    chain_id: U256,
    genesis: EthBlock,
    inner: Mutex<DummyEngineInner>,
}

impl DummyEngine {
    pub fn new(chain_id: u64, alloc: &[(Addr, U256)]) -> Self {
        let state = DummyState::with_balances(alloc);
        let genesis = EthBlock::new(
            Header {
                parent_hash: Hash::zero().clone(),
                coinbase: Addr::zero().clone(),
                state_root: state.root(),
                tx_root: Hash::zero().clone(),
                number: 0,
                gas_limit: 8_000_000,
                timestamp: 0,
                extra_data: Vec::new().into(),
            },
            Vec::new(),
        );
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash.clone(),
            (genesis.clone(), Box::new(state) as Box<dyn StateDB>),
        );
        let mut accepted = HashSet::new();
        accepted.insert(hash.clone());
        Self {
            chain_id: chain_id.into(),
            genesis,
            inner: Mutex::new(DummyEngineInner {
                blocks,
                accepted,
                preferred: hash,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn add_pending(&self, tx: EthTx) {
        self.inner.lock().pending.push_back(tx)
    }

    pub fn is_accepted(&self, hash: &Hash) -> bool {
        self.inner.lock().accepted.contains(hash)
    }

    pub fn preferred(&self) -> Hash {
        self.inner.lock().preferred.clone()
    }
}

impl EvmEngine for DummyEngine {
    fn chain_id(&self) -> U256 {
        self.chain_id
    }

    fn genesis(&self) -> EthBlock {
        self.genesis.clone()
    }

    fn get_block(&self, hash: &Hash) -> Option<EthBlock> {
        self.inner.lock().blocks.get(hash).map(|(b, _)| b.clone())
    }

    fn block_state(&self, hash: &Hash) -> Result<Box<dyn StateDB>, EngineError> {
        self.inner
            .lock()
            .blocks
            .get(hash)
            .map(|(_, s)| s.snapshot())
            .ok_or_else(|| EngineError::UnknownBlock(hash.clone()))
    }

    fn apply_transactions(
        &self, header: &Header, txs: &[EthTx], state: &mut dyn StateDB,
    ) -> Result<(), EngineError> {
        for tx in txs {
            let hash = tx.hash();
            let sender = tx
                .sender(&self.chain_id)
                .ok_or_else(|| EngineError::InvalidSender(hash.clone()))?;
            if !tx.data.is_empty() {
                return Err(EngineError::Unsupported(hash))
            }
            let nonce = state.get_nonce(&sender);
            if nonce != tx.nonce {
                return Err(EngineError::NonceMismatch {
                    tx: hash,
                    expected: nonce,
                    got: tx.nonce,
                })
            }
            let value = U256::from(tx.value.clone());
            let fee = U256::from(tx.gas_price.clone())
                .checked_mul(tx.gas.into())
                .ok_or_else(|| EngineError::InsufficientBalance(hash.clone()))?;
            let cost = value
                .checked_add(fee)
                .ok_or_else(|| EngineError::InsufficientBalance(hash.clone()))?;
            if state.get_balance(&sender) < cost {
                return Err(EngineError::InsufficientBalance(hash))
            }
            state.sub_balance(&sender, &cost);
            if let Some(to) = tx.to() {
                state.add_balance(to, &value);
            }
            state.add_balance(&header.coinbase, &fee);
            state.set_nonce(&sender, nonce + 1);
        }
        Ok(())
    }

    fn insert_block(
        &self, block: &EthBlock, state: Box<dyn StateDB>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.blocks.contains_key(block.parent_hash()) {
            return Err(EngineError::UnknownBlock(block.parent_hash().clone()))
        }
        info!("insert_block({})", block.hash());
        inner.blocks.insert(block.hash(), (block.clone(), state));
        Ok(())
    }

    fn accept_block(&self, hash: &Hash) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.blocks.contains_key(hash) {
            return Err(EngineError::UnknownBlock(hash.clone()))
        }
        info!("accept_block({})", hash);
        inner.accepted.insert(hash.clone());
        Ok(())
    }

    fn set_preference(&self, hash: &Hash) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.blocks.contains_key(hash) {
            return Err(EngineError::UnknownBlock(hash.clone()))
        }
        inner.preferred = hash.clone();
        Ok(())
    }

    fn pending_transactions(&self, max: usize) -> Vec<EthTx> {
        let mut inner = self.inner.lock();
        let n = max.min(inner.pending.len());
        inner.pending.drain(..n).collect()
    }
}

#[derive(Default)]
pub struct DummyDatabase {
    kvs: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl DummyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call fails with [DatabaseError::Closed].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release)
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed)
        }
        Ok(())
    }
}

impl Database for DummyDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.check()?;
        Ok(self.kvs.lock().get(key).cloned())
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.check()?;
        self.kvs.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
    fn delete(&self, key: &[u8]) -> Result<(), DatabaseError> {
        self.check()?;
        self.kvs.lock().remove(key);
        Ok(())
    }
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), DatabaseError> {
        self.check()?;
        let mut kvs = self.kvs.lock();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    kvs.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    kvs.remove(&k);
                }
            }
        }
        Ok(())
    }
}

/// `(writer, reader) => key => element`
type Partitions = HashMap<(Id, Id), BTreeMap<Vec<u8>, Element>>;

/// The store every chain's [DummySharedMemory] view points into.
#[derive(Clone, Default)]
pub struct DummyAtomicMemory {
    partitions: Arc<Mutex<Partitions>>,
}

impl DummyAtomicMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The view of chain `chain_id`.
    pub fn new_shared_memory(&self, chain_id: Id) -> Arc<DummySharedMemory> {
        Arc::new(DummySharedMemory {
            chain_id,
            partitions: self.partitions.clone(),
            unavailable: AtomicBool::new(false),
        })
    }
}

pub struct DummySharedMemory {
    chain_id: Id,
    partitions: Arc<Mutex<Partitions>>,
    unavailable: AtomicBool,
}

impl DummySharedMemory {
    /// Make reads fail, the way a lost connection to the host would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release)
    }

    fn check(&self) -> Result<(), SharedMemoryError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SharedMemoryError::Unavailable(
                "dummy shared memory switched off".into(),
            ))
        }
        Ok(())
    }
}

#[async_trait]
impl SharedMemory for DummySharedMemory {
    async fn get(
        &self, peer_chain: &Id, keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, SharedMemoryError> {
        self.check()?;
        let partitions = self.partitions.lock();
        let part = partitions.get(&(*peer_chain, self.chain_id));
        Ok(keys
            .iter()
            .map(|k| part.and_then(|p| p.get(k)).map(|e| e.value.clone()))
            .collect())
    }

    async fn indexed(
        &self, peer_chain: &Id, traits: &[Vec<u8>], limit: usize,
    ) -> Result<Vec<Vec<u8>>, SharedMemoryError> {
        self.check()?;
        let partitions = self.partitions.lock();
        let part = match partitions.get(&(*peer_chain, self.chain_id)) {
            Some(part) => part,
            None => return Ok(Vec::new()),
        };
        Ok(part
            .values()
            .filter(|e| e.traits.iter().any(|t| traits.contains(t)))
            .take(limit)
            .map(|e| e.value.clone())
            .collect())
    }

    async fn apply(
        &self, requests: HashMap<Id, Requests>, batch: Option<Batch>,
    ) -> Result<(), SharedMemoryError> {
        self.check()?;
        let mut partitions = self.partitions.lock();
        // the batch goes first so a failed write leaves shared memory untouched
        if let Some(batch) = batch {
            batch.write()?;
        }
        for (peer, req) in requests {
            info!(
                "apply(peer={}, put={}, remove={})",
                peer,
                req.put_requests.len(),
                req.remove_requests.len()
            );
            let inbound = partitions.entry((peer, self.chain_id)).or_default();
            for key in req.remove_requests {
                inbound.remove(&key);
            }
            let outbound = partitions.entry((self.chain_id, peer)).or_default();
            for elem in req.put_requests {
                outbound.insert(elem.key.clone(), elem);
            }
        }
        Ok(())
    }
}
