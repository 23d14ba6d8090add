//! The VM: the surface the consensus host drives, plus the hooks the block lifecycle calls back
//! into.
//!
//! The host serializes `parse_block`, `build_block`, `set_preference` and the decisions on
//! blocks; only the tx queues are touched concurrently (by [TxIntake](crate::mempool::TxIntake)
//! and `issue_tx`).

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use lru_time_cache::LruCache;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::atomic::{
    AtomicEnv, AtomicTxError, EvmInput, EvmOutput, ExportTx, ImportTx, Tx,
    UnsignedAtomicTx,
};
use crate::avax::{
    sort_transferable_inputs, sort_transferable_outputs, TransferableInput,
    TransferableOutput, Utxo,
};
use crate::block::{Block, BlockData, Status};
use crate::chain::{EngineError, EthBlock, EvmEngine, Header};
use crate::codec::{Codec, CodecError};
use crate::common::{checked_as_u64, Addr, Hash, Id, ShortId};
use crate::config::{ConfigError, VmConfig};
use crate::conflict::{Ancestor, AncestrySource, ConflictScanner};
use crate::context::HostContext;
use crate::db::{AcceptedIndex, Database, DatabaseError};
use crate::mempool::{AtomicMempool, MempoolError};
use crate::secp256k1fx::{OutputOwners, PrivateKey, TransferInput, TransferOutput};
use crate::shared_memory::SharedMemoryError;
use crate::state::StateDB;

/// Notifications for the consensus host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineMessage {
    /// There is something to build a block from.
    PendingTxs,
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("malformed block: {0}")]
    MalformedBlock(rlp::DecoderError),
    #[error("no transactions to build a block from")]
    EmptyBlock,
    #[error("block {0} is unknown")]
    UnknownBlock(Id),
    #[error("insufficient funds of asset {0}")]
    InsufficientFunds(Id),
    #[error(transparent)]
    Atomic(#[from] AtomicTxError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    SharedMemory(#[from] SharedMemoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
}

pub struct VmInner {
    ctx: Arc<HostContext>,
    config: VmConfig,
    engine: Arc<dyn EvmEngine>,
    accepted_index: AcceptedIndex,
    genesis_id: Id,
    block_cache: Mutex<LruCache<Id, BlockData>>,
    status_cache: Mutex<LruCache<Id, Status>>,
    conflicts: ConflictScanner,
    mempool: AtomicMempool,
    last_accepted: RwLock<BlockData>,
    preferred: RwLock<Id>,
    last_build_time: Mutex<u64>,
    notify: Mutex<SyncSender<EngineMessage>>,
}

/// Cheap handle to the VM.
#[derive(Clone)]
pub struct Vm(Arc<VmInner>);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Vm {
    /// Open the VM on top of `db`. An empty acceptance index is seeded with the genesis block of
    /// `engine`; otherwise the last accepted block is restored from it.
    pub fn initialize(
        ctx: Arc<HostContext>, config_bytes: &[u8], engine: Arc<dyn EvmEngine>,
        db: Arc<dyn Database>, notify: SyncSender<EngineMessage>,
    ) -> Result<Self, VmError> {
        let config = VmConfig::from_json(config_bytes)?;
        let accepted_index = AcceptedIndex::new(db);
        let genesis = BlockData::new(engine.genesis())?;
        let genesis_id = genesis.id;

        let last_accepted = match accepted_index.last_accepted()? {
            None => {
                accepted_index.accept_batch(0, &genesis_id).write()?;
                genesis.clone()
            }
            Some(id) => {
                let eth = engine
                    .get_block(&Hash::from(id))
                    .ok_or(VmError::UnknownBlock(id))?;
                BlockData::new(eth)?
            }
        };
        info!(
            "initialized VM: genesis {}, last accepted {} at height {}",
            genesis_id,
            last_accepted.id,
            last_accepted.height()
        );

        let mut status_cache = LruCache::with_capacity(config.status_cache_size);
        status_cache.insert(genesis_id, Status::Accepted);
        status_cache.insert(last_accepted.id, Status::Accepted);
        let mut block_cache = LruCache::with_capacity(config.block_cache_size);
        block_cache.insert(genesis_id, genesis);
        block_cache.insert(last_accepted.id, last_accepted.clone());

        Ok(Self(Arc::new(VmInner {
            conflicts: ConflictScanner::new(
                config.ancestor_input_cache_size,
                config.accepted_input_cache_size,
            ),
            mempool: AtomicMempool::new(
                config.issued_queue_capacity,
                config.reissue_queue_capacity,
            ),
            preferred: RwLock::new(last_accepted.id),
            last_accepted: RwLock::new(last_accepted),
            last_build_time: Mutex::new(0),
            block_cache: Mutex::new(block_cache),
            status_cache: Mutex::new(status_cache),
            ctx,
            config,
            engine,
            accepted_index,
            genesis_id,
            notify: Mutex::new(notify),
        })))
    }

    pub fn ctx(&self) -> &HostContext {
        &self.0.ctx
    }

    pub fn config(&self) -> &VmConfig {
        &self.0.config
    }

    pub fn engine(&self) -> &Arc<dyn EvmEngine> {
        &self.0.engine
    }

    pub fn genesis_id(&self) -> Id {
        self.0.genesis_id
    }

    pub fn mempool(&self) -> &AtomicMempool {
        &self.0.mempool
    }

    pub(crate) fn conflicts(&self) -> &ConflictScanner {
        &self.0.conflicts
    }

    pub(crate) fn accepted_index(&self) -> &AcceptedIndex {
        &self.0.accepted_index
    }

    pub fn atomic_env(&self) -> AtomicEnv<'_> {
        AtomicEnv {
            ctx: &self.0.ctx,
            tx_fee: self.0.config.tx_fee,
            x2c_rate: self.0.config.x2c_rate(),
            now: unix_now(),
        }
    }

    /// Id of the block accepted last.
    pub fn last_accepted(&self) -> Id {
        self.0.last_accepted.read().id
    }

    pub fn preferred(&self) -> Id {
        *self.0.preferred.read()
    }

    fn cache_block(&self, data: &BlockData) {
        self.0.block_cache.lock().insert(data.id, data.clone());
        let mut statuses = self.0.status_cache.lock();
        if statuses.get(&data.id).is_none() {
            statuses.insert(data.id, Status::Unknown);
        }
    }

    fn get_block_data(&self, id: &Id) -> Option<BlockData> {
        if let Some(data) = self.0.block_cache.lock().get(id) {
            return Some(data.clone())
        }
        let eth = self.0.engine.get_block(&Hash::from(*id))?;
        match BlockData::new(eth) {
            Ok(data) => {
                self.0.block_cache.lock().insert(*id, data.clone());
                Some(data)
            }
            Err(e) => {
                warn!("engine block {} carries a bad atomic tx: {}", id, e);
                None
            }
        }
    }

    /// Decode a block handed over by the host.
    pub fn parse_block(&self, bytes: &[u8]) -> Result<Block, VmError> {
        let eth = EthBlock::decode(bytes).map_err(VmError::MalformedBlock)?;
        let data = BlockData::new(eth)?;
        self.cache_block(&data);
        Ok(Block::new(data, self.clone()))
    }

    pub fn get_block(&self, id: &Id) -> Option<Block> {
        self.get_block_data(id)
            .map(|data| Block::new(data, self.clone()))
    }

    pub fn set_preference(&self, id: &Id) -> Result<(), VmError> {
        if self.get_block_data(id).is_none() {
            return Err(VmError::UnknownBlock(*id))
        }
        *self.0.preferred.write() = *id;
        self.0.engine.set_preference(&Hash::from(*id))?;
        Ok(())
    }

    /// Status of a block, reconstructed from the acceptance index when not cached. A block above
    /// the last accepted height is rejected when one of its ancestors lost its height.
    pub fn block_status(&self, data: &BlockData) -> Status {
        match self.0.status_cache.lock().get(&data.id) {
            Some(Status::Unknown) | None => (),
            Some(status) => return *status,
        }
        let mut cur = data.clone();
        let status = loop {
            match self.0.accepted_index.get(cur.height()) {
                Ok(Some(id)) if id == cur.id && cur.id == data.id => {
                    break Status::Accepted
                }
                Ok(Some(id)) if id == cur.id => return Status::Processing,
                Ok(Some(_)) => break Status::Rejected,
                Ok(None) => (),
                Err(e) => {
                    warn!("cannot read acceptance index: {}", e);
                    return Status::Processing
                }
            }
            if cur.id != data.id &&
                self.0.status_cache.lock().get(&cur.id) ==
                    Some(&Status::Rejected)
            {
                break Status::Rejected
            }
            match self.get_block_data(&cur.parent_id()) {
                Some(parent) => cur = parent,
                None => return Status::Processing,
            }
        };
        self.set_status(&data.id, status);
        status
    }

    pub(crate) fn set_status(&self, id: &Id, status: Status) {
        self.0.status_cache.lock().insert(*id, status);
    }

    /// Bookkeeping after a block's acceptance has been committed.
    pub(crate) fn on_accepted(&self, data: &BlockData) {
        self.set_status(&data.id, Status::Accepted);
        *self.0.last_accepted.write() = data.clone();
        if let Some(atx) = &data.atx {
            self.0.conflicts.record_accepted(&atx.input_utxos());
            self.0.mempool.remove(atx.id());
        }
    }

    pub(crate) fn reissue_tx(&self, tx: Arc<Tx>) -> Result<(), VmError> {
        let ctx = &self.0.ctx;
        tx.verify(ctx, self.0.config.tx_fee, &ctx.avax_asset_id)?;
        self.0.mempool.reissue(tx)?;
        self.notify_engine();
        Ok(())
    }

    fn notify_engine(&self) {
        match self.0.notify.lock().try_send(EngineMessage::PendingTxs) {
            Ok(()) | Err(TrySendError::Full(_)) => (),
            Err(TrySendError::Disconnected(_)) => {
                debug!("engine notification channel is closed")
            }
        }
    }

    /// Queue an atomic transaction for the next block.
    pub fn issue_tx(&self, tx: Tx) -> Result<(), VmError> {
        let ctx = &self.0.ctx;
        tx.verify(ctx, self.0.config.tx_fee, &ctx.avax_asset_id)?;
        self.0.mempool.issue(Arc::new(tx))?;
        self.notify_engine();
        Ok(())
    }

    /// Pick the atomic tx for a block built on `parent`, leaving `state` with its effect applied.
    /// Imports whose UTXOs stay unreadable after a rotation are kept for a later block.
    async fn pick_atomic_tx(
        &self, parent: &Id, state: &mut Box<dyn StateDB>,
    ) -> Option<Arc<Tx>> {
        let env = self.atomic_env();
        let mut deferred = Vec::new();
        let mut picked = None;
        // bounds the walk when every pending import gets rotated
        let mut budget = self.0.mempool.len() * 2;
        while budget > 0 {
            budget -= 1;
            let pending = match self.0.mempool.next() {
                Some(pending) => pending,
                None => break,
            };
            let tx = pending.tx.clone();
            if let Err(e) =
                self.0.conflicts.scan(self, parent, &tx.input_utxos())
            {
                debug!("dropping atomic tx {}: {}", tx.id(), e);
                continue
            }
            if let Err(e) = tx.semantic_verify(&env).await {
                let is_import =
                    matches!(tx.unsigned(), UnsignedAtomicTx::Import(_));
                if !e.is_temporary() || !is_import {
                    debug!("dropping atomic tx {}: {}", tx.id(), e);
                } else if pending.rotated {
                    debug!("deferring atomic tx {}: {}", tx.id(), e);
                    deferred.push(pending);
                } else {
                    debug!("rotating atomic tx {}: {}", tx.id(), e);
                    self.0.mempool.rotate(tx);
                }
                continue
            }
            let mut trial = state.snapshot();
            if let Err(e) = tx.evm_state_transfer(&env, trial.as_mut()) {
                debug!("dropping atomic tx {}: {}", tx.id(), e);
                continue
            }
            *state = trial;
            picked = Some(tx);
            break
        }
        for pending in deferred.into_iter().rev() {
            self.0.mempool.restore(pending, false);
        }
        picked
    }

    /// Build a block on top of the preferred block.
    pub async fn build_block(&self) -> Result<Block, VmError> {
        let parent_id = self.preferred();
        let parent = self
            .get_block_data(&parent_id)
            .ok_or(VmError::UnknownBlock(parent_id))?;
        let parent_eth = &parent.eth_block;

        let mut state = self.0.engine.block_state(&parent_eth.hash())?;
        let timestamp = {
            let mut last = self.0.last_build_time.lock();
            let t = unix_now()
                .max(parent_eth.header.timestamp + 1)
                .max(*last + 1);
            *last = t;
            t
        };
        let mut header = Header {
            parent_hash: parent_eth.hash(),
            coinbase: Addr::zero().clone(),
            state_root: Hash::zero().clone(),
            tx_root: Hash::zero().clone(),
            number: parent_eth.number() + 1,
            gas_limit: self.0.config.block_gas_limit,
            timestamp,
            extra_data: Vec::new().into(),
        };

        let txs = self
            .0
            .engine
            .pending_transactions(self.0.config.max_block_txs);
        self.0
            .engine
            .apply_transactions(&header, &txs, state.as_mut())?;
        let atx = self.pick_atomic_tx(&parent_id, &mut state).await;
        if txs.is_empty() && atx.is_none() {
            return Err(VmError::EmptyBlock)
        }
        if let Some(atx) = &atx {
            header.extra_data = atx.bytes().to_vec().into();
        }
        header.state_root = state.root();

        let eth_block = Arc::new(EthBlock::new(header, txs));
        let data = BlockData {
            id: Id::from(&eth_block.hash()),
            eth_block,
            atx,
        };
        info!("built block {} at height {}", data.id, data.height());
        self.cache_block(&data);
        Ok(Block::new(data, self.clone()))
    }

    /// UTXOs in `chain`'s partition owned by any of `addrs`.
    pub async fn get_atomic_utxos(
        &self, chain: &Id, addrs: &[ShortId], limit: usize,
    ) -> Result<Vec<Utxo>, VmError> {
        let traits: Vec<Vec<u8>> =
            addrs.iter().map(|a| a.as_bytes().to_vec()).collect();
        let values = self
            .0
            .ctx
            .shared_memory
            .indexed(chain, &traits, limit)
            .await?;
        let mut utxos = Vec::with_capacity(values.len());
        for v in values {
            utxos.push(Codec::unmarshal::<Utxo>(&v)?);
        }
        Ok(utxos)
    }

    /// Export `amount` of `asset_id` to `to` on `chain`, paying from the EVM accounts of
    /// `keys` as seen by the preferred block.
    pub fn new_export_tx(
        &self, asset_id: Id, amount: u64, chain: Id, to: ShortId,
        keys: &[PrivateKey],
    ) -> Result<Tx, VmError> {
        let ctx = &self.0.ctx;
        if chain != ctx.x_chain_id {
            return Err(AtomicTxError::WrongChainId.into())
        }
        let fee = self.0.config.tx_fee;
        let mut to_burn = BTreeMap::new();
        if asset_id == ctx.avax_asset_id {
            let total =
                amount.checked_add(fee).ok_or(AtomicTxError::OverflowExport)?;
            to_burn.insert(asset_id, total);
        } else {
            to_burn.insert(asset_id, amount);
            to_burn.insert(ctx.avax_asset_id, fee);
        }

        let state = self.0.engine.block_state(&Hash::from(self.preferred()))?;
        let env = self.atomic_env();
        let mut nonces: HashMap<Addr, u64> = HashMap::new();
        let mut ins = Vec::new();
        let mut signers = Vec::new();
        for (asset, mut remaining) in to_burn {
            for key in keys {
                if remaining == 0 {
                    break
                }
                let addr = key.public_key().eth_address();
                let balance = if asset == ctx.avax_asset_id {
                    state.get_balance(&addr)
                } else {
                    state.get_balance_multi_coin(&addr, &asset)
                };
                let spendable = checked_as_u64(&(balance / env.x2c_rate))
                    .unwrap_or(u64::MAX);
                let amt = spendable.min(remaining);
                if amt == 0 {
                    continue
                }
                let nonce = nonces
                    .entry(addr.clone())
                    .or_insert_with(|| state.get_nonce(&addr));
                ins.push(EvmInput {
                    address: addr.clone(),
                    amount: amt,
                    asset_id: asset,
                    nonce: *nonce,
                });
                *nonce += 1;
                signers.push(vec![key.clone()]);
                remaining -= amt;
            }
            if remaining > 0 {
                return Err(VmError::InsufficientFunds(asset))
            }
        }

        let mut outs = vec![TransferableOutput {
            asset_id,
            out: TransferOutput {
                amt: amount,
                owners: OutputOwners::new(0, 1, vec![to]),
            },
        }];
        sort_transferable_outputs(&mut outs);
        let unsigned = UnsignedAtomicTx::Export(ExportTx::new(
            ctx.network_id,
            ctx.chain_id,
            chain,
            ins,
            outs,
        ));
        let tx = Tx::sign(unsigned, &signers);
        tx.verify(ctx, fee, &ctx.avax_asset_id)?;
        Ok(tx)
    }

    /// Import every UTXO on `chain` spendable by `keys`, crediting `to`.
    pub async fn new_import_tx(
        &self, chain: Id, to: Addr, keys: &[PrivateKey],
    ) -> Result<Tx, VmError> {
        let ctx = &self.0.ctx;
        if chain != ctx.x_chain_id {
            return Err(AtomicTxError::WrongChainId.into())
        }
        let addrs: Vec<ShortId> =
            keys.iter().map(|k| k.public_key().address()).collect();
        let utxos = self
            .get_atomic_utxos(&chain, &addrs, self.0.config.max_block_txs)
            .await?;

        let now = unix_now();
        let mut imported: BTreeMap<Id, u64> = BTreeMap::new();
        let mut spends = Vec::new();
        for utxo in utxos {
            let owners = &utxo.out.owners;
            if owners.locktime > now {
                continue
            }
            let mut sig_indices = Vec::new();
            let mut signers = Vec::new();
            for (i, addr) in owners.addrs.iter().enumerate() {
                if sig_indices.len() == owners.threshold as usize {
                    break
                }
                if let Some(pos) = addrs.iter().position(|a| a == addr) {
                    sig_indices.push(i as u32);
                    signers.push(keys[pos].clone());
                }
            }
            if sig_indices.len() < owners.threshold as usize {
                continue
            }
            let total = imported.entry(utxo.asset_id).or_insert(0);
            *total = total
                .checked_add(utxo.out.amt)
                .ok_or(AtomicTxError::Overflow)?;
            spends.push((
                TransferableInput {
                    utxo_id: utxo.utxo_id,
                    asset_id: utxo.asset_id,
                    input: TransferInput {
                        amt: utxo.out.amt,
                        sig_indices,
                    },
                },
                signers,
            ));
        }
        if spends.is_empty() {
            return Err(AtomicTxError::NoImportInputs.into())
        }

        let fee = self.0.config.tx_fee;
        if fee > 0 && !imported.contains_key(&ctx.avax_asset_id) {
            return Err(VmError::InsufficientFunds(ctx.avax_asset_id))
        }
        let mut outs = Vec::new();
        for (asset, amount) in imported {
            let amount = if asset == ctx.avax_asset_id {
                amount
                    .checked_sub(fee)
                    .ok_or(VmError::InsufficientFunds(asset))?
            } else {
                amount
            };
            if amount > 0 {
                outs.push(EvmOutput {
                    address: to.clone(),
                    amount,
                    asset_id: asset,
                });
            }
        }
        sort_transferable_inputs(&mut spends);
        let (ins, signers): (Vec<_>, Vec<_>) = spends.into_iter().unzip();
        let unsigned = UnsignedAtomicTx::Import(ImportTx::new(
            ctx.network_id,
            ctx.chain_id,
            chain,
            ins,
            outs,
        ));
        let tx = Tx::sign(unsigned, &signers);
        tx.verify(ctx, fee, &ctx.avax_asset_id)?;
        Ok(tx)
    }
}

impl AncestrySource for Vm {
    fn ancestor(&self, id: &Id) -> Option<Ancestor> {
        let data = self.get_block_data(id)?;
        let decided = data.id == self.0.genesis_id ||
            self.block_status(&data) == Status::Accepted;
        Some(Ancestor {
            id: data.id,
            parent: data.parent_id(),
            decided,
            inputs: data.input_utxos(),
        })
    }
}
