//! Blocks as seen by the consensus host, and their lifecycle.
//!
//! ```notrust
//!   Unknown --(parse/build)--> Processing --(accept)--> Accepted
//!                                   \
//!                                    `---(reject)--> Rejected
//! ```
//!
//! A block never owns its parent: [SnowmanBlock::parent] looks the parent up by id through the
//! VM and yields a [MissingBlock] when it is not known.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace};
use thiserror::Error;

use crate::atomic::{Tx, TxError, UnsignedAtomicTx};
use crate::chain::{EngineError, EthBlock};
use crate::common::{Hash, Id, IdSet, Wei};
use crate::conflict::ConflictError;
use crate::db::DatabaseError;
use crate::processor::{self, ProcessError};
use crate::shared_memory::SharedMemoryError;
use crate::vm::Vm;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Unknown,
    Processing,
    Accepted,
    Rejected,
}

impl Status {
    pub fn decided(&self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("transaction {tx} pays gas price {price}, below the minimum")]
    InsufficientGasPrice { tx: Hash, price: Wei },
    #[error("atomic input {0} conflicts with an ancestor")]
    AtomicInputConflict(Id),
    #[error("ancestor {0} is unknown")]
    UnknownAncestor(Id),
    #[error("cannot load the post-state of parent {parent}: {err}")]
    ParentState { parent: Id, err: EngineError },
    #[error(transparent)]
    AtomicTx(#[from] TxError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    SharedMemory(#[from] SharedMemoryError),
    #[error("parent {parent} is not the last accepted block {last_accepted}")]
    ParentNotLastAccepted { parent: Id, last_accepted: Id },
    #[error("block {id} is already {status:?}")]
    AlreadyDecided { id: Id, status: Status },
    #[error("block {0} is unknown")]
    UnknownBlock(Id),
}

impl BlockError {
    /// Whether retrying the same call may succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            BlockError::AtomicTx(e) => e.is_temporary(),
            BlockError::Database(_) | BlockError::SharedMemory(_) => true,
            _ => false,
        }
    }
}

impl From<ConflictError> for BlockError {
    fn from(e: ConflictError) -> Self {
        match e {
            ConflictError::AtomicInputConflict(id) => {
                BlockError::AtomicInputConflict(id)
            }
            ConflictError::UnknownAncestor(id) => BlockError::UnknownAncestor(id),
        }
    }
}

/// The decoded content of a block, shared between the block cache and [Block] handles.
#[derive(Clone, Debug)]
pub struct BlockData {
    pub id: Id,
    pub eth_block: Arc<EthBlock>,
    pub atx: Option<Arc<Tx>>,
}

impl BlockData {
    /// The atomic tx rides in the extra data; garbage there makes the whole block invalid.
    pub fn new(eth_block: EthBlock) -> Result<Self, crate::atomic::AtomicTxError> {
        let atx = match eth_block.extra_data() {
            [] => None,
            extra => Some(Arc::new(Tx::from_bytes(extra)?)),
        };
        Ok(Self {
            id: Id::from(&eth_block.hash()),
            eth_block: Arc::new(eth_block),
            atx,
        })
    }

    pub fn height(&self) -> u64 {
        self.eth_block.number()
    }

    pub fn parent_id(&self) -> Id {
        Id::from(self.eth_block.parent_hash())
    }

    pub fn input_utxos(&self) -> IdSet {
        self.atx.as_ref().map(|tx| tx.input_utxos()).unwrap_or_default()
    }
}

/// The decision-oracle contract a block fulfils towards the consensus host.
#[async_trait]
pub trait SnowmanBlock: Send + Sync {
    fn id(&self) -> Id;
    fn parent(&self) -> Box<dyn SnowmanBlock>;
    fn height(&self) -> u64;
    fn status(&self) -> Status;
    fn bytes(&self) -> Vec<u8>;
    async fn verify(&self) -> Result<(), BlockError>;
    async fn accept(&self) -> Result<(), BlockError>;
    async fn reject(&self) -> Result<(), BlockError>;
}

/// Stands in for a parent the VM does not know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingBlock {
    pub id: Id,
}

#[async_trait]
impl SnowmanBlock for MissingBlock {
    fn id(&self) -> Id {
        self.id
    }

    fn parent(&self) -> Box<dyn SnowmanBlock> {
        Box::new(MissingBlock { id: Id::default() })
    }

    fn height(&self) -> u64 {
        0
    }

    fn status(&self) -> Status {
        Status::Unknown
    }

    fn bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn verify(&self) -> Result<(), BlockError> {
        Err(BlockError::UnknownBlock(self.id))
    }

    async fn accept(&self) -> Result<(), BlockError> {
        Err(BlockError::UnknownBlock(self.id))
    }

    async fn reject(&self) -> Result<(), BlockError> {
        Err(BlockError::UnknownBlock(self.id))
    }
}

#[derive(Clone)]
pub struct Block {
    data: BlockData,
    vm: Vm,
}

impl Block {
    pub(crate) fn new(data: BlockData, vm: Vm) -> Self {
        Self { data, vm }
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn eth_block(&self) -> &EthBlock {
        &self.data.eth_block
    }

    pub fn atomic_tx(&self) -> Option<&Arc<Tx>> {
        self.data.atx.as_ref()
    }

    pub fn parent_id(&self) -> Id {
        self.data.parent_id()
    }

    fn check_gas_prices(&self) -> Result<(), BlockError> {
        let min = Wei::from(self.vm.config().min_gas_price);
        for tx in &self.data.eth_block.txs {
            if tx.gas_price < min {
                return Err(BlockError::InsufficientGasPrice {
                    tx: tx.hash(),
                    price: tx.gas_price.clone(),
                })
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnowmanBlock for Block {
    fn id(&self) -> Id {
        self.data.id
    }

    fn parent(&self) -> Box<dyn SnowmanBlock> {
        let parent = self.data.parent_id();
        match self.vm.get_block(&parent) {
            Some(b) => Box::new(b),
            None => Box::new(MissingBlock { id: parent }),
        }
    }

    fn height(&self) -> u64 {
        self.data.height()
    }

    fn status(&self) -> Status {
        self.vm.block_status(&self.data)
    }

    fn bytes(&self) -> Vec<u8> {
        self.data.eth_block.encode()
    }

    async fn verify(&self) -> Result<(), BlockError> {
        let vm = &self.vm;
        let ctx = vm.ctx();
        if ctx.is_bootstrapped() {
            self.check_gas_prices()?;
        }

        let parent = self.data.parent_id();
        let mut state = vm
            .engine()
            .block_state(self.data.eth_block.parent_hash())
            .map_err(|err| BlockError::ParentState { parent, err })?;

        let env = vm.atomic_env();
        if let Some(atx) = &self.data.atx {
            match atx.unsigned() {
                UnsignedAtomicTx::Import(_) => {
                    if self.data.id != vm.genesis_id() {
                        vm.conflicts().scan(vm, &parent, &atx.input_utxos())?;
                    }
                }
                UnsignedAtomicTx::Export(_) => (),
            }
            atx.semantic_verify(&env).await?;
        }

        let eth = &self.data.eth_block;
        processor::process(
            vm.engine().as_ref(),
            &env,
            &eth.header,
            &eth.txs,
            self.data.atx.as_deref(),
            state.as_mut(),
        )?;
        vm.engine().insert_block(eth, state)?;
        Ok(())
    }

    async fn accept(&self) -> Result<(), BlockError> {
        let vm = &self.vm;
        let status = self.status();
        if status.decided() {
            return Err(BlockError::AlreadyDecided {
                id: self.data.id,
                status,
            })
        }
        let last_accepted = vm.last_accepted();
        if self.data.parent_id() != last_accepted {
            return Err(BlockError::ParentNotLastAccepted {
                parent: self.data.parent_id(),
                last_accepted,
            })
        }
        trace!("accepting block {} at height {}", self.data.id, self.height());

        let batch = vm.accepted_index().accept_batch(self.height(), &self.data.id);
        match &self.data.atx {
            Some(atx) => atx.accept(vm.ctx(), batch).await?,
            None => batch.write()?,
        }
        // committed, so the VM moves on even if the engine fails to follow
        vm.on_accepted(&self.data);
        vm.engine().accept_block(&self.data.eth_block.hash())?;
        Ok(())
    }

    /// A block may already read as rejected once a sibling is accepted; its atomic tx is
    /// re-issued all the same.
    async fn reject(&self) -> Result<(), BlockError> {
        let vm = &self.vm;
        if self.status() == Status::Accepted {
            return Err(BlockError::AlreadyDecided {
                id: self.data.id,
                status: Status::Accepted,
            })
        }
        trace!("rejecting block {} at height {}", self.data.id, self.height());
        vm.set_status(&self.data.id, Status::Rejected);
        if let Some(atx) = &self.data.atx {
            if let Err(e) = vm.reissue_tx(atx.clone()) {
                debug!("failed to re-issue atomic tx {}: {}", atx.id(), e);
            }
        }
        Ok(())
    }
}
