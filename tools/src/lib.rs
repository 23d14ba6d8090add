pub mod dummy;
pub mod rocks;

use std::sync::mpsc;
use std::sync::Arc;

use qcoreth::common::{Addr, Id, U256};
use qcoreth::context::HostContext;
use qcoreth::secp256k1fx::PrivateKey;
use qcoreth::vm::{EngineMessage, Vm, VmError};

use dummy::{DummyAtomicMemory, DummyDatabase, DummyEngine, DummySharedMemory};

pub const NETWORK_ID: u32 = 12345;
pub const EVM_CHAIN_ID: u64 = 43112;

pub fn c_chain_id() -> Id {
    Id::new([0xcc; 32])
}

pub fn x_chain_id() -> Id {
    Id::new([0xaa; 32])
}

pub fn avax_asset_id() -> Id {
    Id::new([0x01; 32])
}

/// Deterministic key number `n`.
pub fn test_key(n: u8) -> PrivateKey {
    let mut bytes = [0x11; 32];
    bytes[31] = n;
    match PrivateKey::from_bytes(&bytes) {
        Ok(k) => k,
        Err(e) => panic!("invalid test key {}: {}", n, e),
    }
}

/// A VM on in-memory collaborators, with handles on all of them.
pub struct TestVm {
    pub vm: Vm,
    pub engine: Arc<DummyEngine>,
    pub db: Arc<DummyDatabase>,
    pub atomic_memory: DummyAtomicMemory,
    pub shared_memory: Arc<DummySharedMemory>,
    /// View of shared memory from the X-Chain side.
    pub x_shared_memory: Arc<DummySharedMemory>,
    pub messages: mpsc::Receiver<EngineMessage>,
}

impl TestVm {
    pub fn new(alloc: &[(Addr, U256)], config: &str) -> Result<Self, VmError> {
        let engine = Arc::new(DummyEngine::new(EVM_CHAIN_ID, alloc));
        Self::with_engine(engine, Arc::new(DummyDatabase::new()), config)
    }

    pub fn with_engine(
        engine: Arc<DummyEngine>, db: Arc<DummyDatabase>, config: &str,
    ) -> Result<Self, VmError> {
        let atomic_memory = DummyAtomicMemory::new();
        let shared_memory = atomic_memory.new_shared_memory(c_chain_id());
        let x_shared_memory = atomic_memory.new_shared_memory(x_chain_id());
        let ctx = Arc::new(HostContext::new(
            NETWORK_ID,
            c_chain_id(),
            x_chain_id(),
            avax_asset_id(),
            shared_memory.clone(),
        ));
        let (sender, messages) = mpsc::sync_channel(16);
        let vm = Vm::initialize(
            ctx,
            config.as_bytes(),
            engine.clone(),
            db.clone(),
            sender,
        )?;
        Ok(Self {
            vm,
            engine,
            db,
            atomic_memory,
            shared_memory,
            x_shared_memory,
            messages,
        })
    }
}
