use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::Id;
use crate::shared_memory::SharedMemory;

/// What the consensus host tells the VM about where it runs.
pub struct HostContext {
    pub network_id: u32,
    /// Id of this chain.
    pub chain_id: Id,
    /// Id of the sibling UTXO chain.
    pub x_chain_id: Id,
    /// Id of the native asset.
    pub avax_asset_id: Id,
    pub shared_memory: Arc<dyn SharedMemory>,
    bootstrapped: AtomicBool,
}

impl HostContext {
    pub fn new(
        network_id: u32, chain_id: Id, x_chain_id: Id, avax_asset_id: Id,
        shared_memory: Arc<dyn SharedMemory>,
    ) -> Self {
        Self {
            network_id,
            chain_id,
            x_chain_id,
            avax_asset_id,
            shared_memory,
            bootstrapped: AtomicBool::new(false),
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    pub fn set_bootstrapped(&self, done: bool) {
        self.bootstrapped.store(done, Ordering::Release)
    }
}
