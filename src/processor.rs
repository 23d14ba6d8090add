//! The state transition of one block: the ordinary EVM transactions run first, then the atomic
//! transaction it carries (if any) moves its cross-chain value.

use thiserror::Error;

use crate::atomic::{AtomicEnv, AtomicTxError, Tx};
use crate::chain::{EngineError, EvmEngine, Header, EthTx};
use crate::common::Hash;
use crate::state::StateDB;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Atomic(#[from] AtomicTxError),
    #[error("state root mismatch: header has {expected}, execution gives {got}")]
    StateRootMismatch { expected: Hash, got: Hash },
}

/// Run the block on top of `state` and return the resulting state root.
pub fn execute(
    engine: &dyn EvmEngine, env: &AtomicEnv<'_>, header: &Header, txs: &[EthTx],
    atx: Option<&Tx>, state: &mut dyn StateDB,
) -> Result<Hash, ProcessError> {
    engine.apply_transactions(header, txs, state)?;
    if let Some(atx) = atx {
        atx.evm_state_transfer(env, state)?;
    }
    Ok(state.root())
}

/// Run the block and check the outcome against its declared state root.
pub fn process(
    engine: &dyn EvmEngine, env: &AtomicEnv<'_>, header: &Header, txs: &[EthTx],
    atx: Option<&Tx>, state: &mut dyn StateDB,
) -> Result<(), ProcessError> {
    let root = execute(engine, env, header, txs, atx, state)?;
    if root != header.state_root {
        return Err(ProcessError::StateRootMismatch {
            expected: header.state_root.clone(),
            got: root,
        })
    }
    Ok(())
}
