//! The EVM world state as seen by atomic transactions.
//!
//! The state itself belongs to the embedded EVM engine. Atomic transactions only move balances
//! (native and multi-coin) and bump nonces, so this interface is deliberately narrow. Writes are
//! unchecked: callers read the balance first and refuse to underflow.

use crate::common::{Addr, Hash, Id, U256};

pub trait StateDB: Send {
    /// Native balance of `account`, in EVM denomination.
    fn get_balance(&self, account: &Addr) -> U256;
    fn add_balance(&mut self, account: &Addr, amount: &U256);
    fn sub_balance(&mut self, account: &Addr, amount: &U256);
    /// Balance of the non-native asset `coin` held by `account`.
    fn get_balance_multi_coin(&self, account: &Addr, coin: &Id) -> U256;
    fn add_balance_multi_coin(&mut self, account: &Addr, coin: &Id, amount: &U256);
    fn sub_balance_multi_coin(&mut self, account: &Addr, coin: &Id, amount: &U256);
    fn get_nonce(&self, account: &Addr) -> u64;
    fn set_nonce(&mut self, account: &Addr, nonce: u64);
    /// Commitment to the current content of the state.
    fn root(&self) -> Hash;
    /// Create an independent copy that can be modified and dropped without touching `self`.
    fn snapshot(&self) -> Box<dyn StateDB>;
}
