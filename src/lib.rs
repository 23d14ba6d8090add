//! # qcoreth: the atomic-transaction and block-acceptance core of an EVM chain VM
//!
//! The VM plugs into a leaderless consensus host that decides, block by block, what is accepted.
//! The embedded EVM engine runs ordinary transactions; this crate owns what surrounds it:
//!
//! - [atomic]: import and export transactions that move value between this chain and a sibling
//!   UTXO chain through shared memory, with their syntactic and semantic checks and their effects
//!   on the EVM state.
//! - [block]: the block lifecycle the host drives (`verify`, `accept`, `reject`).
//! - [conflict]: detection of shared-memory UTXOs consumed twice along one branch.
//! - [vm]: caches, the acceptance index, the atomic tx queues and block building.
//!
//! Everything outside is reached through a trait: [chain::EvmEngine] and [state::StateDB] for the
//! EVM, [shared_memory::SharedMemory] for the inter-chain mailbox, [db::Database] for local
//! persistence.
//!
//! # On the Commit Boundary
//! Accepting a block touches two stores: the local database (the acceptance index) and shared
//! memory (UTXOs put or removed). The acceptance writes are collected in a [db::Batch] that is
//! handed to [SharedMemory::apply](shared_memory::SharedMemory::apply), which commits both at
//! once:
//!
//! ```notrust
//!   Block::accept
//!        |
//!        | AcceptedIndex::accept_batch(height, id)
//!        v
//!     [Batch] --------.
//!                     v
//!   Tx::accept -> SharedMemory::apply(requests, Some(batch))   (one atomic step)
//!                     |
//!                     v
//!   status cache, last accepted, accepted inputs   (only after the commit succeeded)
//! ```
//!
//! A block without an atomic transaction writes its batch directly.

#[macro_use]
pub mod common;
pub mod atomic;
pub mod avax;
pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod context;
pub mod db;
pub mod mempool;
pub mod processor;
pub mod secp256k1fx;
pub mod shared_memory;
pub mod state;
pub mod vm;
