//! The inter-chain mailbox.
//!
//! Each chain owns a view of shared memory. `get`, `indexed` and `remove` address the partition
//! written by `peer_chain` for this chain; `put` writes into this chain's partition for
//! `peer_chain`. All operations may suspend: the store lives behind the consensus host.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::Id;
use crate::db::{Batch, DatabaseError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedMemoryError {
    #[error("shared memory unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Addresses that index this element, see [SharedMemory::indexed].
    pub traits: Vec<Vec<u8>>,
}

/// Writes destined to one peer chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requests {
    pub remove_requests: Vec<Vec<u8>>,
    pub put_requests: Vec<Element>,
}

#[async_trait]
pub trait SharedMemory: Send + Sync {
    /// Values under `keys` written by `peer_chain`. A missing key yields `None`.
    async fn get(
        &self, peer_chain: &Id, keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, SharedMemoryError>;

    /// Up to `limit` values written by `peer_chain` indexed by any of `traits`, ordered by key.
    async fn indexed(
        &self, peer_chain: &Id, traits: &[Vec<u8>], limit: usize,
    ) -> Result<Vec<Vec<u8>>, SharedMemoryError>;

    /// Apply every request and, when present, `batch` atomically.
    async fn apply(
        &self, requests: HashMap<Id, Requests>, batch: Option<Batch>,
    ) -> Result<(), SharedMemoryError>;

    async fn put(
        &self, peer_chain: &Id, elems: Vec<Element>,
    ) -> Result<(), SharedMemoryError> {
        let mut requests = HashMap::new();
        requests.insert(
            *peer_chain,
            Requests {
                put_requests: elems,
                ..Default::default()
            },
        );
        self.apply(requests, None).await
    }

    async fn remove(
        &self, peer_chain: &Id, keys: Vec<Vec<u8>>,
    ) -> Result<(), SharedMemoryError> {
        let mut requests = HashMap::new();
        requests.insert(
            *peer_chain,
            Requests {
                remove_requests: keys,
                ..Default::default()
            },
        );
        self.apply(requests, None).await
    }
}
