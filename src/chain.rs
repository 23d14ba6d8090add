//! Embedded EVM chain: block envelope, ordinary transactions, and the engine interface.
//!
//! The envelope is the RLP encoding of [EthBlock]. An atomic transaction rides along in
//! `header.extra_data`, so a single byte string round-trips through the consensus host.

use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;
use thiserror::Error;

use crate::common::{
    u256_1, Addr, Bytes, Gas, Hash, NullableAddr, Wei, U256, U256RLP,
};
use crate::state::StateDB;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
    #[error("transaction {0} has an invalid signature")]
    InvalidSender(Hash),
    #[error("transaction {tx} has nonce {got}, expected {expected}")]
    NonceMismatch { tx: Hash, expected: u64, got: u64 },
    #[error("transaction {0} cannot pay for value and gas")]
    InsufficientBalance(Hash),
    #[error("transaction {0} is not supported by the engine")]
    Unsupported(Hash),
    #[error("engine failure: {0}")]
    Other(String),
}

#[derive(RlpDecodable, RlpEncodable, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: Hash,
    pub coinbase: Addr,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub number: u64,
    pub gas_limit: Gas,
    pub timestamp: u64,
    pub extra_data: Bytes,
}

impl Header {
    pub fn hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }
}

#[derive(RlpDecodable, RlpEncodable, Clone, Debug, PartialEq, Eq)]
pub struct EthBlock {
    pub header: Header,
    pub txs: Vec<EthTx>,
}

impl EthBlock {
    /// Seal a block: the transaction root is derived from `txs`.
    pub fn new(mut header: Header, txs: Vec<EthTx>) -> Self {
        header.tx_root = tx_root(&txs);
        Self { header, txs }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn parent_hash(&self) -> &Hash {
        &self.header.parent_hash
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.header.extra_data
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decode an envelope, checking that the body matches the header.
    pub fn decode(bytes: &[u8]) -> Result<Self, rlp::DecoderError> {
        let block: EthBlock = rlp::decode(bytes)?;
        if block.header.tx_root != tx_root(&block.txs) {
            return Err(rlp::DecoderError::Custom("transaction root mismatch"))
        }
        Ok(block)
    }
}

pub fn tx_root(txs: &[EthTx]) -> Hash {
    let mut stream = rlp::RlpStream::new_list(txs.len());
    for tx in txs {
        stream.append(tx);
    }
    Hash::hash(&stream.out())
}

/// An ordinary (legacy, EIP-155 protected) EVM transaction.
#[derive(RlpDecodable, RlpEncodable, Clone, Debug, PartialEq, Eq)]
pub struct EthTx {
    pub nonce: u64,
    pub gas_price: Wei,
    pub gas: Gas,
    pub to: NullableAddr,
    pub value: Wei,
    pub data: Bytes,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl EthTx {
    /// Build and sign a transaction. `sign_hash` must return `[r || s || recid]` over the given
    /// digest.
    pub fn signed(
        nonce: u64, gas_price: Wei, gas: Gas, to: Option<Addr>, value: Wei,
        data: Bytes, chain_id: u64,
        sign_hash: impl FnOnce(&[u8; 32]) -> [u8; 65],
    ) -> Self {
        let mut tx = Self {
            nonce,
            gas_price,
            gas,
            to: NullableAddr(to),
            value,
            data,
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        };
        let sig = sign_hash(&tx.sig_hash(&chain_id.into()).to_fixed_bytes());
        tx.r = U256RLP(U256::from_big_endian(&sig[..32]));
        tx.s = U256RLP(U256::from_big_endian(&sig[32..64]));
        tx.v = U256RLP(U256::from(sig[64] as u64 + 35 + chain_id * 2));
        tx
    }

    pub fn hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }

    pub fn to(&self) -> Option<&Addr> {
        self.to.0.as_ref()
    }

    fn sig_hash(&self, chain_id: &U256) -> Hash {
        let mut stream = rlp::RlpStream::new_list(9);
        stream
            .append(&self.nonce)
            .append(&self.gas_price)
            .append(&self.gas);
        match &self.to.0 {
            Some(addr) => stream.append(addr),
            None => stream.append_empty_data(),
        }
        .append(&self.value)
        .append(&self.data)
        .append(&U256RLP(*chain_id))
        .append(&0u64)
        .append(&0u64);
        Hash::hash(&stream.out())
    }

    /// Recover the sender, or `None` if the signature is invalid or bound to another chain.
    pub fn sender(&self, chain_id: &U256) -> Option<Addr> {
        let v = &self.v.0;
        if v.bits() > 64 {
            return None
        }
        let offset = chain_id
            .checked_mul(U256::from(2u64))?
            .checked_add(U256::from(35u64))?;
        let recid = v.checked_sub(offset)?;
        if recid > *u256_1() {
            return None
        }
        recover_plain(&self.sig_hash(chain_id), self.r.0, self.s.0, recid.low_u64())
    }
}

#[inline]
fn secp256k1_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| {
        U256::from_big_endian(&[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48,
            0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
        ])
    })
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| secp256k1_n() / 2)
}

fn recover_plain(hash: &Hash, r: U256, s: U256, v: u64) -> Option<Addr> {
    if &r < u256_1() || &s < u256_1() {
        return None
    }
    if &s > secp256k1_half_n() || &r >= secp256k1_n() {
        return None
    }
    let mut sig = [0u8; 64];
    r.to_big_endian(&mut sig[..32]);
    s.to_big_endian(&mut sig[32..]);
    let sig = libsecp256k1::Signature::parse_standard(&sig).ok()?;
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id)
        .ok()?
        .serialize();
    Some(Addr::from_slice(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}

/// The embedded EVM engine. It owns ordinary transaction execution and the EVM-level view of
/// blocks; the VM drives it from the decision thread.
pub trait EvmEngine: Send + Sync {
    fn chain_id(&self) -> U256;
    fn genesis(&self) -> EthBlock;
    fn get_block(&self, hash: &Hash) -> Option<EthBlock>;
    /// Post-state of an inserted block.
    fn block_state(&self, hash: &Hash) -> Result<Box<dyn StateDB>, EngineError>;
    /// Execute the ordinary transactions of a block on top of `state`.
    fn apply_transactions(
        &self, header: &Header, txs: &[EthTx], state: &mut dyn StateDB,
    ) -> Result<(), EngineError>;
    /// Record a verified, still undecided block together with its post-state.
    fn insert_block(
        &self, block: &EthBlock, state: Box<dyn StateDB>,
    ) -> Result<(), EngineError>;
    /// Finalize a previously inserted block.
    fn accept_block(&self, hash: &Hash) -> Result<(), EngineError>;
    fn set_preference(&self, hash: &Hash) -> Result<(), EngineError>;
    /// Take up to `max` pending ordinary transactions for a new block.
    fn pending_transactions(&self, max: usize) -> Vec<EthTx>;
}
