//! Atomic transactions: value moving between this chain and the sibling UTXO chain through
//! shared memory.
//!
//! Both variants share one capability set:
//!
//! - `verify`: syntactic checks against the host context, cached once passed;
//! - `input_utxos`: the shared-memory UTXOs the transaction consumes;
//! - `semantic_verify`: checks against the current ledger (signatures, asset flow, UTXO
//!   existence), split into permanent and temporary failures;
//! - `evm_state_transfer`: the EVM-side effect, applied after the ordinary transactions of the
//!   carrying block;
//! - `accept`: the shared-memory side effect, committed together with the acceptance index.
//!
//! [UnsignedAtomicTx] is the tagged sum over the two variants; [Tx] adds the credentials.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::avax::FlowError;
use crate::codec::{type_id, Codec, CodecError, Packable, Packer, Unpacker};
use crate::common::{Addr, Id, IdSet, U256};
use crate::context::HostContext;
use crate::db::Batch;
use crate::secp256k1fx::{Credential, FxError, PrivateKey};
use crate::shared_memory::{Requests, SharedMemoryError};
use crate::state::StateDB;

mod export_tx;
mod import_tx;

pub use export_tx::ExportTx;
pub use import_tx::ImportTx;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtomicTxError {
    #[error("nil transaction")]
    NilTx,
    #[error("wrong chain id")]
    WrongChainId,
    #[error("wrong network id")]
    WrongNetworkId,
    #[error("wrong blockchain id")]
    WrongBlockchainId,
    #[error("no export outputs")]
    NoExportOutputs,
    #[error("no import inputs")]
    NoImportInputs,
    #[error("outputs not sorted")]
    OutputsNotSorted,
    #[error("inputs not sorted and unique")]
    InputsNotSortedUnique,
    #[error("unknown atomic tx type {0}")]
    UnknownAtomicTxType(u32),
    #[error("public key does not match the signed input address")]
    PublicKeySignatureMismatch,
    #[error("insufficient funds of asset {asset} at {address}")]
    InsufficientFunds { address: Addr, asset: Id },
    #[error("invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: Addr,
        expected: u64,
        got: u64,
    },
    #[error("overflow while computing the export amount")]
    OverflowExport,
    #[error("amount overflows when scaled across chains")]
    Overflow,
    #[error("asset id of the input does not match the UTXO")]
    AssetIdMismatch,
    #[error("UTXO {0} is not in shared memory")]
    MissingUtxo(Id),
    #[error("expected {expected} credentials, got {got}")]
    CredentialCountMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Fx(#[from] FxError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Outcome of semantic verification. Permanent failures make the transaction (and any block
/// carrying it) invalid for good; temporary ones may pass on retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error(transparent)]
    Permanent(#[from] AtomicTxError),
    #[error("shared memory read failed: {0}")]
    SharedMemory(#[from] SharedMemoryError),
    #[error("UTXO {key} in shared memory does not decode: {err}")]
    CorruptUtxo { key: Id, err: CodecError },
}

impl TxError {
    pub fn is_temporary(&self) -> bool {
        !matches!(self, TxError::Permanent(_))
    }
}

/// Remembers a successful syntactic verification. Ignored by equality.
#[derive(Clone, Debug, Default)]
pub(crate) struct VerifiedOnce(OnceCell<()>);

impl VerifiedOnce {
    pub(crate) fn check<E>(
        &self, f: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        self.0.get_or_try_init(f).map(|_| ())
    }
}

impl PartialEq for VerifiedOnce {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for VerifiedOnce {}

/// Parameters atomic transactions are checked and applied against.
pub struct AtomicEnv<'a> {
    pub ctx: &'a HostContext,
    pub tx_fee: u64,
    pub x2c_rate: U256,
    /// Wall-clock time (unix seconds) for locktime checks.
    pub now: u64,
}

impl<'a> AtomicEnv<'a> {
    /// `amount * x2c_rate`, the EVM-side value of a UTXO-side amount.
    pub fn to_evm_amount(&self, amount: u64) -> Result<U256, AtomicTxError> {
        U256::from(amount)
            .checked_mul(self.x2c_rate)
            .ok_or(AtomicTxError::Overflow)
    }
}

/// Debits an EVM balance when exporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmInput {
    pub address: Addr,
    pub amount: u64,
    pub asset_id: Id,
    pub nonce: u64,
}

impl Packable for EvmInput {
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(self.address.as_bytes());
        p.pack_u64(self.amount);
        self.asset_id.pack(p);
        p.pack_u64(self.nonce);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            address: u.unpack_fixed::<20>()?.into(),
            amount: u.unpack_u64()?,
            asset_id: Id::unpack(u)?,
            nonce: u.unpack_u64()?,
        })
    }
}

/// Credits an EVM balance when importing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmOutput {
    pub address: Addr,
    pub amount: u64,
    pub asset_id: Id,
}

impl Packable for EvmOutput {
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(self.address.as_bytes());
        p.pack_u64(self.amount);
        self.asset_id.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            address: u.unpack_fixed::<20>()?.into(),
            amount: u.unpack_u64()?,
            asset_id: Id::unpack(u)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnsignedAtomicTx {
    Import(ImportTx),
    Export(ExportTx),
}

impl UnsignedAtomicTx {
    pub fn type_id(&self) -> u32 {
        match self {
            Self::Import(_) => type_id::IMPORT_TX,
            Self::Export(_) => type_id::EXPORT_TX,
        }
    }

    pub fn verify(
        &self, ctx: &HostContext, fee_amount: u64, fee_asset_id: &Id,
    ) -> Result<(), AtomicTxError> {
        match self {
            Self::Import(tx) => {
                tx.verify(&ctx.x_chain_id, ctx, fee_amount, fee_asset_id)
            }
            Self::Export(tx) => {
                tx.verify(&ctx.x_chain_id, ctx, fee_amount, fee_asset_id)
            }
        }
    }

    pub fn input_utxos(&self) -> IdSet {
        match self {
            Self::Import(tx) => tx.input_utxos(),
            Self::Export(tx) => tx.input_utxos(),
        }
    }

    pub fn evm_state_transfer(
        &self, env: &AtomicEnv<'_>, state: &mut dyn StateDB,
    ) -> Result<(), AtomicTxError> {
        match self {
            Self::Import(tx) => tx.evm_state_transfer(env, state),
            Self::Export(tx) => tx.evm_state_transfer(env, state),
        }
    }
}

impl Packable for UnsignedAtomicTx {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(self.type_id());
        match self {
            Self::Import(tx) => tx.pack(p),
            Self::Export(tx) => tx.pack(p),
        }
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        match u.unpack_u32()? {
            type_id::IMPORT_TX => Ok(Self::Import(ImportTx::unpack(u)?)),
            type_id::EXPORT_TX => Ok(Self::Export(ExportTx::unpack(u)?)),
            t => Err(CodecError::UnknownTypeId(t)),
        }
    }
}

/// A signed atomic transaction: the unsigned body plus one credential per input.
#[derive(Clone, Debug)]
pub struct Tx {
    unsigned: UnsignedAtomicTx,
    creds: Vec<Credential>,
    id: Id,
    unsigned_bytes: Vec<u8>,
    bytes: Vec<u8>,
}

struct SignedFields<'a>(&'a UnsignedAtomicTx, &'a [Credential]);

impl<'a> SignedFields<'a> {
    fn marshal(&self) -> Vec<u8> {
        let mut p = Packer::new();
        p.pack_u16(crate::codec::CODEC_VERSION);
        self.0.pack(&mut p);
        p.pack_slice(self.1);
        p.into_bytes()
    }
}

impl Tx {
    /// Sign `unsigned`: the i-th credential holds one signature from each key in `signers[i]`.
    pub fn sign(unsigned: UnsignedAtomicTx, signers: &[Vec<PrivateKey>]) -> Self {
        let unsigned_bytes = Codec::marshal(&unsigned);
        let creds = signers
            .iter()
            .map(|keys| Credential {
                sigs: keys.iter().map(|k| k.sign(&unsigned_bytes)).collect(),
            })
            .collect();
        Self::with_credentials(unsigned, creds)
    }

    pub fn with_credentials(
        unsigned: UnsignedAtomicTx, creds: Vec<Credential>,
    ) -> Self {
        let unsigned_bytes = Codec::marshal(&unsigned);
        let bytes = SignedFields(&unsigned, &creds).marshal();
        Self {
            id: Id::compute(&bytes),
            unsigned,
            creds,
            unsigned_bytes,
            bytes,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AtomicTxError> {
        if bytes.is_empty() {
            return Err(AtomicTxError::NilTx)
        }
        let mut u = Unpacker::new(bytes);
        let version = u.unpack_u16()?;
        if version != crate::codec::CODEC_VERSION {
            return Err(CodecError::UnknownVersion(version).into())
        }
        let unsigned = match UnsignedAtomicTx::unpack(&mut u) {
            Ok(unsigned) => unsigned,
            Err(CodecError::UnknownTypeId(t)) => {
                return Err(AtomicTxError::UnknownAtomicTxType(t))
            }
            Err(e) => return Err(e.into()),
        };
        let creds: Vec<Credential> = u.unpack_slice()?;
        if u.remaining() != 0 {
            return Err(CodecError::TrailingBytes(u.remaining()).into())
        }
        Ok(Self::with_credentials(unsigned, creds))
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn unsigned(&self) -> &UnsignedAtomicTx {
        &self.unsigned
    }

    pub fn creds(&self) -> &[Credential] {
        &self.creds
    }

    /// The bytes signatures commit to.
    pub fn unsigned_bytes(&self) -> &[u8] {
        &self.unsigned_bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn input_utxos(&self) -> IdSet {
        self.unsigned.input_utxos()
    }

    pub fn verify(
        &self, ctx: &HostContext, fee_amount: u64, fee_asset_id: &Id,
    ) -> Result<(), AtomicTxError> {
        self.unsigned.verify(ctx, fee_amount, fee_asset_id)
    }

    pub async fn semantic_verify(
        &self, env: &AtomicEnv<'_>,
    ) -> Result<(), TxError> {
        match &self.unsigned {
            UnsignedAtomicTx::Import(tx) => tx.semantic_verify(env, self).await,
            UnsignedAtomicTx::Export(tx) => tx.semantic_verify(env, self),
        }
    }

    pub fn evm_state_transfer(
        &self, env: &AtomicEnv<'_>, state: &mut dyn StateDB,
    ) -> Result<(), AtomicTxError> {
        self.unsigned.evm_state_transfer(env, state)
    }

    /// Commit the shared-memory effect together with `batch`.
    pub async fn accept(
        &self, ctx: &HostContext, batch: Batch,
    ) -> Result<(), SharedMemoryError> {
        let (chain, requests) = match &self.unsigned {
            UnsignedAtomicTx::Import(tx) => tx.atomic_requests(),
            UnsignedAtomicTx::Export(tx) => tx.atomic_requests(&self.id),
        };
        let mut all: HashMap<Id, Requests> = HashMap::new();
        all.insert(chain, requests);
        ctx.shared_memory.apply(all, Some(batch)).await
    }
}

impl PartialEq for Tx {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tx {}
