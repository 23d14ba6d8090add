//! UTXO-side value objects and the flow checker.

use std::collections::HashMap;

use thiserror::Error;

use crate::codec::{self, CodecError, Packable, Packer, Unpacker};
use crate::common::Id;
use crate::secp256k1fx::{FxError, TransferInput, TransferOutput};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("asset {0} overflowed while summing amounts")]
    Overflow(Id),
    #[error("asset {asset} produces {produced} but consumes only {consumed}")]
    InsufficientFunds {
        asset: Id,
        produced: u64,
        consumed: u64,
    },
    #[error("asset {asset} consumes {consumed} but produces only {produced}")]
    UnbalancedFlow {
        asset: Id,
        produced: u64,
        consumed: u64,
    },
}

/// Identifies an output of a transaction: `(tx_id, output_index)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtxoId {
    pub tx_id: Id,
    pub output_index: u32,
}

impl UtxoId {
    /// The key this UTXO lives under in shared memory.
    pub fn input_id(&self) -> Id {
        self.tx_id.prefix(self.output_index as u64)
    }
}

impl Packable for UtxoId {
    fn pack(&self, p: &mut Packer) {
        self.tx_id.pack(p);
        p.pack_u32(self.output_index);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: Id::unpack(u)?,
            output_index: u.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferableOutput {
    pub asset_id: Id,
    pub out: TransferOutput,
}

impl TransferableOutput {
    pub fn amount(&self) -> u64 {
        self.out.amount()
    }

    pub fn verify(&self) -> Result<(), FxError> {
        self.out.verify()
    }
}

impl Packable for TransferableOutput {
    fn pack(&self, p: &mut Packer) {
        self.asset_id.pack(p);
        self.out.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            asset_id: Id::unpack(u)?,
            out: TransferOutput::unpack(u)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferableInput {
    pub utxo_id: UtxoId,
    pub asset_id: Id,
    pub input: TransferInput,
}

impl TransferableInput {
    pub fn input_id(&self) -> Id {
        self.utxo_id.input_id()
    }

    pub fn amount(&self) -> u64 {
        self.input.amount()
    }

    pub fn verify(&self) -> Result<(), FxError> {
        self.input.verify()
    }
}

impl Packable for TransferableInput {
    fn pack(&self, p: &mut Packer) {
        self.utxo_id.pack(p);
        self.asset_id.pack(p);
        self.input.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            utxo_id: UtxoId::unpack(u)?,
            asset_id: Id::unpack(u)?,
            input: TransferInput::unpack(u)?,
        })
    }
}

/// An unspent output as stored in shared memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub utxo_id: UtxoId,
    pub asset_id: Id,
    pub out: TransferOutput,
}

impl Utxo {
    pub fn input_id(&self) -> Id {
        self.utxo_id.input_id()
    }
}

impl Packable for Utxo {
    fn pack(&self, p: &mut Packer) {
        self.utxo_id.pack(p);
        self.asset_id.pack(p);
        self.out.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            utxo_id: UtxoId::unpack(u)?,
            asset_id: Id::unpack(u)?,
            out: TransferOutput::unpack(u)?,
        })
    }
}

pub fn is_sorted_transferable_outputs(outs: &[TransferableOutput]) -> bool {
    codec::is_sorted_by_bytes(outs)
}

pub fn sort_transferable_outputs(outs: &mut Vec<TransferableOutput>) {
    codec::sort_by_bytes(outs)
}

/// Inputs are ordered by the UTXO they spend; a UTXO may appear only once.
pub fn is_sorted_and_unique_transferable_inputs(
    ins: &[TransferableInput],
) -> bool {
    ins.windows(2).all(|w| w[0].utxo_id < w[1].utxo_id)
}

/// Order inputs by the UTXO they spend, keeping each paired value (its signers) alongside.
pub fn sort_transferable_inputs<T>(ins: &mut [(TransferableInput, T)]) {
    ins.sort_by(|a, b| a.0.utxo_id.cmp(&b.0.utxo_id))
}

/// Tracks produced and consumed amounts per asset.
#[derive(Default, Debug)]
pub struct FlowChecker {
    produced: HashMap<Id, u64>,
    consumed: HashMap<Id, u64>,
    err: Option<FlowError>,
}

impl FlowChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produce(&mut self, asset_id: Id, amount: u64) {
        Self::add(&mut self.produced, &mut self.err, asset_id, amount)
    }

    pub fn consume(&mut self, asset_id: Id, amount: u64) {
        Self::add(&mut self.consumed, &mut self.err, asset_id, amount)
    }

    fn add(
        m: &mut HashMap<Id, u64>, err: &mut Option<FlowError>, asset_id: Id,
        amount: u64,
    ) {
        let e = m.entry(asset_id).or_insert(0);
        match e.checked_add(amount) {
            Some(v) => *e = v,
            None => {
                err.get_or_insert(FlowError::Overflow(asset_id));
            }
        }
    }

    /// Every asset must be consumed exactly as much as it is produced.
    pub fn verify(&self) -> Result<(), FlowError> {
        if let Some(err) = &self.err {
            return Err(err.clone())
        }
        for (asset, &produced) in self.produced.iter() {
            let consumed = self.consumed.get(asset).copied().unwrap_or(0);
            if produced > consumed {
                return Err(FlowError::InsufficientFunds {
                    asset: *asset,
                    produced,
                    consumed,
                })
            }
        }
        for (asset, &consumed) in self.consumed.iter() {
            let produced = self.produced.get(asset).copied().unwrap_or(0);
            if consumed != produced {
                return Err(FlowError::UnbalancedFlow {
                    asset: *asset,
                    produced,
                    consumed,
                })
            }
        }
        Ok(())
    }
}
