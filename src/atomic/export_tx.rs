use std::collections::HashMap;

use log::info;

use super::{
    AtomicEnv, AtomicTxError, EvmInput, Tx, TxError, VerifiedOnce,
};
use crate::avax::{is_sorted_transferable_outputs, FlowChecker, TransferableOutput, Utxo, UtxoId};
use crate::codec::{Codec, CodecError, Packable, Packer, Unpacker};
use crate::common::{Addr, Id, IdSet, U256};
use crate::context::HostContext;
use crate::secp256k1fx::{recover_public_key, FxError};
use crate::shared_memory::{Element, Requests};
use crate::state::StateDB;

/// Moves value out of EVM accounts into UTXOs on the destination chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportTx {
    pub network_id: u32,
    /// Id of this chain.
    pub blockchain_id: Id,
    pub destination_chain: Id,
    pub ins: Vec<EvmInput>,
    pub exported_outputs: Vec<TransferableOutput>,
    verified: VerifiedOnce,
}

impl ExportTx {
    pub fn new(
        network_id: u32, blockchain_id: Id, destination_chain: Id,
        ins: Vec<EvmInput>, exported_outputs: Vec<TransferableOutput>,
    ) -> Self {
        Self {
            network_id,
            blockchain_id,
            destination_chain,
            ins,
            exported_outputs,
            verified: VerifiedOnce::default(),
        }
    }

    /// Exports consume no shared-memory UTXOs.
    pub fn input_utxos(&self) -> IdSet {
        IdSet::new()
    }

    pub fn verify(
        &self, x_chain_id: &Id, ctx: &HostContext, _fee_amount: u64,
        _fee_asset_id: &Id,
    ) -> Result<(), AtomicTxError> {
        self.verified.check(|| {
            if self.destination_chain.is_zero() ||
                &self.destination_chain != x_chain_id
            {
                return Err(AtomicTxError::WrongChainId)
            }
            if self.exported_outputs.is_empty() {
                return Err(AtomicTxError::NoExportOutputs)
            }
            if self.network_id != ctx.network_id {
                return Err(AtomicTxError::WrongNetworkId)
            }
            if self.blockchain_id != ctx.chain_id {
                return Err(AtomicTxError::WrongBlockchainId)
            }
            for out in &self.exported_outputs {
                out.verify()?;
            }
            if !is_sorted_transferable_outputs(&self.exported_outputs) {
                return Err(AtomicTxError::OutputsNotSorted)
            }
            Ok(())
        })
    }

    /// The UTXOs of an export are only created when it is accepted, so nothing here consults
    /// shared memory. The destination chain checks them again when they are imported.
    pub fn semantic_verify(
        &self, env: &AtomicEnv<'_>, stx: &Tx,
    ) -> Result<(), TxError> {
        self.verify(&env.ctx.x_chain_id, env.ctx, env.tx_fee, &env.ctx.avax_asset_id)?;

        let mut fc = FlowChecker::new();
        fc.produce(env.ctx.avax_asset_id, env.tx_fee);
        for out in &self.exported_outputs {
            fc.produce(out.asset_id, out.amount());
        }
        for input in &self.ins {
            fc.consume(input.asset_id, input.amount);
        }
        fc.verify().map_err(AtomicTxError::from)?;

        if stx.creds().len() != self.ins.len() {
            return Err(AtomicTxError::CredentialCountMismatch {
                expected: self.ins.len(),
                got: stx.creds().len(),
            }
            .into())
        }
        for (input, cred) in self.ins.iter().zip(stx.creds()) {
            let sig = match cred.sigs.as_slice() {
                [sig] => sig,
                _ => {
                    return Err(AtomicTxError::Fx(
                        FxError::WrongCredentialSignatures,
                    )
                    .into())
                }
            };
            let pubkey = recover_public_key(stx.unsigned_bytes(), sig)
                .map_err(AtomicTxError::from)?;
            if pubkey.eth_address() != input.address {
                return Err(AtomicTxError::PublicKeySignatureMismatch.into())
            }
        }
        Ok(())
    }

    /// Debit every input and bump its nonce. All inputs are checked against `state` before any
    /// of them is applied, so a failing transfer leaves `state` untouched.
    pub fn evm_state_transfer(
        &self, env: &AtomicEnv<'_>, state: &mut dyn StateDB,
    ) -> Result<(), AtomicTxError> {
        let mut balances: HashMap<(Addr, Id), U256> = HashMap::new();
        let mut nonces: HashMap<Addr, u64> = HashMap::new();
        let mut debits = Vec::with_capacity(self.ins.len());
        for from in &self.ins {
            let amount = env.to_evm_amount(from.amount)?;
            let key = (from.address.clone(), from.asset_id);
            let balance = balances.entry(key).or_insert_with(|| {
                if from.asset_id == env.ctx.avax_asset_id {
                    state.get_balance(&from.address)
                } else {
                    state.get_balance_multi_coin(&from.address, &from.asset_id)
                }
            });
            *balance = balance.checked_sub(amount).ok_or_else(|| {
                AtomicTxError::InsufficientFunds {
                    address: from.address.clone(),
                    asset: from.asset_id,
                }
            })?;
            let nonce = nonces
                .entry(from.address.clone())
                .or_insert_with(|| state.get_nonce(&from.address));
            if *nonce != from.nonce {
                return Err(AtomicTxError::InvalidNonce {
                    address: from.address.clone(),
                    expected: *nonce,
                    got: from.nonce,
                })
            }
            *nonce += 1;
            debits.push((from, amount));
        }

        for (from, amount) in debits {
            info!(
                "crosschain C->X: addr={} amount={} asset={}",
                from.address, from.amount, from.asset_id
            );
            if from.asset_id == env.ctx.avax_asset_id {
                state.sub_balance(&from.address, &amount);
            } else {
                state.sub_balance_multi_coin(&from.address, &from.asset_id, &amount);
            }
            state.set_nonce(&from.address, from.nonce + 1);
        }
        Ok(())
    }

    /// One UTXO per exported output, put into the destination chain's partition and indexed by
    /// its owners.
    pub(super) fn atomic_requests(&self, tx_id: &Id) -> (Id, Requests) {
        let put_requests = self
            .exported_outputs
            .iter()
            .enumerate()
            .map(|(i, out)| {
                let utxo = Utxo {
                    utxo_id: UtxoId {
                        tx_id: *tx_id,
                        output_index: i as u32,
                    },
                    asset_id: out.asset_id,
                    out: out.out.clone(),
                };
                Element {
                    key: utxo.input_id().as_bytes().to_vec(),
                    value: Codec::marshal(&utxo),
                    traits: out
                        .out
                        .addresses()
                        .iter()
                        .map(|a| a.as_bytes().to_vec())
                        .collect(),
                }
            })
            .collect();
        (
            self.destination_chain,
            Requests {
                put_requests,
                ..Default::default()
            },
        )
    }
}

impl Packable for ExportTx {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(self.network_id);
        self.blockchain_id.pack(p);
        self.destination_chain.pack(p);
        p.pack_slice(&self.ins);
        p.pack_slice(&self.exported_outputs);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self::new(
            u.unpack_u32()?,
            Id::unpack(u)?,
            Id::unpack(u)?,
            u.unpack_slice()?,
            u.unpack_slice()?,
        ))
    }
}
