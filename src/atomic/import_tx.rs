use log::info;

use super::{
    AtomicEnv, AtomicTxError, EvmOutput, Tx, TxError, VerifiedOnce,
};
use crate::avax::{
    is_sorted_and_unique_transferable_inputs, FlowChecker, TransferableInput,
    Utxo,
};
use crate::codec::{Codec, CodecError, Packable, Packer, Unpacker};
use crate::common::{Id, IdSet};
use crate::context::HostContext;
use crate::secp256k1fx::verify_transfer;
use crate::shared_memory::{Requests, SharedMemoryError};
use crate::state::StateDB;

/// Moves UTXOs from the source chain into EVM balances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportTx {
    pub network_id: u32,
    /// Id of this chain.
    pub blockchain_id: Id,
    pub source_chain: Id,
    pub imported_inputs: Vec<TransferableInput>,
    pub outs: Vec<EvmOutput>,
    verified: VerifiedOnce,
}

impl ImportTx {
    pub fn new(
        network_id: u32, blockchain_id: Id, source_chain: Id,
        imported_inputs: Vec<TransferableInput>, outs: Vec<EvmOutput>,
    ) -> Self {
        Self {
            network_id,
            blockchain_id,
            source_chain,
            imported_inputs,
            outs,
            verified: VerifiedOnce::default(),
        }
    }

    pub fn input_utxos(&self) -> IdSet {
        self.imported_inputs.iter().map(|i| i.input_id()).collect()
    }

    pub fn verify(
        &self, x_chain_id: &Id, ctx: &HostContext, _fee_amount: u64,
        _fee_asset_id: &Id,
    ) -> Result<(), AtomicTxError> {
        self.verified.check(|| {
            if self.source_chain.is_zero() || &self.source_chain != x_chain_id
            {
                return Err(AtomicTxError::WrongChainId)
            }
            if self.imported_inputs.is_empty() {
                return Err(AtomicTxError::NoImportInputs)
            }
            if self.network_id != ctx.network_id {
                return Err(AtomicTxError::WrongNetworkId)
            }
            if self.blockchain_id != ctx.chain_id {
                return Err(AtomicTxError::WrongBlockchainId)
            }
            for input in &self.imported_inputs {
                input.verify()?;
            }
            if !is_sorted_and_unique_transferable_inputs(&self.imported_inputs)
            {
                return Err(AtomicTxError::InputsNotSortedUnique)
            }
            Ok(())
        })
    }

    pub async fn semantic_verify(
        &self, env: &AtomicEnv<'_>, stx: &Tx,
    ) -> Result<(), TxError> {
        let ctx = env.ctx;
        self.verify(&ctx.x_chain_id, ctx, env.tx_fee, &ctx.avax_asset_id)?;

        if stx.creds().len() != self.imported_inputs.len() {
            return Err(AtomicTxError::CredentialCountMismatch {
                expected: self.imported_inputs.len(),
                got: stx.creds().len(),
            }
            .into())
        }

        let mut fc = FlowChecker::new();
        fc.produce(ctx.avax_asset_id, env.tx_fee);
        for out in &self.outs {
            fc.produce(out.asset_id, out.amount);
        }
        for input in &self.imported_inputs {
            fc.consume(input.asset_id, input.amount());
        }
        fc.verify().map_err(AtomicTxError::from)?;

        // the UTXOs are only guaranteed to be present once the source chain caught up
        if !ctx.is_bootstrapped() {
            return Ok(())
        }

        let keys: Vec<Vec<u8>> = self
            .imported_inputs
            .iter()
            .map(|i| i.input_id().as_bytes().to_vec())
            .collect();
        let values = ctx.shared_memory.get(&self.source_chain, &keys).await?;
        if values.len() != keys.len() {
            return Err(SharedMemoryError::Unavailable(format!(
                "asked for {} UTXOs, got {}",
                keys.len(),
                values.len()
            ))
            .into())
        }
        for ((input, cred), value) in self
            .imported_inputs
            .iter()
            .zip(stx.creds())
            .zip(values.into_iter())
        {
            let input_id = input.input_id();
            let value = value.ok_or(AtomicTxError::MissingUtxo(input_id))?;
            let utxo: Utxo = Codec::unmarshal(&value)
                .map_err(|err| TxError::CorruptUtxo { key: input_id, err })?;
            if utxo.asset_id != input.asset_id {
                return Err(AtomicTxError::AssetIdMismatch.into())
            }
            verify_transfer(
                stx.unsigned_bytes(),
                &input.input,
                cred,
                &utxo.out,
                env.now,
            )
            .map_err(AtomicTxError::from)?;
        }
        Ok(())
    }

    /// Credit every output.
    pub fn evm_state_transfer(
        &self, env: &AtomicEnv<'_>, state: &mut dyn StateDB,
    ) -> Result<(), AtomicTxError> {
        for to in &self.outs {
            info!(
                "crosschain X->C: addr={} amount={} asset={}",
                to.address, to.amount, to.asset_id
            );
            let amount = env.to_evm_amount(to.amount)?;
            if to.asset_id == env.ctx.avax_asset_id {
                state.add_balance(&to.address, &amount);
            } else {
                state.add_balance_multi_coin(&to.address, &to.asset_id, &amount);
            }
        }
        Ok(())
    }

    /// Consume the imported UTXOs from the source chain's partition.
    pub(super) fn atomic_requests(&self) -> (Id, Requests) {
        (
            self.source_chain,
            Requests {
                remove_requests: self
                    .imported_inputs
                    .iter()
                    .map(|i| i.input_id().as_bytes().to_vec())
                    .collect(),
                ..Default::default()
            },
        )
    }
}

impl Packable for ImportTx {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(self.network_id);
        self.blockchain_id.pack(p);
        self.source_chain.pack(p);
        p.pack_slice(&self.imported_inputs);
        p.pack_slice(&self.outs);
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
