//! SECP256K1 ownership primitives shared with the UTXO side: output owners, transfer
//! inputs/outputs, credentials, and public key recovery.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::{type_id, CodecError, Packable, Packer, Unpacker};
use crate::common::{compute_hash256, Addr, ShortId};

pub const SIGNATURE_LEN: usize = 65;

pub type Signature = [u8; SIGNATURE_LEN];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FxError {
    #[error("output has no value")]
    NoValueOutput,
    #[error("input has no value")]
    NoValueInput,
    #[error("output owners threshold exceeds the number of addresses")]
    OutputUnspendable,
    #[error("output owners have addresses but a zero threshold")]
    OutputUnoptimized,
    #[error("output owner addresses are not sorted and unique")]
    AddrsNotSortedUnique,
    #[error("signature indices are not sorted and unique")]
    InputIndicesNotSortedUnique,
    #[error("input amount {input} differs from output amount {output}")]
    MismatchedAmounts { input: u64, output: u64 },
    #[error("output is locked until {0}")]
    Timelocked(u64),
    #[error("wrong number of signers: expected {expected}, got {got}")]
    WrongNumberOfSignatures { expected: usize, got: usize },
    #[error("signature index {0} is out of bounds")]
    InputOutputIndexOutOfBounds(u32),
    #[error("credential does not hold exactly one signature")]
    WrongCredentialSignatures,
    #[error("signature was not produced by the expected owner")]
    WrongSigner,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid private key")]
    InvalidPrivateKey,
}

/// Owners of an output: `threshold` of `addrs` must sign after `locktime`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputOwners {
    pub locktime: u64,
    pub threshold: u32,
    pub addrs: Vec<ShortId>,
}

impl OutputOwners {
    pub fn new(locktime: u64, threshold: u32, mut addrs: Vec<ShortId>) -> Self {
        addrs.sort();
        addrs.dedup();
        Self {
            locktime,
            threshold,
            addrs,
        }
    }

    pub fn verify(&self) -> Result<(), FxError> {
        if self.threshold as usize > self.addrs.len() {
            return Err(FxError::OutputUnspendable)
        }
        if self.threshold == 0 && !self.addrs.is_empty() {
            return Err(FxError::OutputUnoptimized)
        }
        if !self.addrs.windows(2).all(|w| w[0] < w[1]) {
            return Err(FxError::AddrsNotSortedUnique)
        }
        Ok(())
    }

    fn pack_fields(&self, p: &mut Packer) {
        p.pack_u64(self.locktime);
        p.pack_u32(self.threshold);
        p.pack_slice(&self.addrs);
    }

    fn unpack_fields(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            locktime: u.unpack_u64()?,
            threshold: u.unpack_u32()?,
            addrs: u.unpack_slice()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOutput {
    pub amt: u64,
    pub owners: OutputOwners,
}

impl TransferOutput {
    pub fn amount(&self) -> u64 {
        self.amt
    }

    /// Addresses that index this output in shared memory.
    pub fn addresses(&self) -> &[ShortId] {
        &self.owners.addrs
    }

    pub fn verify(&self) -> Result<(), FxError> {
        if self.amt == 0 {
            return Err(FxError::NoValueOutput)
        }
        self.owners.verify()
    }
}

// Packed as an interface value: type id first.
impl Packable for TransferOutput {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(type_id::SECP_TRANSFER_OUTPUT);
        p.pack_u64(self.amt);
        self.owners.pack_fields(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        match u.unpack_u32()? {
            type_id::SECP_TRANSFER_OUTPUT => Ok(Self {
                amt: u.unpack_u64()?,
                owners: OutputOwners::unpack_fields(u)?,
            }),
            t => Err(CodecError::UnknownTypeId(t)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferInput {
    pub amt: u64,
    pub sig_indices: Vec<u32>,
}

impl TransferInput {
    pub fn amount(&self) -> u64 {
        self.amt
    }

    pub fn verify(&self) -> Result<(), FxError> {
        if self.amt == 0 {
            return Err(FxError::NoValueInput)
        }
        if !self.sig_indices.windows(2).all(|w| w[0] < w[1]) {
            return Err(FxError::InputIndicesNotSortedUnique)
        }
        Ok(())
    }
}

impl Packable for TransferInput {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(type_id::SECP_TRANSFER_INPUT);
        p.pack_u64(self.amt);
        p.pack_slice(&self.sig_indices);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        match u.unpack_u32()? {
            type_id::SECP_TRANSFER_INPUT => Ok(Self {
                amt: u.unpack_u64()?,
                sig_indices: u.unpack_slice()?,
            }),
            t => Err(CodecError::UnknownTypeId(t)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credential {
    pub sigs: Vec<Signature>,
}

struct PackedSig(Signature);

impl Packable for PackedSig {
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(&self.0)
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Self(u.unpack_fixed()?))
    }
}

impl Packable for Credential {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(type_id::SECP_CREDENTIAL);
        p.pack_u32(self.sigs.len() as u32);
        for sig in &self.sigs {
            p.pack_fixed(sig)
        }
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        match u.unpack_u32()? {
            type_id::SECP_CREDENTIAL => {
                let sigs: Vec<PackedSig> = u.unpack_slice()?;
                Ok(Self {
                    sigs: sigs.into_iter().map(|s| s.0).collect(),
                })
            }
            t => Err(CodecError::UnknownTypeId(t)),
        }
    }
}

/// A recovered or derived SECP256K1 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(libsecp256k1::PublicKey);

impl PublicKey {
    /// `ripemd160(sha256(compressed))`, the address format of the UTXO side.
    pub fn address(&self) -> ShortId {
        let sha = Sha256::digest(self.0.serialize_compressed());
        let digest = Ripemd160::digest(sha);
        let mut out = [0u8; 20];
        out.copy_from_slice(digest.as_slice());
        out.into()
    }

    /// `keccak256(uncompressed[1..])[12..]`, the EVM account this key controls.
    pub fn eth_address(&self) -> Addr {
        let pubkey = self.0.serialize();
        Addr::from_slice(
            &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
        )
    }
}

#[derive(Clone, Debug)]
pub struct PrivateKey(libsecp256k1::SecretKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, FxError> {
        libsecp256k1::SecretKey::parse(bytes)
            .map(Self)
            .map_err(|_| FxError::InvalidPrivateKey)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(libsecp256k1::PublicKey::from_secret_key(&self.0))
    }

    /// Sign `sha256(msg)`, returning `[r || s || v]`.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.sign_hash(&compute_hash256(msg))
    }

    pub fn sign_hash(&self, hash: &[u8; 32]) -> Signature {
        let msg = libsecp256k1::Message::parse(hash);
        let (sig, recid) = libsecp256k1::sign(&msg, &self.0);
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&sig.serialize());
        out[64] = recid.serialize();
        out
    }
}

/// Recover the signer of `sha256(msg)` from a `[r || s || v]` signature.
pub fn recover_public_key(
    msg: &[u8], sig: &Signature,
) -> Result<PublicKey, FxError> {
    let hash = compute_hash256(msg);
    let msg = libsecp256k1::Message::parse(&hash);
    let signature = libsecp256k1::Signature::parse_standard_slice(&sig[..64])
        .map_err(|_| FxError::InvalidSignature)?;
    let recid = libsecp256k1::RecoveryId::parse(sig[64])
        .map_err(|_| FxError::InvalidSignature)?;
    libsecp256k1::recover(&msg, &signature, &recid)
        .map(PublicKey)
        .map_err(|_| FxError::InvalidSignature)
}

/// Check that `cred` authorizes `input` to spend `out` for a transaction whose unsigned bytes are
/// `unsigned_bytes`, at wall-clock time `now` (unix seconds).
pub fn verify_transfer(
    unsigned_bytes: &[u8], input: &TransferInput, cred: &Credential,
    out: &TransferOutput, now: u64,
) -> Result<(), FxError> {
    if input.amt != out.amt {
        return Err(FxError::MismatchedAmounts {
            input: input.amt,
            output: out.amt,
        })
    }
    let owners = &out.owners;
    if owners.locktime > now {
        return Err(FxError::Timelocked(owners.locktime))
    }
    let threshold = owners.threshold as usize;
    if input.sig_indices.len() != threshold {
        return Err(FxError::WrongNumberOfSignatures {
            expected: threshold,
            got: input.sig_indices.len(),
        })
    }
    if cred.sigs.len() != threshold {
        return Err(FxError::WrongNumberOfSignatures {
            expected: threshold,
            got: cred.sigs.len(),
        })
    }
    for (index, sig) in input.sig_indices.iter().zip(cred.sigs.iter()) {
        let expected = owners
            .addrs
            .get(*index as usize)
            .ok_or(FxError::InputOutputIndexOutOfBounds(*index))?;
        if &recover_public_key(unsigned_bytes, sig)?.address() != expected {
            return Err(FxError::WrongSigner)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    fn key(b: u8) -> PrivateKey {
        PrivateKey::from_bytes(&[b; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_recover() {
        let k = key(1);
        let sig = k.sign(b"atomic");
        let pk = recover_public_key(b"atomic", &sig).unwrap();
        assert_eq!(pk, k.public_key());
        assert_eq!(pk.eth_address(), k.public_key().eth_address());
        let other = recover_public_key(b"atomics", &sig).unwrap();
        assert_ne!(other.address(), k.public_key().address());
    }

    #[test]
    fn test_owners_verify() {
        let a = ShortId::new([1; 20]);
        let b = ShortId::new([2; 20]);
        assert!(OutputOwners::new(0, 1, vec![b, a]).verify().is_ok());
        assert_eq!(
            OutputOwners::new(0, 3, vec![a, b]).verify(),
            Err(FxError::OutputUnspendable)
        );
        assert_eq!(
            OutputOwners::new(0, 0, vec![a]).verify(),
            Err(FxError::OutputUnoptimized)
        );
        let unsorted = OutputOwners {
            locktime: 0,
            threshold: 1,
            addrs: vec![b, a],
        };
        assert_eq!(unsorted.verify(), Err(FxError::AddrsNotSortedUnique));
    }

    #[test]
    fn test_verify_transfer() {
        let k = key(3);
        let out = TransferOutput {
            amt: 20,
            owners: OutputOwners::new(0, 1, vec![k.public_key().address()]),
        };
        let input = TransferInput {
            amt: 20,
            sig_indices: vec![0],
        };
        let cred = Credential {
            sigs: vec![k.sign(b"tx")],
        };
        assert!(verify_transfer(b"tx", &input, &cred, &out, 0).is_ok());
        assert_eq!(
            verify_transfer(b"other", &input, &cred, &out, 0),
            Err(FxError::WrongSigner)
        );
        let locked = TransferOutput {
            owners: OutputOwners::new(100, 1, vec![k.public_key().address()]),
            ..out.clone()
        };
        assert_eq!(
            verify_transfer(b"tx", &input, &cred, &locked, 99),
            Err(FxError::Timelocked(100))
        );
        let short = TransferInput {
            amt: 19,
            sig_indices: vec![0],
        };
        assert!(matches!(
            verify_transfer(b"tx", &short, &cred, &out, 0),
            Err(FxError::MismatchedAmounts { .. })
        ));
    }

    #[test]
    fn test_credential_codec() {
        let cred = Credential {
            sigs: vec![[7; SIGNATURE_LEN], [8; SIGNATURE_LEN]],
        };
        let bytes = Codec::marshal(&cred);
        assert_eq!(bytes.len(), 2 + 4 + 4 + 2 * SIGNATURE_LEN);
        assert_eq!(Codec::unmarshal::<Credential>(&bytes).unwrap(), cred);
    }
}
