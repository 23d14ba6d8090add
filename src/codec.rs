//! Canonical serialization of atomic transactions and UTXOs.
//!
//! The wire shape follows the linear codec of the UTXO side: every top-level value starts with a
//! two-byte codec version, integers are big-endian, slices carry a `u32` length prefix and every
//! interface-typed value is preceded by the `u32` type id it was registered under. This module is
//! the only place allowed to read or write these byte shapes.

use thiserror::Error;

use crate::common::{Id, ShortId};

pub const CODEC_VERSION: u16 = 0;
pub const MAX_SLICE_LEN: usize = 256 * 1024;

/// Type ids registered with the codec. The numbering has gaps because the UTXO side registers
/// more types than this chain ever reads.
pub mod type_id {
    pub const IMPORT_TX: u32 = 0;
    pub const EXPORT_TX: u32 = 1;
    pub const SECP_TRANSFER_INPUT: u32 = 5;
    pub const SECP_TRANSFER_OUTPUT: u32 = 7;
    pub const SECP_CREDENTIAL: u32 = 9;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("insufficient length: need {need} bytes at offset {offset}")]
    InsufficientLength { offset: usize, need: usize },
    #[error("unknown codec version {0}")]
    UnknownVersion(u16),
    #[error("unknown type id {0}")]
    UnknownTypeId(u32),
    #[error("slice length {0} exceeds the maximum")]
    SliceTooLong(usize),
    #[error("{0} trailing bytes after the value")]
    TrailingBytes(usize),
}

/// A value with a canonical byte shape.
pub trait Packable: Sized {
    fn pack(&self, p: &mut Packer);
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError>;
}

#[derive(Default)]
pub struct Packer {
    buff: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pack_u16(&mut self, v: u16) {
        self.buff.extend_from_slice(&v.to_be_bytes())
    }

    #[inline]
    pub fn pack_u32(&mut self, v: u32) {
        self.buff.extend_from_slice(&v.to_be_bytes())
    }

    #[inline]
    pub fn pack_u64(&mut self, v: u64) {
        self.buff.extend_from_slice(&v.to_be_bytes())
    }

    #[inline]
    pub fn pack_fixed(&mut self, bytes: &[u8]) {
        self.buff.extend_from_slice(bytes)
    }

    pub fn pack_slice<T: Packable>(&mut self, items: &[T]) {
        self.pack_u32(items.len() as u32);
        for item in items {
            item.pack(self)
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buff
    }
}

pub struct Unpacker<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.bytes.len() - self.offset < n {
            return Err(CodecError::InsufficientLength {
                offset: self.offset,
                need: n,
            })
        }
        let s = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(s)
    }

    pub fn unpack_u16(&mut self) -> Result<u16, CodecError> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(b))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, CodecError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    pub fn unpack_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut b = [0u8; N];
        b.copy_from_slice(self.take(N)?);
        Ok(b)
    }

    pub fn unpack_slice<T: Packable>(&mut self) -> Result<Vec<T>, CodecError> {
        let len = self.unpack_u32()? as usize;
        if len > MAX_SLICE_LEN {
            return Err(CodecError::SliceTooLong(len))
        }
        // every element takes at least one byte
        if len > self.remaining() {
            return Err(CodecError::InsufficientLength {
                offset: self.offset,
                need: len,
            })
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::unpack(self)?)
        }
        Ok(items)
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

impl Packable for Id {
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(self.as_bytes())
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(Id::new(u.unpack_fixed()?))
    }
}

impl Packable for ShortId {
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(self.as_bytes())
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        Ok(ShortId::new(u.unpack_fixed()?))
    }
}

impl Packable for u32 {
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(*self)
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
        u.unpack_u32()
    }
}

/// Process-wide codec entry point.
pub struct Codec;

impl Codec {
    /// Serialize `value` behind the codec version prefix.
    pub fn marshal<T: Packable>(value: &T) -> Vec<u8> {
        let mut p = Packer::new();
        p.pack_u16(CODEC_VERSION);
        value.pack(&mut p);
        p.into_bytes()
    }

    /// Deserialize a value previously produced by [Codec::marshal]. The whole input must be
    /// consumed.
    pub fn unmarshal<T: Packable>(bytes: &[u8]) -> Result<T, CodecError> {
        let mut u = Unpacker::new(bytes);
        let version = u.unpack_u16()?;
        if version != CODEC_VERSION {
            return Err(CodecError::UnknownVersion(version))
        }
        let value = T::unpack(&mut u)?;
        if u.remaining() != 0 {
            return Err(CodecError::TrailingBytes(u.remaining()))
        }
        Ok(value)
    }
}

/// Whether `items` are in ascending order of their canonical serialization. Equal neighbours
/// count as sorted.
pub fn is_sorted_by_bytes<T: Packable>(items: &[T]) -> bool {
    let mut prev: Option<Vec<u8>> = None;
    for item in items {
        let cur = Codec::marshal(item);
        if let Some(prev) = &prev {
            if prev > &cur {
                return false
            }
        }
        prev = Some(cur);
    }
    true
}

/// Sort `items` by their canonical serialization.
pub fn sort_by_bytes<T: Packable>(items: &mut Vec<T>) {
    let mut keyed: Vec<(Vec<u8>, T)> = items
        .drain(..)
        .map(|item| (Codec::marshal(&item), item))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    items.extend(keyed.into_iter().map(|(_, item)| item));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair(u32, Id);

    impl Packable for Pair {
        fn pack(&self, p: &mut Packer) {
            p.pack_u32(self.0);
            self.1.pack(p);
        }
        fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
            Ok(Pair(u.unpack_u32()?, Id::unpack(u)?))
        }
    }

    #[test]
    fn test_marshal_layout() {
        let bytes = Codec::marshal(&Pair(0x01020304, Id::new([9; 32])));
        assert_eq!(&bytes[..6], &[0, 0, 1, 2, 3, 4]);
        assert_eq!(bytes.len(), 2 + 4 + 32);
        assert_eq!(
            Codec::unmarshal::<Pair>(&bytes).unwrap(),
            Pair(0x01020304, Id::new([9; 32]))
        );
    }

    #[test]
    fn test_unmarshal_rejects_bad_input() {
        let mut bytes = Codec::marshal(&Pair(1, Id::new([1; 32])));
        assert!(matches!(
            Codec::unmarshal::<Pair>(&bytes[..10]),
            Err(CodecError::InsufficientLength { .. })
        ));
        bytes.push(0);
        assert_eq!(
            Codec::unmarshal::<Pair>(&bytes),
            Err(CodecError::TrailingBytes(1))
        );
        bytes[1] = 1;
        assert_eq!(
            Codec::unmarshal::<Pair>(&bytes),
            Err(CodecError::UnknownVersion(1))
        );
    }

    #[test]
    fn test_slice_length_guard() {
        let mut p = Packer::new();
        p.pack_u16(CODEC_VERSION);
        p.pack_u32(u32::MAX);
        assert!(matches!(
            Codec::unmarshal::<Vec<u32>>(&p.into_bytes()),
            Err(CodecError::SliceTooLong(_))
        ));
    }

    #[test]
    fn test_sort_by_bytes() {
        let mut items = vec![
            Pair(3, Id::default()),
            Pair(1, Id::new([2; 32])),
            Pair(1, Id::new([1; 32])),
        ];
        assert!(!is_sorted_by_bytes(&items));
        sort_by_bytes(&mut items);
        assert!(is_sorted_by_bytes(&items));
        assert_eq!(items[0], Pair(1, Id::new([1; 32])));
        assert_eq!(items[2], Pair(3, Id::default()));
    }

    impl Packable for Vec<u32> {
        fn pack(&self, p: &mut Packer) {
            p.pack_slice(self)
        }
        fn unpack(u: &mut Unpacker<'_>) -> Result<Self, CodecError> {
            u.unpack_slice()
        }
    }
}
