// PMDB - Post-Mortem Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Decoding of values in the VM's native layout.
//!
//! Memory, storage and the immutables data section all share one layout: every static
//! value takes one 32-byte word (integers right-aligned, addresses in the low 20 bytes,
//! `bytesN` left-aligned), bytestrings and dynamic arrays are a length word followed by
//! their data, and static arrays, tuples and structs are their members laid out back to
//! back. The three backings only differ in how a byte range is fetched, which is what
//! [`ByteAddressable`] abstracts.

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, B256, I256, U256};
use pmdb_common::types::{check_int, check_uint, StorageReader, VarType, WORD_SIZE};
use thiserror::Error;

/// Errors raised while decoding a value from its native layout.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Read past the end of a bounded buffer
    #[error("read of {len} bytes at offset {offset} is out of bounds ({available} available)")]
    OutOfBounds {
        /// Start of the read
        offset: usize,
        /// Bytes requested
        len: usize,
        /// Bytes the buffer holds
        available: usize,
    },

    /// A word holds a value its type cannot take
    #[error("invalid {ty} value: {reason}")]
    InvalidValue {
        /// Declared type
        ty: VarType,
        /// What is wrong with the word
        reason: String,
    },

    /// A length word exceeds the declared bound
    #[error("length {len} exceeds the bound of {ty}")]
    LengthExceeded {
        /// Declared type
        ty: VarType,
        /// Length found
        len: U256,
    },

    /// String data is not UTF-8
    #[error("string data is not valid UTF-8")]
    InvalidUtf8,

    /// The type has no direct layout (mappings are addressed by hashing)
    #[error("type {0} cannot be decoded from a flat layout")]
    Unsupported(VarType),

    /// The storage backend failed
    #[error("storage read failed: {0}")]
    Storage(eyre::Report),
}

/// A byte-addressed view of memory, storage or code.
pub trait ByteAddressable {
    /// Read `len` bytes starting at `offset`.
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, LayoutError>;

    /// Read the word at `offset`.
    fn read_word(&self, offset: usize) -> Result<B256, LayoutError> {
        Ok(B256::from_slice(&self.read_bytes(offset, WORD_SIZE)?))
    }
}

impl ByteAddressable for [u8] {
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, LayoutError> {
        offset
            .checked_add(len)
            .and_then(|end| self.get(offset..end))
            .map(<[u8]>::to_vec)
            .ok_or(LayoutError::OutOfBounds { offset, len, available: self.len() })
    }
}

impl ByteAddressable for Bytes {
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, LayoutError> {
        self[..].read_bytes(offset, len)
    }
}

/// Call memory. Reads past the recorded image see zeros, as freshly expanded memory does.
#[derive(Debug, Clone, Copy)]
pub struct CallMemory<'a>(pub &'a [u8]);

impl ByteAddressable for CallMemory<'_> {
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, LayoutError> {
        let mut out = vec![0u8; len];
        if offset < self.0.len() {
            let end = offset.saturating_add(len).min(self.0.len());
            out[..end - offset].copy_from_slice(&self.0[offset..end]);
        }
        Ok(out)
    }
}

/// An account's storage viewed as a byte array starting at `base_slot`.
///
/// Byte offset `o` lives in slot `base_slot + o / 32`; slot arithmetic wraps like the VM's.
pub struct StorageBytes<'a, R: ?Sized> {
    reader: &'a R,
    address: Address,
    base_slot: U256,
}

impl<'a, R: StorageReader + ?Sized> StorageBytes<'a, R> {
    /// View `address`'s storage from `base_slot` onwards.
    pub fn new(reader: &'a R, address: Address, base_slot: U256) -> Self {
        Self { reader, address, base_slot }
    }
}

impl<R: StorageReader + ?Sized> ByteAddressable for StorageBytes<'_, R> {
    fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, LayoutError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let first = offset / WORD_SIZE;
        let last = offset.saturating_add(len - 1) / WORD_SIZE;
        let mut buf = Vec::with_capacity((last - first + 1) * WORD_SIZE);
        for index in first..=last {
            let slot = self.base_slot.wrapping_add(U256::from(index));
            let word =
                self.reader.storage_word(self.address, slot).map_err(LayoutError::Storage)?;
            buf.extend_from_slice(&word.to_be_bytes::<32>());
        }
        let start = offset % WORD_SIZE;
        Ok(buf[start..start + len].to_vec())
    }
}

fn at(offset: usize, delta: usize) -> Result<usize, LayoutError> {
    offset.checked_add(delta).ok_or(LayoutError::OutOfBounds { offset, len: delta, available: 0 })
}

fn read_length(
    ty: &VarType,
    src: &(impl ByteAddressable + ?Sized),
    offset: usize,
    max: usize,
) -> Result<usize, LayoutError> {
    let len = U256::from_be_bytes(src.read_word(offset)?.0);
    match usize::try_from(len) {
        Ok(n) if n <= max => Ok(n),
        _ => Err(LayoutError::LengthExceeded { ty: ty.clone(), len }),
    }
}

/// Decode a value of type `ty` whose layout starts at byte `offset` of `src`.
pub fn decode_layout(
    ty: &VarType,
    src: &(impl ByteAddressable + ?Sized),
    offset: usize,
) -> Result<DynSolValue, LayoutError> {
    let invalid = |reason: String| LayoutError::InvalidValue { ty: ty.clone(), reason };

    match ty {
        VarType::Uint(bits) => {
            let value = U256::from_be_bytes(src.read_word(offset)?.0);
            check_uint(value, *bits).map_err(invalid)?;
            Ok(DynSolValue::Uint(value, *bits))
        }
        VarType::Int(bits) => {
            let value = I256::from_raw(U256::from_be_bytes(src.read_word(offset)?.0));
            check_int(value, *bits).map_err(invalid)?;
            Ok(DynSolValue::Int(value, *bits))
        }
        VarType::Bool => {
            let value = U256::from_be_bytes(src.read_word(offset)?.0);
            if value > U256::from(1) {
                return Err(invalid(format!("{value} is neither 0 nor 1")));
            }
            Ok(DynSolValue::Bool(value == U256::from(1)))
        }
        VarType::Address => {
            let word = src.read_word(offset)?;
            if word[..12].iter().any(|b| *b != 0) {
                return Err(invalid(format!("{word} has dirty upper bytes")));
            }
            Ok(DynSolValue::Address(Address::from_slice(&word[12..])))
        }
        VarType::FixedBytes(n) => {
            let word = src.read_word(offset)?;
            if word[*n..].iter().any(|b| *b != 0) {
                return Err(invalid(format!("{word} has dirty trailing bytes")));
            }
            Ok(DynSolValue::FixedBytes(word, *n))
        }
        VarType::Bytes(max) => {
            let len = read_length(ty, src, offset, *max)?;
            Ok(DynSolValue::Bytes(src.read_bytes(at(offset, WORD_SIZE)?, len)?))
        }
        VarType::String(max) => {
            let len = read_length(ty, src, offset, *max)?;
            let data = src.read_bytes(at(offset, WORD_SIZE)?, len)?;
            String::from_utf8(data).map(DynSolValue::String).map_err(|_| LayoutError::InvalidUtf8)
        }
        VarType::StaticArray(inner, n) => {
            let items = decode_sequence(std::iter::repeat_n(inner.as_ref(), *n), src, offset)?;
            Ok(DynSolValue::FixedArray(items))
        }
        VarType::DynArray(inner, max) => {
            let len = read_length(ty, src, offset, *max)?;
            let items = decode_sequence(
                std::iter::repeat_n(inner.as_ref(), len),
                src,
                at(offset, WORD_SIZE)?,
            )?;
            Ok(DynSolValue::Array(items))
        }
        VarType::Tuple(members) => {
            Ok(DynSolValue::Tuple(decode_sequence(members.iter(), src, offset)?))
        }
        VarType::Struct { fields, .. } => {
            Ok(DynSolValue::Tuple(decode_sequence(fields.iter().map(|(_, ty)| ty), src, offset)?))
        }
        VarType::HashMap(..) => Err(LayoutError::Unsupported(ty.clone())),
    }
}

fn decode_sequence<'a>(
    types: impl Iterator<Item = &'a VarType>,
    src: &(impl ByteAddressable + ?Sized),
    mut offset: usize,
) -> Result<Vec<DynSolValue>, LayoutError> {
    let mut out = Vec::new();
    for ty in types {
        out.push(decode_layout(ty, src, offset)?);
        offset = at(offset, ty.memory_bytes_required())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ty(s: &str) -> VarType {
        s.parse().unwrap()
    }

    fn word(v: u64) -> [u8; 32] {
        U256::from(v).to_be_bytes::<32>()
    }

    #[test]
    fn test_decode_static_words() {
        pmdb_common::logging::ensure_test_logging(None);
        let mem = [word(7), word(1)].concat();
        assert_eq!(
            decode_layout(&ty("uint8"), mem.as_slice(), 0).unwrap(),
            DynSolValue::Uint(U256::from(7), 8)
        );
        assert_eq!(decode_layout(&ty("bool"), mem.as_slice(), 32).unwrap(), DynSolValue::Bool(true));
        assert!(matches!(
            decode_layout(&ty("uint256"), mem.as_slice(), 48),
            Err(LayoutError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_out_of_range_words() {
        pmdb_common::logging::ensure_test_logging(None);
        let mem = word(300);
        assert!(matches!(
            decode_layout(&ty("uint8"), mem.as_slice(), 0),
            Err(LayoutError::InvalidValue { .. })
        ));
        assert!(decode_layout(&ty("bool"), mem.as_slice(), 0).is_err());

        let minus_one = [0xffu8; 32];
        assert_eq!(
            decode_layout(&ty("int8"), minus_one.as_slice(), 0).unwrap(),
            DynSolValue::Int(I256::MINUS_ONE, 8)
        );
    }

    #[test]
    fn test_decode_dynamic_values() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut text = [0u8; 32];
        text[..3].copy_from_slice(b"bar");
        let mem = [word(3), text].concat();
        assert_eq!(
            decode_layout(&ty("String[10]"), mem.as_slice(), 0).unwrap(),
            DynSolValue::String("bar".into())
        );
        assert!(matches!(
            decode_layout(&ty("String[2]"), mem.as_slice(), 0),
            Err(LayoutError::LengthExceeded { .. })
        ));

        let mem = [word(2), word(10), word(20), word(99)].concat();
        assert_eq!(
            decode_layout(&ty("DynArray[uint256, 3]"), mem.as_slice(), 0).unwrap(),
            DynSolValue::Array(vec![
                DynSolValue::Uint(U256::from(10), 256),
                DynSolValue::Uint(U256::from(20), 256),
            ])
        );
    }

    #[test]
    fn test_decode_nested_members() {
        pmdb_common::logging::ensure_test_logging(None);
        // Bytes[2] occupies two words, so the trailing uint starts at byte 64.
        let mut data = [0u8; 32];
        data[..2].copy_from_slice(&[0xab, 0xcd]);
        let mem = [word(2), data, word(5)].concat();
        assert_eq!(
            decode_layout(&ty("(Bytes[2], uint256)"), mem.as_slice(), 0).unwrap(),
            DynSolValue::Tuple(vec![
                DynSolValue::Bytes(vec![0xab, 0xcd]),
                DynSolValue::Uint(U256::from(5), 256),
            ])
        );
    }

    #[test]
    fn test_call_memory_zero_extends() {
        pmdb_common::logging::ensure_test_logging(None);
        let mem = word(4);
        let memory = CallMemory(&mem);
        assert_eq!(
            decode_layout(&ty("uint256[2]"), &memory, 0).unwrap(),
            DynSolValue::FixedArray(vec![
                DynSolValue::Uint(U256::from(4), 256),
                DynSolValue::Uint(U256::ZERO, 256),
            ])
        );
    }

    #[test]
    fn test_storage_bytes_reads_consecutive_slots() {
        pmdb_common::logging::ensure_test_logging(None);
        let owner = Address::repeat_byte(0x11);
        let mut storage: HashMap<(Address, U256), U256> = HashMap::new();
        storage.insert((owner, U256::from(5)), U256::from(3));
        let mut text = [0u8; 32];
        text[..3].copy_from_slice(b"abc");
        storage.insert((owner, U256::from(6)), U256::from_be_bytes(text));

        let view = StorageBytes::new(&storage, owner, U256::from(5));
        assert_eq!(
            decode_layout(&ty("String[100]"), &view, 0).unwrap(),
            DynSolValue::String("abc".into())
        );

        // Slot arithmetic wraps around the top of the key space.
        storage.insert((owner, U256::ZERO), U256::from(9));
        let view = StorageBytes::new(&storage, owner, U256::MAX);
        assert_eq!(
            decode_layout(&ty("uint256[2]"), &view, 0).unwrap(),
            DynSolValue::FixedArray(vec![
                DynSolValue::Uint(U256::ZERO, 256),
                DynSolValue::Uint(U256::from(9), 256),
            ])
        );
    }

    #[test]
    fn test_hashmap_is_unsupported() {
        pmdb_common::logging::ensure_test_logging(None);
        let mem = word(0);
        assert!(matches!(
            decode_layout(&ty("HashMap[uint256, uint256]"), mem.as_slice(), 0),
            Err(LayoutError::Unsupported(_))
        ));
    }
}
