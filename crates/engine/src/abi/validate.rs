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

//! Strict structural validation of ABI parameter encodings.
//!
//! Walks the head/tail layout of a payload against its types without building values.
//! Every offset and length is bounds-checked against the region it lives in, and every
//! static word is checked for the canonical padding of its type.

use alloy_dyn_abi::DynSolType;
use alloy_primitives::U256;

const WORD: usize = 32;

/// Check that `data` is a canonical parameter encoding of `types`.
///
/// Returns a description of the first problem found.
pub fn validate_encoding(types: &[DynSolType], data: &[u8]) -> Result<(), String> {
    check_sequence(types.iter(), data, 0)
}

/// Encoded size of a static type. Only meaningful when `!ty.is_dynamic()`.
fn static_size(ty: &DynSolType) -> usize {
    match ty {
        DynSolType::FixedArray(inner, n) => n.saturating_mul(static_size(inner)),
        DynSolType::Tuple(members) => members.iter().map(static_size).sum(),
        DynSolType::CustomStruct { tuple, .. } => tuple.iter().map(static_size).sum(),
        _ => WORD,
    }
}

fn head_size(ty: &DynSolType) -> usize {
    if ty.is_dynamic() {
        WORD
    } else {
        static_size(ty)
    }
}

fn read_word(region: &[u8], pos: usize, base: usize) -> Result<&[u8], String> {
    region
        .get(pos..pos.saturating_add(WORD))
        .ok_or_else(|| format!("data too short: need a word at offset {}", base + pos))
}

fn read_usize(region: &[u8], pos: usize, base: usize, what: &str) -> Result<usize, String> {
    let word = U256::from_be_slice(read_word(region, pos, base)?);
    usize::try_from(word).map_err(|_| format!("{what} {word} at offset {} is too large", base + pos))
}

/// Validate a parameter sequence whose head starts at the beginning of `region`.
///
/// `base` is the absolute position of `region` in the payload, used for messages.
fn check_sequence<'a>(
    types: impl Iterator<Item = &'a DynSolType> + Clone,
    region: &[u8],
    base: usize,
) -> Result<(), String> {
    let head: usize = types.clone().map(head_size).fold(0usize, usize::saturating_add);
    if region.len() < head {
        return Err(format!(
            "data too short: head at offset {base} needs {head} bytes, {} available",
            region.len()
        ));
    }

    let mut pos = 0;
    for ty in types {
        if ty.is_dynamic() {
            let offset = read_usize(region, pos, base, "offset")?;
            if offset < head {
                return Err(format!(
                    "offset {offset} at {} points into the head ({head} bytes)",
                    base + pos
                ));
            }
            if offset >= region.len() {
                return Err(format!(
                    "offset {offset} at {} points outside the data ({} bytes)",
                    base + pos,
                    region.len()
                ));
            }
            check_value(ty, &region[offset..], base + offset)?;
            pos += WORD;
        } else {
            let size = static_size(ty);
            check_value(ty, &region[pos..pos + size], base + pos)?;
            pos += size;
        }
    }
    Ok(())
}

/// Validate one value whose encoding starts at the beginning of `region`.
fn check_value(ty: &DynSolType, region: &[u8], base: usize) -> Result<(), String> {
    match ty {
        DynSolType::Bool => {
            let word = read_word(region, 0, base)?;
            if word[..WORD - 1].iter().any(|b| *b != 0) || word[WORD - 1] > 1 {
                return Err(format!("invalid bool at offset {base}"));
            }
            Ok(())
        }
        DynSolType::Uint(bits) => {
            let value = U256::from_be_slice(read_word(region, 0, base)?);
            if value.bit_len() > *bits {
                return Err(format!("value at offset {base} does not fit in uint{bits}"));
            }
            Ok(())
        }
        DynSolType::Int(bits) => {
            let word = read_word(region, 0, base)?;
            // Bytes above the value's width must all equal the sign byte.
            let width = bits / 8;
            let sign = if word[WORD - width] & 0x80 != 0 { 0xff } else { 0x00 };
            if word[..WORD - width].iter().any(|b| *b != sign) {
                return Err(format!("value at offset {base} does not fit in int{bits}"));
            }
            Ok(())
        }
        DynSolType::Address => {
            let word = read_word(region, 0, base)?;
            if word[..12].iter().any(|b| *b != 0) {
                return Err(format!("dirty address padding at offset {base}"));
            }
            Ok(())
        }
        DynSolType::Function => {
            let word = read_word(region, 0, base)?;
            if word[24..].iter().any(|b| *b != 0) {
                return Err(format!("dirty function padding at offset {base}"));
            }
            Ok(())
        }
        DynSolType::FixedBytes(n) => {
            let word = read_word(region, 0, base)?;
            if word[*n..].iter().any(|b| *b != 0) {
                return Err(format!("dirty bytes{n} padding at offset {base}"));
            }
            Ok(())
        }
        DynSolType::Bytes | DynSolType::String => {
            let len = read_usize(region, 0, base, "length")?;
            let data = region
                .get(WORD..)
                .and_then(|rest| rest.get(..len))
                .ok_or_else(|| format!("data too short: {len} bytes at offset {base}"))?;
            if matches!(ty, DynSolType::String) && std::str::from_utf8(data).is_err() {
                return Err(format!("string at offset {base} is not valid UTF-8"));
            }
            Ok(())
        }
        DynSolType::Array(inner) => {
            let len = read_usize(region, 0, base, "length")?;
            let body = &region[WORD..];
            // Each element needs at least one head slot, which bounds `len` by the data.
            if len > body.len() / head_size(inner).max(1) {
                return Err(format!(
                    "array length {len} at offset {base} exceeds the remaining data"
                ));
            }
            check_sequence(std::iter::repeat_n(inner.as_ref(), len), body, base + WORD)
        }
        DynSolType::FixedArray(inner, n) => {
            check_sequence(std::iter::repeat_n(inner.as_ref(), *n), region, base)
        }
        DynSolType::Tuple(members) => check_sequence(members.iter(), region, base),
        DynSolType::CustomStruct { tuple, .. } => check_sequence(tuple.iter(), region, base),
    }
}
