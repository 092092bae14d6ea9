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

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, Bytes, Selector};
use itertools::Itertools;
use pmdb_common::types::VarType;
use thiserror::Error;

use super::validate_encoding;

/// Errors raised while marshaling values to or from ABI encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    /// Values do not fit the declared types
    #[error("cannot encode `{signature}`: {reason}")]
    Encoding {
        /// Canonical type signature being encoded
        signature: String,
        /// What did not fit
        reason: String,
    },

    /// Data is not a valid encoding of the declared types
    #[error("cannot decode `{signature}`: {reason}")]
    Decoding {
        /// Canonical type signature being decoded
        signature: String,
        /// What was malformed
        reason: String,
    },

    /// A type has no ABI representation or a signature does not parse
    #[error("invalid ABI signature `{0}`")]
    InvalidSignature(String),
}

/// 4-byte selector: the first bytes of the keccak-256 of `signature`.
///
/// `signature` must be canonical (`transfer(address,uint256)`, no spaces or names).
pub fn selector(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature.as_bytes())[..4])
}

/// Canonical tuple signature of `types`, e.g. `(uint256,bytes)`.
pub fn tuple_signature(types: &[VarType]) -> Result<String, AbiError> {
    Ok(format!("({})", abi_types(types)?.iter().map(|t| t.sol_type_name()).join(",")))
}

fn abi_types(types: &[VarType]) -> Result<Vec<DynSolType>, AbiError> {
    types
        .iter()
        .map(|ty| ty.abi_type().ok_or_else(|| AbiError::InvalidSignature(ty.to_string())))
        .collect()
}

/// ABI-encode `values` as a parameter tuple of `types`.
///
/// Fails on arity mismatch, on values of the wrong kind, on integers wider than their
/// declared width and on bytestrings or arrays longer than their declared bound.
pub fn encode(types: &[VarType], values: &[DynSolValue]) -> Result<Bytes, AbiError> {
    let signature = tuple_signature(types)?;
    let err = |reason: String| AbiError::Encoding { signature: signature.clone(), reason };

    if types.len() != values.len() {
        return Err(err(format!("expected {} values, got {}", types.len(), values.len())));
    }
    for (i, ((ty, abi), value)) in types.iter().zip(abi_types(types)?).zip(values).enumerate() {
        if !abi.matches(value) {
            return Err(err(format!(
                "argument {i}: expected {ty}, got {}",
                value.sol_type_name().unwrap_or_default()
            )));
        }
        ty.validate_value(value).map_err(|reason| err(format!("argument {i}: {reason}")))?;
    }

    Ok(DynSolValue::Tuple(values.to_vec()).abi_encode_params().into())
}

/// Decode `data` as a parameter tuple of `types`.
///
/// The payload is validated strictly before decoding: short heads or tails, offsets
/// outside the data or into the head, dirty high bits and invalid UTF-8 are all errors.
pub fn decode(types: &[VarType], data: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
    let signature = tuple_signature(types)?;
    let err = |reason: String| AbiError::Decoding { signature: signature.clone(), reason };

    let abi = abi_types(types)?;
    validate_encoding(&abi, data).map_err(err)?;

    let decoded =
        DynSolType::Tuple(abi).abi_decode_params(data).map_err(|e| err(e.to_string()))?;
    let DynSolValue::Tuple(values) = decoded else {
        return Err(err("decoder did not produce a tuple".to_string()));
    };
    for (i, (ty, value)) in types.iter().zip(&values).enumerate() {
        ty.validate_value(value).map_err(|reason| err(format!("value {i}: {reason}")))?;
    }
    Ok(values)
}

/// Encode against a textual ABI signature such as `(uint256,address[])`.
///
/// Bytestrings and arrays are unbounded here; only shape and integer widths are checked.
pub fn encode_signature(signature: &str, values: &[DynSolValue]) -> Result<Bytes, AbiError> {
    encode(&parse_signature(signature)?, values)
}

/// Decode against a textual ABI signature such as `(uint256,address[])`.
pub fn decode_signature(signature: &str, data: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
    decode(&parse_signature(signature)?, data)
}

fn parse_signature(signature: &str) -> Result<Vec<VarType>, AbiError> {
    let invalid = || AbiError::InvalidSignature(signature.to_string());
    let parsed = DynSolType::parse(signature).map_err(|_| invalid())?;
    let members = match parsed {
        DynSolType::Tuple(members) => members,
        single => vec![single],
    };
    members.iter().map(|ty| unbounded_var_type(ty).ok_or_else(invalid)).collect()
}

fn unbounded_var_type(ty: &DynSolType) -> Option<VarType> {
    Some(match ty {
        DynSolType::Bool => VarType::Bool,
        DynSolType::Int(bits) => VarType::Int(*bits),
        DynSolType::Uint(bits) => VarType::Uint(*bits),
        DynSolType::FixedBytes(n) => VarType::FixedBytes(*n),
        DynSolType::Address => VarType::Address,
        DynSolType::Bytes => VarType::Bytes(usize::MAX),
        DynSolType::String => VarType::String(usize::MAX),
        DynSolType::Array(inner) => VarType::DynArray(Box::new(unbounded_var_type(inner)?), usize::MAX),
        DynSolType::FixedArray(inner, n) => {
            VarType::StaticArray(Box::new(unbounded_var_type(inner)?), *n)
        }
        DynSolType::Tuple(members) => {
            VarType::Tuple(members.iter().map(unbounded_var_type).collect::<Option<_>>()?)
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, hex, Address, B256, I256, U256};

    fn ty(s: &str) -> VarType {
        s.parse().unwrap()
    }

    fn uint(v: u64) -> DynSolValue {
        DynSolValue::Uint(U256::from(v), 256)
    }

    #[test]
    fn test_selector() {
        pmdb_common::logging::ensure_test_logging(None);
        assert_eq!(selector("transfer(address,uint256)").0, hex!("a9059cbb"));
        assert_eq!(selector("Error(string)").0, hex!("08c379a0"));
    }

    #[test]
    fn test_round_trip_mixed_values() {
        pmdb_common::logging::ensure_test_logging(None);
        let types = vec![
            ty("uint8"),
            ty("int128"),
            ty("bool"),
            ty("address"),
            ty("bytes4"),
            ty("Bytes[10]"),
            ty("String[16]"),
            ty("DynArray[uint256, 4]"),
            ty("uint256[2]"),
            ty("(uint256, (String[5], bool))"),
        ];
        let mut word = B256::ZERO;
        word[..4].copy_from_slice(&[1, 2, 3, 4]);
        let values = vec![
            DynSolValue::Uint(U256::from(200), 8),
            DynSolValue::Int(I256::try_from(-5).unwrap(), 128),
            DynSolValue::Bool(true),
            DynSolValue::Address(address!("0x00000000000000000000000000000000deadbeef")),
            DynSolValue::FixedBytes(word, 4),
            DynSolValue::Bytes(b"hello".to_vec()),
            DynSolValue::String("world".to_string()),
            DynSolValue::Array(vec![uint(1), uint(2), uint(3)]),
            DynSolValue::FixedArray(vec![uint(7), uint(8)]),
            DynSolValue::Tuple(vec![
                uint(9),
                DynSolValue::Tuple(vec![DynSolValue::String("x".into()), DynSolValue::Bool(false)]),
            ]),
        ];

        let encoded = encode(&types, &values).unwrap();
        assert_eq!(decode(&types, &encoded).unwrap(), values);
    }

    #[test]
    fn test_encode_rejects_shape_and_width() {
        pmdb_common::logging::ensure_test_logging(None);
        let types = vec![ty("uint8")];

        assert!(matches!(encode(&types, &[]), Err(AbiError::Encoding { .. })));
        assert!(encode(&types, &[DynSolValue::Bool(true)]).is_err());
        assert!(encode(&types, &[DynSolValue::Uint(U256::from(256), 8)]).is_err());
        assert!(encode(&[ty("Bytes[2]")], &[DynSolValue::Bytes(vec![0; 3])]).is_err());
        assert!(encode(&[ty("DynArray[uint256, 1]")], &[DynSolValue::Array(vec![uint(1), uint(2)])])
            .is_err());
        assert!(matches!(
            encode(&[ty("HashMap[uint256, uint256]")], &[uint(1)]),
            Err(AbiError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        pmdb_common::logging::ensure_test_logging(None);
        // Too short for the head.
        assert!(decode(&[ty("uint256")], &[0u8; 31]).is_err());

        // Dirty high bits for a narrow integer.
        let mut data = [0u8; 32];
        data[0] = 1;
        assert!(decode(&[ty("uint8")], &data).is_err());

        // Address with junk in the upper 12 bytes.
        let mut data = [0u8; 32];
        data[0] = 0xff;
        assert!(decode(&[ty("address")], &data).is_err());

        // Bool other than 0 or 1.
        let mut data = [0u8; 32];
        data[31] = 2;
        assert!(decode(&[ty("bool")], &data).is_err());

        // Offset pointing back into the head.
        let mut data = vec![0u8; 64];
        data[31] = 0;
        assert!(decode(&[ty("Bytes[10]")], &data).is_err());

        // Declared bound exceeded by an otherwise valid payload.
        let encoded = encode_signature("(bytes)", &[DynSolValue::Bytes(vec![1; 5])]).unwrap();
        assert!(decode(&[ty("Bytes[4]")], &encoded).is_err());
        assert!(decode(&[ty("Bytes[5]")], &encoded).is_ok());
    }

    #[test]
    fn test_signature_helpers() {
        pmdb_common::logging::ensure_test_logging(None);
        assert_eq!(
            tuple_signature(&[ty("DynArray[Bytes[3], 2]"), ty("Point{x: int8, y: address}")])
                .unwrap(),
            "(bytes[],(int8,address))"
        );

        let values = vec![DynSolValue::Address(Address::ZERO), uint(5)];
        let encoded = encode_signature("(address,uint256)", &values).unwrap();
        assert_eq!(decode_signature("(address,uint256)", &encoded).unwrap(), values);
        assert!(matches!(encode_signature("(uint7)", &values), Err(AbiError::InvalidSignature(_))));
    }
}
