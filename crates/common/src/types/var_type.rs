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

//! Compiler-level type descriptions.
//!
//! [`VarType`] is the type vocabulary the compiler hands us in its metadata. It is richer
//! than the ABI type system: bytestrings and dynamic arrays carry a declared maximum
//! length, structs carry member names, and `HashMap` exists only in storage. The textual
//! form follows the source language (`Bytes[64]`, `DynArray[uint256, 3]`,
//! `HashMap[address, uint256]`) and is what artifacts serialize.

use std::{fmt, str::FromStr};

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{I256, U256};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of an EVM word in bytes.
pub const WORD_SIZE: usize = 32;

/// A type as declared in the contract source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VarType {
    /// Unsigned integer with the given bit width
    Uint(usize),
    /// Signed integer with the given bit width
    Int(usize),
    /// Boolean
    Bool,
    /// 20-byte account address
    Address,
    /// `bytesN`, 1 <= N <= 32
    FixedBytes(usize),
    /// `Bytes[max_len]`
    Bytes(usize),
    /// `String[max_len]`
    String(usize),
    /// `T[N]`
    StaticArray(Box<VarType>, usize),
    /// `DynArray[T, max_len]`
    DynArray(Box<VarType>, usize),
    /// Anonymous tuple
    Tuple(Vec<VarType>),
    /// Named struct with ordered members
    Struct {
        /// Struct name
        name: String,
        /// Member names and types, in declaration order
        fields: Vec<(String, VarType)>,
    },
    /// `HashMap[K, V]`, storage only
    HashMap(Box<VarType>, Box<VarType>),
}

/// Error produced when a type string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid type `{input}`: {reason}")]
pub struct VarTypeParseError {
    /// The full input that was being parsed
    pub input: String,
    /// What went wrong
    pub reason: String,
}

const fn ceil32(n: usize) -> usize {
    n.div_ceil(WORD_SIZE).saturating_mul(WORD_SIZE)
}

impl VarType {
    /// Number of bytes the value occupies in the VM's native (memory/storage) layout.
    pub fn memory_bytes_required(&self) -> usize {
        match self {
            Self::Uint(_)
            | Self::Int(_)
            | Self::Bool
            | Self::Address
            | Self::FixedBytes(_)
            | Self::HashMap(..) => WORD_SIZE,
            Self::Bytes(max) | Self::String(max) => ceil32(*max).saturating_add(WORD_SIZE),
            Self::StaticArray(inner, n) => n.saturating_mul(inner.memory_bytes_required()),
            Self::DynArray(inner, n) => {
                n.saturating_mul(inner.memory_bytes_required()).saturating_add(WORD_SIZE)
            }
            Self::Tuple(members) => members
                .iter()
                .map(Self::memory_bytes_required)
                .fold(0, usize::saturating_add),
            Self::Struct { fields, .. } => fields
                .iter()
                .map(|(_, ty)| ty.memory_bytes_required())
                .fold(0, usize::saturating_add),
        }
    }

    /// Whether this is an associative (storage-only) type.
    pub fn is_hashmap(&self) -> bool {
        matches!(self, Self::HashMap(..))
    }

    /// Whether the value fits in a single word.
    pub fn is_word_type(&self) -> bool {
        matches!(
            self,
            Self::Uint(_) | Self::Int(_) | Self::Bool | Self::Address | Self::FixedBytes(_)
        )
    }

    /// The ABI type used when this value crosses a call boundary.
    ///
    /// Returns `None` for types with no ABI representation (`HashMap`).
    pub fn abi_type(&self) -> Option<DynSolType> {
        Some(match self {
            Self::Uint(bits) => DynSolType::Uint(*bits),
            Self::Int(bits) => DynSolType::Int(*bits),
            Self::Bool => DynSolType::Bool,
            Self::Address => DynSolType::Address,
            Self::FixedBytes(n) => DynSolType::FixedBytes(*n),
            Self::Bytes(_) => DynSolType::Bytes,
            Self::String(_) => DynSolType::String,
            Self::StaticArray(inner, n) => DynSolType::FixedArray(Box::new(inner.abi_type()?), *n),
            Self::DynArray(inner, _) => DynSolType::Array(Box::new(inner.abi_type()?)),
            Self::Tuple(members) => {
                DynSolType::Tuple(members.iter().map(Self::abi_type).collect::<Option<_>>()?)
            }
            Self::Struct { fields, .. } => DynSolType::Tuple(
                fields.iter().map(|(_, ty)| ty.abi_type()).collect::<Option<_>>()?,
            ),
            Self::HashMap(..) => return None,
        })
    }

    /// Canonical ABI name, as used in selectors (`uint256`, `(bytes,address[])`).
    pub fn selector_name(&self) -> Option<String> {
        self.abi_type().map(|ty| ty.sol_type_name().into_owned())
    }

    /// Check that `value` is a legal inhabitant of this type.
    ///
    /// Stricter than ABI shape matching: integer widths and declared maximum lengths of
    /// bytestrings and dynamic arrays are enforced.
    pub fn validate_value(&self, value: &DynSolValue) -> Result<(), String> {
        match (self, value) {
            (Self::Uint(bits), DynSolValue::Uint(v, _)) => check_uint(*v, *bits),
            (Self::Int(bits), DynSolValue::Int(v, _)) => check_int(*v, *bits),
            (Self::Bool, DynSolValue::Bool(_)) | (Self::Address, DynSolValue::Address(_)) => {
                Ok(())
            }
            (Self::FixedBytes(n), DynSolValue::FixedBytes(word, size)) => {
                if size != n || word[*n..].iter().any(|b| *b != 0) {
                    return Err(format!("value does not fit in bytes{n}"));
                }
                Ok(())
            }
            (Self::Bytes(max), DynSolValue::Bytes(b)) => check_len(b.len(), *max, self),
            (Self::String(max), DynSolValue::String(s)) => check_len(s.len(), *max, self),
            (Self::StaticArray(inner, n), DynSolValue::FixedArray(items)) => {
                if items.len() != *n {
                    return Err(format!("expected {n} elements for {self}, got {}", items.len()));
                }
                items.iter().try_for_each(|item| inner.validate_value(item))
            }
            (Self::DynArray(inner, max), DynSolValue::Array(items)) => {
                check_len(items.len(), *max, self)?;
                items.iter().try_for_each(|item| inner.validate_value(item))
            }
            (Self::Tuple(members), DynSolValue::Tuple(items)) => {
                check_arity(members.len(), items.len(), self)?;
                members.iter().zip(items).try_for_each(|(ty, item)| ty.validate_value(item))
            }
            (Self::Struct { fields, .. }, DynSolValue::Tuple(items)) => {
                check_arity(fields.len(), items.len(), self)?;
                fields.iter().zip(items).try_for_each(|((_, ty), item)| ty.validate_value(item))
            }
            (ty, value) => Err(format!("expected {ty}, got {}", describe(value))),
        }
    }
}

/// Check that `value` fits in `bits` unsigned bits.
pub fn check_uint(value: U256, bits: usize) -> Result<(), String> {
    if value.bit_len() > bits {
        return Err(format!("{value} does not fit in uint{bits}"));
    }
    Ok(())
}

/// Check that `value` fits in `bits` signed bits (two's complement).
pub fn check_int(value: I256, bits: usize) -> Result<(), String> {
    if bits >= 256 {
        return Ok(());
    }
    let high = value.asr(bits - 1);
    if high != I256::ZERO && high != I256::MINUS_ONE {
        return Err(format!("{value} does not fit in int{bits}"));
    }
    Ok(())
}

fn check_len(len: usize, max: usize, ty: &VarType) -> Result<(), String> {
    if len > max {
        return Err(format!("length {len} exceeds the bound of {ty}"));
    }
    Ok(())
}

fn check_arity(expected: usize, got: usize, ty: &VarType) -> Result<(), String> {
    if expected != got {
        return Err(format!("expected {expected} members for {ty}, got {got}"));
    }
    Ok(())
}

fn describe(value: &DynSolValue) -> String {
    value.sol_type_name().map(|n| n.into_owned()).unwrap_or_else(|| "value".to_string())
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Int(bits) => write!(f, "int{bits}"),
            Self::Bool => f.write_str("bool"),
            Self::Address => f.write_str("address"),
            Self::FixedBytes(n) => write!(f, "bytes{n}"),
            Self::Bytes(max) => write!(f, "Bytes[{max}]"),
            Self::String(max) => write!(f, "String[{max}]"),
            Self::StaticArray(inner, n) => write!(f, "{inner}[{n}]"),
            Self::DynArray(inner, max) => write!(f, "DynArray[{inner}, {max}]"),
            Self::Tuple(members) => write!(f, "({})", members.iter().join(", ")),
            Self::Struct { name, fields } => write!(
                f,
                "{name}{{{}}}",
                fields.iter().map(|(field, ty)| format!("{field}: {ty}")).join(", ")
            ),
            Self::HashMap(key, value) => write!(f, "HashMap[{key}, {value}]"),
        }
    }
}

impl From<VarType> for String {
    fn from(ty: VarType) -> Self {
        ty.to_string()
    }
}

impl TryFrom<String> for VarType {
    type Error = VarTypeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for VarType {
    type Err = VarTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser { input: s, pos: 0 };
        let ty = parser.parse_type().map_err(|reason| parser.error(reason))?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(parser.error(format!("unexpected trailing input at offset {}", parser.pos)));
        }
        Ok(ty)
    }
}

/// Recursive-descent parser over the textual type grammar.
struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl TypeParser<'_> {
    fn error(&self, reason: String) -> VarTypeParseError {
        VarTypeParseError { input: self.input.to_string(), reason }
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected `{c}` at offset {}", self.pos))
        }
    }

    fn ident(&mut self) -> Result<&str, String> {
        self.skip_ws();
        let len = self
            .rest()
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map_or(self.rest().len(), |(i, _)| i);
        if len == 0 {
            return Err(format!("expected a type name at offset {}", self.pos));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.input[start..self.pos])
    }

    fn number(&mut self) -> Result<usize, String> {
        self.skip_ws();
        let len = self.rest().chars().take_while(char::is_ascii_digit).count();
        if len == 0 {
            return Err(format!("expected a number at offset {}", self.pos));
        }
        let start = self.pos;
        self.pos += len;
        self.input[start..self.pos].parse().map_err(|e| format!("bad number: {e}"))
    }

    fn parse_type(&mut self) -> Result<VarType, String> {
        let mut ty = self.parse_base()?;
        while self.eat('[') {
            let n = self.number()?;
            self.expect(']')?;
            ty = VarType::StaticArray(Box::new(ty), n);
        }
        Ok(ty)
    }

    fn parse_base(&mut self) -> Result<VarType, String> {
        if self.eat('(') {
            let mut members = Vec::new();
            if !self.eat(')') {
                loop {
                    members.push(self.parse_type()?);
                    if self.eat(')') {
                        break;
                    }
                    self.expect(',')?;
                }
            }
            return Ok(VarType::Tuple(members));
        }

        let ident = self.ident()?.to_string();
        match ident.as_str() {
            "bool" => Ok(VarType::Bool),
            "address" => Ok(VarType::Address),
            "HashMap" => {
                self.expect('[')?;
                let key = self.parse_type()?;
                self.expect(',')?;
                let value = self.parse_type()?;
                self.expect(']')?;
                Ok(VarType::HashMap(Box::new(key), Box::new(value)))
            }
            "DynArray" => {
                self.expect('[')?;
                let inner = self.parse_type()?;
                self.expect(',')?;
                let max = self.number()?;
                self.expect(']')?;
                Ok(VarType::DynArray(Box::new(inner), max))
            }
            "Bytes" | "String" => {
                self.expect('[')?;
                let max = self.number()?;
                self.expect(']')?;
                Ok(if ident == "Bytes" { VarType::Bytes(max) } else { VarType::String(max) })
            }
            _ => {
                if let Some(ty) = parse_elementary(&ident)? {
                    return Ok(ty);
                }
                if self.eat('{') {
                    return self.parse_struct_body(ident);
                }
                Err(format!("unknown type `{ident}`"))
            }
        }
    }

    fn parse_struct_body(&mut self, name: String) -> Result<VarType, String> {
        let mut fields = Vec::new();
        if !self.eat('}') {
            loop {
                let field = self.ident()?.to_string();
                self.expect(':')?;
                fields.push((field, self.parse_type()?));
                if self.eat('}') {
                    break;
                }
                self.expect(',')?;
            }
        }
        Ok(VarType::Struct { name, fields })
    }
}

/// `uintN`, `intN`, `bytesN`. Returns `Ok(None)` when `ident` is not elementary.
fn parse_elementary(ident: &str) -> Result<Option<VarType>, String> {
    let (prefix, digits) = match ident.find(|c: char| c.is_ascii_digit()) {
        Some(i) => ident.split_at(i),
        None => {
            return match ident {
                "uint" | "int" | "bytes" | "string" => {
                    Err(format!("`{ident}` needs an explicit size or bound"))
                }
                _ => Ok(None),
            }
        }
    };
    let Ok(size) = digits.parse::<usize>() else { return Ok(None) };
    match prefix {
        "uint" | "int" => {
            if size == 0 || size > 256 || size % 8 != 0 {
                return Err(format!("invalid integer width {size}"));
            }
            Ok(Some(if prefix == "uint" { VarType::Uint(size) } else { VarType::Int(size) }))
        }
        "bytes" => {
            if size == 0 || size > 32 {
                return Err(format!("invalid fixed bytes size {size}"));
            }
            Ok(Some(VarType::FixedBytes(size)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};

    fn parse(s: &str) -> VarType {
        s.parse().unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_parse_elementary_types() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(parse("uint256"), VarType::Uint(256));
        assert_eq!(parse("int8"), VarType::Int(8));
        assert_eq!(parse("bool"), VarType::Bool);
        assert_eq!(parse("address"), VarType::Address);
        assert_eq!(parse("bytes32"), VarType::FixedBytes(32));
        assert_eq!(parse("Bytes[64]"), VarType::Bytes(64));
        assert_eq!(parse("String[10]"), VarType::String(10));
    }

    #[test]
    fn test_parse_composite_types() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(
            parse("HashMap[address, HashMap[uint256, uint256]]"),
            VarType::HashMap(
                Box::new(VarType::Address),
                Box::new(VarType::HashMap(
                    Box::new(VarType::Uint(256)),
                    Box::new(VarType::Uint(256))
                ))
            )
        );
        assert_eq!(
            parse("DynArray[uint8, 3]"),
            VarType::DynArray(Box::new(VarType::Uint(8)), 3)
        );
        // Outer dimension is the last one written.
        assert_eq!(
            parse("uint256[3][2]"),
            VarType::StaticArray(Box::new(VarType::StaticArray(Box::new(VarType::Uint(256)), 3)), 2)
        );
        assert_eq!(parse("(uint256, bool)"), VarType::Tuple(vec![VarType::Uint(256), VarType::Bool]));
        assert_eq!(
            parse("Point{x: int128, y: int128}"),
            VarType::Struct {
                name: "Point".into(),
                fields: vec![("x".into(), VarType::Int(128)), ("y".into(), VarType::Int(128))]
            }
        );
    }

    #[test]
    fn test_display_parses_back() {
        crate::logging::ensure_test_logging(None);
        for s in [
            "HashMap[address, HashMap[uint256, uint256]]",
            "DynArray[Bytes[5], 2]",
            "(uint256, String[3])[2]",
            "Point{x: int128, y: int128}",
        ] {
            assert_eq!(parse(s).to_string(), s);
        }
    }

    #[test]
    fn test_parse_errors() {
        crate::logging::ensure_test_logging(None);
        assert!("uint7".parse::<VarType>().is_err());
        assert!("bytes33".parse::<VarType>().is_err());
        assert!("string".parse::<VarType>().is_err());
        assert!("HashMap[address uint256]".parse::<VarType>().is_err());
        assert!("uint256 extra".parse::<VarType>().is_err());
        assert!("Unknown".parse::<VarType>().is_err());
    }

    #[test]
    fn test_memory_bytes_required() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(parse("uint256").memory_bytes_required(), 32);
        assert_eq!(parse("Bytes[1]").memory_bytes_required(), 64);
        assert_eq!(parse("String[33]").memory_bytes_required(), 96);
        assert_eq!(parse("DynArray[uint256, 3]").memory_bytes_required(), 128);
        assert_eq!(parse("(uint256, address)[2]").memory_bytes_required(), 128);

        let unbounded = VarType::DynArray(Box::new(VarType::Bytes(usize::MAX)), usize::MAX);
        assert_eq!(unbounded.memory_bytes_required(), usize::MAX);
        assert_eq!(VarType::String(usize::MAX).memory_bytes_required(), usize::MAX);
    }

    #[test]
    fn test_selector_names() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(parse("DynArray[Bytes[5], 2]").selector_name().unwrap(), "bytes[]");
        assert_eq!(parse("Point{x: int128, y: address}").selector_name().unwrap(), "(int128,address)");
        assert_eq!(parse("HashMap[address, uint256]").selector_name(), None);
    }

    #[test]
    fn test_validate_value_bounds() {
        crate::logging::ensure_test_logging(None);
        let ty = parse("uint8");
        assert!(ty.validate_value(&DynSolValue::Uint(U256::from(255), 8)).is_ok());
        assert!(ty.validate_value(&DynSolValue::Uint(U256::from(256), 8)).is_err());

        let ty = parse("int8");
        assert!(ty.validate_value(&DynSolValue::Int(I256::try_from(-128).unwrap(), 8)).is_ok());
        assert!(ty.validate_value(&DynSolValue::Int(I256::try_from(128).unwrap(), 8)).is_err());

        let ty = parse("Bytes[3]");
        assert!(ty.validate_value(&DynSolValue::Bytes(vec![1, 2, 3])).is_ok());
        assert!(ty.validate_value(&DynSolValue::Bytes(vec![1, 2, 3, 4])).is_err());

        let ty = parse("bytes2");
        let mut word = B256::ZERO;
        word[0] = 0xab;
        assert!(ty.validate_value(&DynSolValue::FixedBytes(word, 2)).is_ok());
        word[5] = 1;
        assert!(ty.validate_value(&DynSolValue::FixedBytes(word, 2)).is_err());

        assert!(parse("(uint256, address)")
            .validate_value(&DynSolValue::Tuple(vec![DynSolValue::Address(Address::ZERO)]))
            .is_err());
    }

    #[test]
    fn test_serde_uses_textual_form() {
        crate::logging::ensure_test_logging(None);
        let ty = parse("HashMap[address, DynArray[uint256, 4]]");
        let json = serde_json::to_string(&ty).unwrap();
        assert_eq!(json, "\"HashMap[address, DynArray[uint256, 4]]\"");
        let back: VarType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }
}
