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

use std::fmt;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{hex, Address};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

use super::VarType;

/// A decoded value paired with the type the compiler declared for it.
///
/// The raw value only knows its ABI shape; the declared type restores what the ABI loses
/// (struct member names, bytestring bounds, the distinction between a tuple and a struct).
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    /// The decoded value
    pub raw: DynSolValue,
    /// The type declared in the contract source
    pub declared_type: VarType,
}

impl TypedValue {
    /// Pair `raw` with its declared type.
    pub fn new(raw: DynSolValue, declared_type: VarType) -> Self {
        Self { raw, declared_type }
    }

    /// Whether the value is the zero value of its type (empty for dynamic types).
    pub fn is_zero(&self) -> bool {
        is_zero_value(&self.raw)
    }

    /// Render with the given formatting options.
    pub fn format_with(&self, ctx: &ValueFormatterContext) -> String {
        self.format_value(ctx)
    }

    /// JSON form of the raw value: integers as decimal strings, byte data as hex.
    pub fn to_json(&self) -> JsonValue {
        value_to_json(&self.raw, Some(&self.declared_type))
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_value(&ValueFormatterContext::default()))
    }
}

impl Serialize for TypedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TypedValue", 2)?;
        state.serialize_field("type", &self.declared_type)?;
        state.serialize_field("value", &self.to_json())?;
        state.end()
    }
}

/// Whether `value` is the zero value of its type.
///
/// Static values are zero when every word is zero; bytestrings, strings and dynamic arrays
/// are zero when empty.
pub fn is_zero_value(value: &DynSolValue) -> bool {
    match value {
        DynSolValue::Bool(b) => !b,
        DynSolValue::Int(v, _) => v.is_zero(),
        DynSolValue::Uint(v, _) => v.is_zero(),
        DynSolValue::Address(a) => a.is_zero(),
        DynSolValue::FixedBytes(word, _) => word.is_zero(),
        DynSolValue::Function(f) => f.iter().all(|b| *b == 0),
        DynSolValue::Bytes(b) => b.is_empty(),
        DynSolValue::String(s) => s.is_empty(),
        DynSolValue::Array(items) => items.is_empty(),
        DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            items.iter().all(is_zero_value)
        }
        DynSolValue::CustomStruct { tuple, .. } => tuple.iter().all(is_zero_value),
    }
}

fn value_to_json(value: &DynSolValue, ty: Option<&VarType>) -> JsonValue {
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Int(v, _) => json!(v.to_string()),
        DynSolValue::Uint(v, _) => json!(v.to_string()),
        DynSolValue::Address(a) => json!(a.to_checksum(None)),
        DynSolValue::FixedBytes(word, size) => json!(hex::encode_prefixed(&word[..*size])),
        DynSolValue::Function(f) => json!(hex::encode_prefixed(f.as_slice())),
        DynSolValue::Bytes(b) => json!(hex::encode_prefixed(b)),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            let inner = element_type(ty);
            JsonValue::Array(items.iter().map(|item| value_to_json(item, inner)).collect())
        }
        DynSolValue::Tuple(items) => match ty {
            Some(VarType::Struct { fields, .. }) if fields.len() == items.len() => {
                JsonValue::Object(
                    fields
                        .iter()
                        .zip(items)
                        .map(|((name, ty), item)| (name.clone(), value_to_json(item, Some(ty))))
                        .collect(),
                )
            }
            Some(VarType::Tuple(members)) if members.len() == items.len() => JsonValue::Array(
                members.iter().zip(items).map(|(ty, item)| value_to_json(item, Some(ty))).collect(),
            ),
            _ => JsonValue::Array(items.iter().map(|item| value_to_json(item, None)).collect()),
        },
        DynSolValue::CustomStruct { prop_names, tuple, .. } => JsonValue::Object(
            prop_names
                .iter()
                .zip(tuple)
                .map(|(name, item)| (name.clone(), value_to_json(item, None)))
                .collect(),
        ),
    }
}

fn element_type(ty: Option<&VarType>) -> Option<&VarType> {
    match ty {
        Some(VarType::StaticArray(inner, _) | VarType::DynArray(inner, _)) => Some(inner),
        _ => None,
    }
}

/// Trait for rendering decoded values into human-readable strings.
pub trait ValueFormatter {
    /// Format the value.
    fn format_value(&self, ctx: &ValueFormatterContext) -> String;

    /// Format the value's type (`uint256`, `Bytes[64]`, `Point`).
    fn format_type(&self) -> String;
}

/// Options for [`ValueFormatter`].
#[derive(Default)]
pub struct ValueFormatterContext {
    /// Maps addresses to display names; unresolved addresses print as hex
    pub resolve_address: Option<Box<dyn Fn(Address) -> Option<String> + Send + Sync>>,
    /// Prefix scalars with their type, e.g. `uint8(7)`
    pub with_ty: bool,
    /// Abbreviate long arrays, bytes, strings and addresses
    pub shorten_long: bool,
}

impl fmt::Debug for ValueFormatterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFormatterContext")
            .field("resolve_address", &self.resolve_address.is_some())
            .field("with_ty", &self.with_ty)
            .field("shorten_long", &self.shorten_long)
            .finish()
    }
}

impl ValueFormatterContext {
    /// Default options: plain values, no abbreviation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Include type prefixes.
    pub fn with_ty(mut self, with_ty: bool) -> Self {
        self.with_ty = with_ty;
        self
    }

    /// Abbreviate long values.
    pub fn shorten_long(mut self, shorten_long: bool) -> Self {
        self.shorten_long = shorten_long;
        self
    }

    /// Resolve addresses through `resolver` before falling back to hex.
    pub fn with_address_resolver(
        mut self,
        resolver: impl Fn(Address) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.resolve_address = Some(Box::new(resolver));
        self
    }
}

impl ValueFormatter for TypedValue {
    fn format_value(&self, ctx: &ValueFormatterContext) -> String {
        format_typed(&self.raw, Some(&self.declared_type), ctx)
    }

    fn format_type(&self) -> String {
        match &self.declared_type {
            VarType::Struct { name, .. } => name.clone(),
            ty => ty.to_string(),
        }
    }
}

fn format_typed(value: &DynSolValue, ty: Option<&VarType>, ctx: &ValueFormatterContext) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),

        DynSolValue::Int(n, bits) => {
            if ctx.with_ty {
                format!("int{bits}({n})")
            } else {
                n.to_string()
            }
        }

        DynSolValue::Uint(n, bits) => {
            if ctx.with_ty {
                format!("uint{bits}({n})")
            } else {
                n.to_string()
            }
        }

        DynSolValue::Address(addr) => {
            if let Some(label) = ctx.resolve_address.as_ref().and_then(|f| f(*addr)) {
                return label;
            }
            let addr_str = addr.to_checksum(None);
            let addr_str = if ctx.shorten_long {
                format!("{}...{}", &addr_str[..8], &addr_str[addr_str.len() - 6..])
            } else {
                addr_str
            };
            if ctx.with_ty {
                format!("address({addr_str})")
            } else {
                addr_str
            }
        }

        DynSolValue::Function(func) => hex::encode_prefixed(func.as_slice()),

        DynSolValue::FixedBytes(word, size) => {
            let hex = hex::encode_prefixed(&word[..*size]);
            if ctx.with_ty {
                format!("bytes{size}({hex})")
            } else {
                hex
            }
        }

        DynSolValue::Bytes(bytes) => {
            if !ctx.shorten_long || bytes.len() <= 32 {
                hex::encode_prefixed(bytes)
            } else {
                format!("{}...[{} bytes]", hex::encode_prefixed(&bytes[..16]), bytes.len())
            }
        }

        DynSolValue::String(s) => {
            if !ctx.shorten_long || s.chars().count() <= 64 {
                format!("{s:?}")
            } else {
                let head: String = s.chars().take(32).collect();
                format!("{:?}...[{} chars]", head, s.chars().count())
            }
        }

        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            format_array(items, element_type(ty), ctx)
        }

        DynSolValue::Tuple(items) => match ty {
            Some(VarType::Struct { name, fields }) if fields.len() == items.len() => {
                let body = fields
                    .iter()
                    .zip(items)
                    .map(|((field, ty), item)| {
                        format!("{field}: {}", format_typed(item, Some(ty), ctx))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{name}({body})")
            }
            Some(VarType::Tuple(members)) if members.len() == items.len() => {
                let body = members
                    .iter()
                    .zip(items)
                    .map(|(ty, item)| format_typed(item, Some(ty), ctx))
                    .collect::<Vec<_>>();
                format_tuple_body(&body)
            }
            _ => {
                let body =
                    items.iter().map(|item| format_typed(item, None, ctx)).collect::<Vec<_>>();
                format_tuple_body(&body)
            }
        },

        DynSolValue::CustomStruct { name, prop_names, tuple } => {
            let body = prop_names
                .iter()
                .zip(tuple)
                .map(|(field, item)| format!("{field}: {}", format_typed(item, None, ctx)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{name}({body})")
        }
    }
}

fn format_array(items: &[DynSolValue], inner: Option<&VarType>, ctx: &ValueFormatterContext) -> String {
    const MAX_DISPLAY_ITEMS: usize = 5;

    if items.len() <= MAX_DISPLAY_ITEMS || !ctx.shorten_long {
        let shown: Vec<String> = items.iter().map(|v| format_typed(v, inner, ctx)).collect();
        format!("[{}]", shown.join(", "))
    } else {
        let shown: Vec<String> = items.iter().take(3).map(|v| format_typed(v, inner, ctx)).collect();
        format!("[{}, ...[{} items]]", shown.join(", "), items.len())
    }
}

fn format_tuple_body(items: &[String]) -> String {
    match items {
        [single] => format!("({single},)"),
        _ => format!("({})", items.join(", ")),
    }
}
