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

//! Compiler output for one contract.
//!
//! A [`CompiledArtifact`] is loaded once from the compiler's JSON and then shared
//! read-only (`Arc`) by every instance deployed from it. Derived lookup tables (the
//! source position index, the event selector table, per-function calldata signatures)
//! are built lazily on first use.

use std::{collections::HashMap, fs, path::Path};

use alloy_json_abi::{Function, InternalType, Param, StateMutability};
use alloy_primitives::{keccak256, Bytes, Selector, B256};
use eyre::{Result, WrapErr};
use itertools::Itertools;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use pmdb_common::types::VarType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{selector, tuple_signature, AbiError, AstNode, SourceMapData, SourcePositionIndex};

/// Where a declared variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableLocation {
    /// Persistent storage, starting at `slot`
    Storage {
        /// First storage slot
        slot: u64,
    },
    /// Deploy-time constant, at `offset` in the runtime code's data section
    Immutable {
        /// Byte offset into the data section
        offset: usize,
    },
    /// Compile-time constant, inlined into the code
    Constant,
}

/// A module-level variable declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Variable name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub typ: VarType,
    /// Storage slot, data-section offset, or neither
    pub location: VariableLocation,
}

/// A named, typed function or event argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDecl {
    /// Argument name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub typ: VarType,
}

/// Data location of a frame variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLocation {
    /// Call memory
    Memory,
    /// Persistent storage
    Storage,
    /// Transient storage
    Transient,
    /// Call data
    Calldata,
    /// Code
    Code,
}

/// A local variable of a function's memory frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameVar {
    /// Variable name
    pub name: String,
    /// Where the variable lives
    pub location: DataLocation,
    /// Byte position within its location
    pub pos: usize,
    /// Declared type
    #[serde(rename = "type")]
    pub typ: VarType,
}

/// Memory frame layout of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// First byte of the frame
    pub frame_start: usize,
    /// Frame length in bytes
    pub frame_size: usize,
    /// Variables allocated in the frame, in declaration order
    #[serde(default)]
    pub frame_vars: Vec<FrameVar>,
}

/// Function visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Callable from outside
    #[default]
    External,
    /// Callable only from within the contract
    Internal,
}

/// Function state mutability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Reads nothing from state
    Pure,
    /// Reads state
    View,
    /// Writes state, rejects value
    #[default]
    Nonpayable,
    /// Writes state, accepts value
    Payable,
}

/// Special roles a function can have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Ordinary function, dispatched by selector
    #[default]
    Regular,
    /// `__init__`
    Constructor,
    /// `__default__`
    Fallback,
}

/// Selector and argument types for a call with a given number of keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignature {
    /// 4-byte function selector
    pub selector: Selector,
    /// Canonical argument tuple, e.g. `(uint256,bytes)`
    pub args_signature: String,
    /// Declared argument types, positional first
    pub arg_types: Vec<VarType>,
}

#[derive(Debug, Default)]
struct SignatureCache(RwLock<HashMap<usize, CallSignature>>);

impl Clone for SignatureCache {
    fn clone(&self) -> Self {
        Self(RwLock::new(self.0.read().clone()))
    }
}

/// A function declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    /// Function name
    pub name: String,
    /// Visibility
    #[serde(default)]
    pub visibility: Visibility,
    /// State mutability
    #[serde(default)]
    pub mutability: Mutability,
    /// Required arguments, in declaration order
    #[serde(default)]
    pub positional_args: Vec<ArgDecl>,
    /// Arguments with default values, in declaration order
    #[serde(default)]
    pub keyword_args: Vec<ArgDecl>,
    /// Declared return type
    #[serde(default)]
    pub return_type: Option<VarType>,
    /// Memory frame layout
    #[serde(default)]
    pub frame_info: Option<FrameInfo>,
    /// Constructor, fallback or regular
    #[serde(default)]
    pub kind: FunctionKind,
    #[serde(skip)]
    signature_cache: SignatureCache,
}

impl FunctionDecl {
    /// A regular external function with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::default(),
            mutability: Mutability::default(),
            positional_args: Vec::new(),
            keyword_args: Vec::new(),
            return_type: None,
            frame_info: None,
            kind: FunctionKind::default(),
            signature_cache: SignatureCache::default(),
        }
    }

    /// Number of required arguments.
    pub fn n_positional_args(&self) -> usize {
        self.positional_args.len()
    }

    /// Number of arguments including defaulted ones.
    pub fn n_total_args(&self) -> usize {
        self.positional_args.len() + self.keyword_args.len()
    }

    /// Signature for a call that supplies the first `num_kwargs` defaulted arguments.
    pub fn call_signature(&self, num_kwargs: usize) -> Result<CallSignature, AbiError> {
        if let Some(signature) = self.signature_cache.0.read().get(&num_kwargs) {
            return Ok(signature.clone());
        }

        let arg_types: Vec<VarType> = self
            .positional_args
            .iter()
            .chain(self.keyword_args.iter().take(num_kwargs))
            .map(|arg| arg.typ.clone())
            .collect();
        let args_signature = tuple_signature(&arg_types)?;
        let signature = CallSignature {
            selector: selector(&format!("{}{args_signature}", self.name)),
            args_signature,
            arg_types,
        };
        debug!(function = %self.name, num_kwargs, signature = %signature.args_signature, "cached call signature");

        self.signature_cache.0.write().insert(num_kwargs, signature.clone());
        Ok(signature)
    }

    /// JSON ABI entry for the full signature (all defaulted arguments included).
    pub fn to_json_abi(&self) -> Result<Function, AbiError> {
        let inputs = self
            .positional_args
            .iter()
            .chain(&self.keyword_args)
            .map(|arg| json_param(&arg.name, &arg.typ))
            .collect::<Result<_, _>>()?;
        let outputs = match &self.return_type {
            None => Vec::new(),
            Some(VarType::Tuple(members)) => {
                members.iter().map(|ty| json_param("", ty)).collect::<Result<_, _>>()?
            }
            Some(ty) => vec![json_param("", ty)?],
        };
        let state_mutability = match self.mutability {
            Mutability::Pure => StateMutability::Pure,
            Mutability::View => StateMutability::View,
            Mutability::Nonpayable => StateMutability::NonPayable,
            Mutability::Payable => StateMutability::Payable,
        };
        Ok(Function { name: self.name.clone(), inputs, outputs, state_mutability })
    }
}

fn json_param(name: &str, ty: &VarType) -> Result<Param, AbiError> {
    let invalid = || AbiError::InvalidSignature(ty.to_string());

    // Peel array dimensions so tuples nested in arrays become `tuple[..]` with components.
    let mut suffix = String::new();
    let mut base = ty;
    loop {
        match base {
            VarType::StaticArray(inner, n) => {
                suffix.insert_str(0, &format!("[{n}]"));
                base = inner;
            }
            VarType::DynArray(inner, _) => {
                suffix.insert_str(0, "[]");
                base = inner;
            }
            _ => break,
        }
    }

    let (ty_name, components, internal_type) = match base {
        VarType::Tuple(members) => (
            format!("tuple{suffix}"),
            members.iter().map(|m| json_param("", m)).collect::<Result<Vec<_>, _>>()?,
            None,
        ),
        VarType::Struct { name: struct_name, fields } => (
            format!("tuple{suffix}"),
            fields.iter().map(|(field, m)| json_param(field, m)).collect::<Result<Vec<_>, _>>()?,
            Some(InternalType::Struct { contract: None, ty: format!("{struct_name}{suffix}") }),
        ),
        _ => (ty.selector_name().ok_or_else(invalid)?, Vec::new(), None),
    };
    Param::new(name, &ty_name, components, internal_type).map_err(|_| invalid())
}

/// An event argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInput {
    /// Argument name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub typ: VarType,
    /// Whether the argument is carried in a topic
    #[serde(default)]
    pub indexed: bool,
}

/// An event declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDecl {
    /// Event name
    pub name: String,
    /// Arguments, in declaration order
    #[serde(default)]
    pub inputs: Vec<EventInput>,
}

impl EventDecl {
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> Result<String, AbiError> {
        let types: Vec<VarType> = self.inputs.iter().map(|input| input.typ.clone()).collect();
        Ok(format!("{}{}", self.name, tuple_signature(&types)?))
    }

    /// Topic-0 of logs emitted for this event.
    pub fn event_id(&self) -> Result<B256, AbiError> {
        Ok(keccak256(self.signature()?.as_bytes()))
    }
}

/// Everything the compiler tells us about one contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledArtifact {
    /// Contract name
    pub contract_name: String,
    /// Compiler version string
    #[serde(default)]
    pub compiler_version: String,
    /// Original source text
    #[serde(default)]
    pub source_code: String,
    /// Init code
    #[serde(default)]
    pub bytecode: Bytes,
    /// Runtime code, without the immutables data section
    #[serde(default)]
    pub bytecode_runtime: Bytes,
    /// pc -> source node and pc -> error detail maps
    #[serde(default)]
    pub source_map: SourceMapData,
    /// Flattened AST
    #[serde(default)]
    pub ast: Vec<AstNode>,
    /// Module-level variables
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Functions
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
    /// Events
    #[serde(default)]
    pub events: Vec<EventDecl>,
    /// Size of the immutables data section appended to the runtime code
    #[serde(default)]
    pub immutable_section_bytes: usize,

    #[serde(skip)]
    source_index: OnceCell<SourcePositionIndex>,
    #[serde(skip)]
    event_table: OnceCell<HashMap<B256, usize>>,
}

impl CompiledArtifact {
    /// An empty artifact. Fill the public fields before first use; derived tables are
    /// built from the contents at that point.
    pub fn new(contract_name: impl Into<String>, compiler_version: impl Into<String>) -> Self {
        Self {
            contract_name: contract_name.into(),
            compiler_version: compiler_version.into(),
            ..Default::default()
        }
    }

    /// Parse an artifact from its JSON form.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).wrap_err("failed to parse compiled artifact")
    }

    /// Load an artifact from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read artifact {}", path.display()))?;
        Self::from_json_str(&content)
    }

    /// pc/AST lookup tables.
    pub fn source_index(&self) -> &SourcePositionIndex {
        self.source_index.get_or_init(|| SourcePositionIndex::new(&self.source_map, &self.ast))
    }

    /// The declared event whose topic-0 is `event_id`.
    pub fn event_for(&self, event_id: &B256) -> Option<&EventDecl> {
        let table = self.event_table.get_or_init(|| {
            self.events
                .iter()
                .enumerate()
                .filter_map(|(i, event)| match event.event_id() {
                    Ok(id) => Some((id, i)),
                    Err(err) => {
                        debug!(event = %event.name, %err, "event has no ABI signature");
                        None
                    }
                })
                .collect()
        });
        table.get(event_id).and_then(|i| self.events.get(*i))
    }

    /// Function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Variable by name.
    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Storage variables with their slots, in declaration order.
    pub fn storage_variables(&self) -> impl Iterator<Item = (&VariableDecl, u64)> {
        self.variables.iter().filter_map(|v| match v.location {
            VariableLocation::Storage { slot } => Some((v, slot)),
            _ => None,
        })
    }

    /// Immutables with their data-section offsets, in declaration order.
    pub fn immutables(&self) -> impl Iterator<Item = (&VariableDecl, usize)> {
        self.variables.iter().filter_map(|v| match v.location {
            VariableLocation::Immutable { offset } => Some((v, offset)),
            _ => None,
        })
    }

    /// Names of the externally callable functions.
    pub fn external_functions(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .filter(|f| f.visibility == Visibility::External)
            .map(|f| f.name.as_str())
            .sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::hex;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "contract_name": "Token",
            "compiler_version": "0.3.10",
            "bytecode_runtime": "0x6001",
            "source_map": {"pc_pos_map": {"12": 2}, "error_map": {"12": "user revert with reason"}},
            "ast": [{"node_id": 2, "ast_type": "Raise", "lineno": 1, "col_offset": 0,
                     "end_lineno": 1, "end_col_offset": 5}],
            "variables": [
                {"name": "owner", "type": "address", "location": {"storage": {"slot": 0}}},
                {"name": "balances", "type": "HashMap[address, uint256]",
                 "location": {"storage": {"slot": 1}}},
                {"name": "CAP", "type": "uint256", "location": {"immutable": {"offset": 0}}},
                {"name": "NAME", "type": "String[5]", "location": "constant"}
            ],
            "functions": [{
                "name": "transfer",
                "mutability": "nonpayable",
                "positional_args": [{"name": "to", "type": "address"}],
                "keyword_args": [{"name": "amount", "type": "uint256"},
                                 {"name": "memo", "type": "Bytes[32]"}],
                "return_type": "bool"
            }],
            "events": [{"name": "Transfer", "inputs": [
                {"name": "sender", "type": "address", "indexed": true},
                {"name": "receiver", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256"}
            ]}],
            "immutable_section_bytes": 32
        })
    }

    fn sample() -> CompiledArtifact {
        CompiledArtifact::from_json_str(&sample_json().to_string()).unwrap()
    }

    #[test]
    fn test_load_from_json() {
        pmdb_common::logging::ensure_test_logging(None);
        let artifact = sample();
        assert_eq!(artifact.contract_name, "Token");
        assert_eq!(&artifact.bytecode_runtime[..], &[0x60, 0x01]);
        assert_eq!(artifact.storage_variables().map(|(v, s)| (v.name.as_str(), s)).collect::<Vec<_>>(),
            vec![("owner", 0), ("balances", 1)]);
        assert_eq!(artifact.immutables().count(), 1);
        assert_eq!(artifact.variable("NAME").unwrap().location, VariableLocation::Constant);
        assert_eq!(artifact.source_index().node(2).unwrap().ast_type, "Raise");
        assert_eq!(artifact.external_functions().collect::<Vec<_>>(), vec!["transfer"]);
    }

    #[test]
    fn test_event_table() {
        pmdb_common::logging::ensure_test_logging(None);
        let artifact = sample();
        let transfer_id = B256::from(hex!(
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        ));
        assert_eq!(artifact.event_for(&transfer_id).unwrap().name, "Transfer");
        assert!(artifact.event_for(&B256::ZERO).is_none());
    }

    #[test]
    fn test_call_signature_by_kwarg_count() {
        pmdb_common::logging::ensure_test_logging(None);
        let artifact = sample();
        let transfer = artifact.function("transfer").unwrap();
        assert_eq!(transfer.n_total_args(), 3);

        let sig = transfer.call_signature(1).unwrap();
        assert_eq!(sig.args_signature, "(address,uint256)");
        assert_eq!(sig.selector.0, hex!("a9059cbb"));

        let sig = transfer.call_signature(2).unwrap();
        assert_eq!(sig.args_signature, "(address,uint256,bytes)");
        // Served from the cache the second time.
        assert_eq!(transfer.call_signature(2).unwrap(), sig);
    }

    #[test]
    fn test_json_abi_export() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut f = FunctionDecl::new("move_points");
        f.mutability = Mutability::View;
        f.positional_args.push(ArgDecl {
            name: "pts".into(),
            typ: "DynArray[Point{x: int128, y: int128}, 4]".parse().unwrap(),
        });
        f.return_type = Some("(uint256, bool)".parse().unwrap());

        let abi = f.to_json_abi().unwrap();
        assert_eq!(abi.signature(), "move_points((int128,int128)[])");
        assert_eq!(abi.inputs[0].ty, "tuple[]");
        assert_eq!(abi.inputs[0].components[1].name, "y");
        assert_eq!(abi.outputs.len(), 2);
        assert_eq!(abi.state_mutability, StateMutability::View);
    }
}
