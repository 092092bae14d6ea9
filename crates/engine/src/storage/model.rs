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

//! Typed view of a contract's storage and immutables.

use std::fmt;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, B256, U256};
use itertools::Itertools;
use pmdb_common::types::{
    is_zero_value, AliasResolver, PreimageDatabase, StorageReader, StorageWriteLog, TypedValue,
    VarType,
};
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    decode_layout, unwind_storage_key, Contract, FrameDetail, InspectorConfig, StorageBytes,
    VariableDecl,
};

/// A decoded mapping key.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingKey {
    /// Address key with a known display name
    Alias(String),
    /// Key decoded with its declared type
    Value(TypedValue),
    /// Key bytes that could not be decoded (e.g. the hash of a bytestring key)
    Raw(Bytes),
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alias(name) => f.write_str(name),
            Self::Value(value) => write!(f, "{value}"),
            Self::Raw(bytes) => write!(f, "{bytes}"),
        }
    }
}

/// Entries recovered for one mapping, in the order their keys were first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTree {
    entries: Vec<(MappingKey, StorageValue)>,
}

impl MappingTree {
    /// An empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top-level keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry was recovered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level entries
    pub fn iter(&self) -> impl Iterator<Item = (&MappingKey, &StorageValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Entry under `key`
    pub fn get(&self, key: &MappingKey) -> Option<&StorageValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Entry whose key renders as `key`
    pub fn get_by_display(&self, key: &str) -> Option<&StorageValue> {
        self.entries.iter().find(|(k, _)| k.to_string() == key).map(|(_, v)| v)
    }

    /// Set the value at `path`, creating intermediate mappings as needed.
    pub fn insert_path(&mut self, path: &[MappingKey], value: StorageValue) {
        let Some((first, rest)) = path.split_first() else { return };
        let index = match self.entries.iter().position(|(k, _)| k == first) {
            Some(index) => index,
            None => {
                self.entries.push((first.clone(), StorageValue::Mapping(Self::new())));
                self.entries.len() - 1
            }
        };
        let slot = &mut self.entries[index].1;
        if rest.is_empty() {
            *slot = value;
            return;
        }
        if !matches!(slot, StorageValue::Mapping(_)) {
            *slot = StorageValue::Mapping(Self::new());
        }
        if let StorageValue::Mapping(inner) = slot {
            inner.insert_path(rest, value);
        }
    }
}

impl fmt::Display for MappingTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.entries.iter().map(|(k, v)| format!("{k}: {v}")).join(", "))
    }
}

impl Serialize for MappingTree {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(&key.to_string(), value)?;
        }
        map.end()
    }
}

/// Decoded contents of a storage variable or immutable.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageValue {
    /// A plain value
    Value(TypedValue),
    /// Recovered mapping entries
    Mapping(MappingTree),
    /// Larger than the configured truncation limit; not read
    Truncated,
    /// Could not be decoded
    Invalid(String),
}

impl StorageValue {
    /// The plain value, if this is one.
    pub fn as_value(&self) -> Option<&TypedValue> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The mapping, if this is one.
    pub fn as_mapping(&self) -> Option<&MappingTree> {
        match self {
            Self::Mapping(tree) => Some(tree),
            _ => None,
        }
    }
}

impl fmt::Display for StorageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Mapping(tree) => write!(f, "{tree}"),
            Self::Truncated => f.write_str("<truncated>"),
            Self::Invalid(reason) => write!(f, "<invalid: {reason}>"),
        }
    }
}

impl Serialize for StorageValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Value(value) => value.to_json().serialize(serializer),
            Self::Mapping(tree) => tree.serialize(serializer),
            Self::Truncated => serializer.serialize_str("<truncated>"),
            Self::Invalid(reason) => json!({ "invalid": reason }).serialize(serializer),
        }
    }
}

/// Written keys of one account, each with its unwound path.
type WrittenPaths = Vec<(U256, Vec<Bytes>)>;

/// Reads storage variables of deployed contracts through the recorded execution state.
pub struct StorageModel<'a, R: ?Sized, A: ?Sized> {
    reader: &'a R,
    preimages: &'a PreimageDatabase,
    writes: &'a StorageWriteLog,
    aliases: &'a A,
    config: &'a InspectorConfig,
}

impl<'a, R, A> StorageModel<'a, R, A>
where
    R: StorageReader + ?Sized,
    A: AliasResolver + ?Sized,
{
    /// Bind the state sources.
    pub fn new(
        reader: &'a R,
        preimages: &'a PreimageDatabase,
        writes: &'a StorageWriteLog,
        aliases: &'a A,
        config: &'a InspectorConfig,
    ) -> Self {
        Self { reader, preimages, writes, aliases, config }
    }

    /// Every storage variable of `contract`, in declaration order.
    pub fn dump(&self, contract: &Contract) -> FrameDetail<StorageValue> {
        let mut paths: Option<WrittenPaths> = None;
        let mut detail = FrameDetail::new("storage");
        for (decl, slot) in contract.artifact.storage_variables() {
            let value = if decl.typ.is_hashmap() {
                let paths = paths.get_or_insert_with(|| self.written_paths(contract.address));
                self.mapping(paths, contract.address, &decl.typ, slot)
            } else {
                self.value_at(contract.address, &decl.typ, U256::from(slot))
            };
            detail.insert(decl.name.clone(), value);
        }
        detail
    }

    /// The current value of one storage variable.
    pub fn variable(&self, contract: &Contract, decl: &VariableDecl, slot: u64) -> StorageValue {
        if decl.typ.is_hashmap() {
            let paths = self.written_paths(contract.address);
            self.mapping(&paths, contract.address, &decl.typ, slot)
        } else {
            self.value_at(contract.address, &decl.typ, U256::from(slot))
        }
    }

    fn truncated(&self, ty: &VarType) -> bool {
        self.config.storage_truncate_limit.is_some_and(|limit| ty.memory_bytes_required() > limit)
    }

    fn value_at(&self, address: Address, ty: &VarType, slot: U256) -> StorageValue {
        if self.truncated(ty) {
            return StorageValue::Truncated;
        }
        match decode_layout(ty, &StorageBytes::new(self.reader, address, slot), 0) {
            Ok(raw) => StorageValue::Value(TypedValue::new(raw, ty.clone())),
            Err(err) => {
                warn!(%address, %slot, %ty, %err, "failed to decode storage value");
                StorageValue::Invalid(err.to_string())
            }
        }
    }

    fn written_paths(&self, address: Address) -> WrittenPaths {
        self.writes
            .slots(address)
            .filter_map(|key| {
                let digest = B256::from(key.to_be_bytes::<32>());
                match unwind_storage_key(self.preimages, digest, self.config.max_unwind_depth) {
                    Ok(path) => Some((key, path)),
                    Err(err) => {
                        warn!(%address, %err, "skipping storage key");
                        None
                    }
                }
            })
            .collect()
    }

    fn mapping(&self, paths: &WrittenPaths, address: Address, ty: &VarType, slot: u64) -> StorageValue {
        let root = U256::from(slot).to_be_bytes::<32>();
        let mut tree = MappingTree::new();
        for (key, path) in paths {
            let Some((root_word, keys)) = path.split_first() else { continue };
            if root_word[..] != root[..] {
                continue;
            }
            let Some((keys, leaf_ty)) = self.decode_path(ty, keys) else {
                debug!(%address, %key, "written key does not address a mapping leaf");
                continue;
            };
            // Oversize leaves are not read, so they cannot be told apart from zero ones.
            if self.truncated(leaf_ty) {
                debug!(%address, %key, %leaf_ty, "skipping oversize mapping entry");
                continue;
            }
            let leaf = match decode_layout(leaf_ty, &StorageBytes::new(self.reader, address, *key), 0) {
                Ok(raw) if is_zero_value(&raw) => continue,
                Ok(raw) => StorageValue::Value(TypedValue::new(raw, leaf_ty.clone())),
                Err(err) => {
                    warn!(%address, %key, %err, "failed to decode mapping entry");
                    StorageValue::Invalid(err.to_string())
                }
            };
            tree.insert_path(&keys, leaf);
        }
        StorageValue::Mapping(tree)
    }

    /// Decode the key components of a path through nested mappings, returning the keys and
    /// the leaf type. `None` when the path is longer or shorter than the nesting.
    fn decode_path<'t>(
        &self,
        mut ty: &'t VarType,
        raw_keys: &[Bytes],
    ) -> Option<(Vec<MappingKey>, &'t VarType)> {
        let mut keys = Vec::with_capacity(raw_keys.len());
        for raw in raw_keys {
            let VarType::HashMap(key_ty, value_ty) = ty else { return None };
            keys.push(self.mapping_key(key_ty, raw));
            ty = value_ty;
        }
        (!ty.is_hashmap()).then_some((keys, ty))
    }

    fn mapping_key(&self, key_ty: &VarType, raw: &Bytes) -> MappingKey {
        if !key_ty.is_word_type() {
            return MappingKey::Raw(raw.clone());
        }
        match decode_layout(key_ty, &raw[..], 0) {
            Ok(DynSolValue::Address(address)) => match self.aliases.alias(address) {
                Some(name) => MappingKey::Alias(name),
                None => MappingKey::Value(TypedValue::new(
                    DynSolValue::Address(address),
                    key_ty.clone(),
                )),
            },
            Ok(value) => MappingKey::Value(TypedValue::new(value, key_ty.clone())),
            Err(_) => MappingKey::Raw(raw.clone()),
        }
    }
}

/// Every immutable of `contract`, decoded from its data section, in declaration order.
pub fn dump_immutables(contract: &Contract) -> FrameDetail<StorageValue> {
    let data = contract.data_section();
    let mut detail = FrameDetail::new("immutables");
    for (decl, offset) in contract.artifact.immutables() {
        let value = match decode_layout(&decl.typ, data, offset) {
            Ok(raw) => StorageValue::Value(TypedValue::new(raw, decl.typ.clone())),
            Err(err) => {
                warn!(contract = %contract.name(), immutable = %decl.name, %err, "failed to decode immutable");
                StorageValue::Invalid(err.to_string())
            }
        };
        detail.insert(decl.name.clone(), value);
    }
    detail
}
