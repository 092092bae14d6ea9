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

//! Post-mortem introspection of a finished execution.
//!
//! The [`Introspector`] owns everything execution left behind (world-state storage, the
//! keccak preimages observed, the storage-write log, address labels) together with the
//! compiled contracts deployed in that world. It never drives execution itself: callers
//! hand it an [`ExecutionTrace`] after the fact.
//!
//! # Workflow Overview
//!
//! 1. **Registration**: Attach compiled artifacts to deployed addresses
//! 2. **State**: Supply the storage reader, preimages and write log recorded by the VM
//! 3. **Failure analysis**: Reconstruct stack traces and match them against expectations
//! 4. **State inspection**: Dump storage, mappings and immutables
//! 5. **Marshaling**: Encode calldata, decode return values and event logs
//!
//! # Stack trace reconstruction
//!
//! Starting from a failed frame, each contract frame contributes an [`ErrorDetail`].
//! When a frame failed because a sub-call or creation failed (see
//! [`EXTERNAL_CALL_ERRORS`] and [`CREATE_ERRORS`]), its last sub-call is followed as long
//! as that sub-call failed too. Frames of unregistered contracts are reported opaquely and
//! always followed. The result is ordered innermost first.

use std::{collections::HashMap, slice, sync::Arc};

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes};
use itertools::Itertools;
use pmdb_common::types::{
    AliasResolver, CallFrame, ExecutionTrace, LogEntry, NoAliases, PreimageDatabase,
    StorageReader, StorageWriteLog, TypedValue, VarType,
};
use tracing::{debug, trace};

use crate::{
    decode, decode_layout, decode_log, dump_immutables, match_failure, AbiError, Contract,
    DecodedLog, ErrorDetail, EventDecodeError, Expectation, FrameDetail, InspectorConfig,
    IntrospectError, Member, RawEvent, StackTrace, StorageModel, StorageValue,
};

/// Compiler error details of a frame that failed because its sub-call failed.
pub const EXTERNAL_CALL_ERRORS: &[&str] = &["external call failed", "returndatasize too small"];

/// Compiler error details of a frame that failed because a contract creation failed.
pub const CREATE_ERRORS: &[&str] = &["create failed", "create2 failed"];

/// Post-mortem view over one execution environment.
pub struct Introspector<R> {
    config: InspectorConfig,
    reader: R,
    contracts: HashMap<Address, Arc<Contract>>,
    aliases: Box<dyn AliasResolver + Send + Sync>,
    preimages: PreimageDatabase,
    storage_writes: StorageWriteLog,
}

impl<R: StorageReader> Introspector<R> {
    /// An introspector over `reader` with default configuration and no recorded state.
    pub fn new(reader: R) -> Self {
        Self {
            config: InspectorConfig::default(),
            reader,
            contracts: HashMap::new(),
            aliases: Box::new(NoAliases),
            preimages: PreimageDatabase::new(),
            storage_writes: StorageWriteLog::new(),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: InspectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given keccak preimages
    pub fn with_preimages(mut self, preimages: PreimageDatabase) -> Self {
        self.preimages = preimages;
        self
    }

    /// Use the given storage-write log
    pub fn with_storage_writes(mut self, writes: StorageWriteLog) -> Self {
        self.storage_writes = writes;
        self
    }

    /// Resolve address labels through `aliases`
    pub fn with_aliases(mut self, aliases: impl AliasResolver + Send + Sync + 'static) -> Self {
        self.aliases = Box::new(aliases);
        self
    }

    /// Current configuration
    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    /// Storage backend
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Recorded preimages, for appending
    pub fn preimages_mut(&mut self) -> &mut PreimageDatabase {
        &mut self.preimages
    }

    /// Recorded storage writes, for appending
    pub fn storage_writes_mut(&mut self) -> &mut StorageWriteLog {
        &mut self.storage_writes
    }

    /// Register a deployed contract; replaces any previous registration at its address.
    pub fn register_contract(&mut self, contract: Contract) -> Arc<Contract> {
        debug!(name = %contract.name(), address = %contract.address, "registered contract");
        let contract = Arc::new(contract);
        self.contracts.insert(contract.address, contract.clone());
        contract
    }

    /// Contract registered at `address`
    pub fn contract(&self, address: Address) -> Option<&Arc<Contract>> {
        self.contracts.get(&address)
    }

    fn lookup_contract(&self, address: Address) -> Result<&Arc<Contract>, IntrospectError> {
        self.contract(address).ok_or(IntrospectError::UnknownContract(address))
    }

    /// Typed storage access bound to this introspector's state.
    pub fn storage_model(&self) -> StorageModel<'_, R, dyn AliasResolver + Send + Sync> {
        StorageModel::new(
            &self.reader,
            &self.preimages,
            &self.storage_writes,
            self.aliases.as_ref(),
            &self.config,
        )
    }

    /// Every storage variable of `contract`.
    pub fn dump_storage(&self, contract: &Contract) -> FrameDetail<StorageValue> {
        self.storage_model().dump(contract)
    }

    /// Every immutable of `contract`.
    pub fn dump_immutables(&self, contract: &Contract) -> FrameDetail<StorageValue> {
        dump_immutables(contract)
    }

    /// Current value of the storage variable or immutable `name`; `None` for functions,
    /// constants and unknown names.
    pub fn member_value(&self, contract: &Contract, name: &str) -> Option<StorageValue> {
        match contract.member(name)? {
            Member::Callable(_) => None,
            Member::Storage { decl, slot } => Some(self.storage_model().variable(contract, decl, slot)),
            Member::Immutable { decl, offset } => {
                Some(match decode_layout(&decl.typ, contract.data_section(), offset) {
                    Ok(raw) => StorageValue::Value(TypedValue::new(raw, decl.typ.clone())),
                    Err(err) => StorageValue::Invalid(err.to_string()),
                })
            }
        }
    }

    /// Display string of `contract`: name, address, compiler version, creator and, when
    /// configured, the storage dump.
    pub fn contract_repr(&self, contract: &Contract) -> String {
        let mut repr = format!(
            "<{} at {}, compiled with vyper-{}>",
            contract.name(),
            contract.address,
            contract.artifact.compiler_version
        );
        if let Some(creator) = contract.created_from {
            repr.push_str(&format!(" (created by {creator})"));
        }
        if self.config.dump_storage_in_repr {
            let dump = self.dump_storage(contract);
            if !dump.is_empty() {
                repr.push_str(&format!("\n{dump}"));
            }
        }
        repr
    }

    /// Stack trace of the trace's root call, which must have failed.
    pub fn reconstruct_stack_trace(
        &self,
        trace: &ExecutionTrace,
    ) -> Result<StackTrace, IntrospectError> {
        let root = trace.root().ok_or(IntrospectError::EmptyTrace)?;
        self.stack_trace_at(trace, root.id)
    }

    /// Stack trace of the failed frame `frame_id`.
    pub fn stack_trace_at(
        &self,
        trace: &ExecutionTrace,
        frame_id: usize,
    ) -> Result<StackTrace, IntrospectError> {
        let mut frame = trace.get(frame_id).ok_or(IntrospectError::UnknownFrame(frame_id))?;
        if !frame.is_error() {
            return Err(IntrospectError::NotFailed(frame_id));
        }

        let mut chain = Vec::new();
        while let Some(vm_error) = frame.error.clone() {
            let follow = match self.contracts.get(&frame.code_address) {
                Some(contract) => {
                    let repr = frame
                        .contract_repr_before_revert
                        .clone()
                        .unwrap_or_else(|| self.contract_repr(contract));
                    let detail = ErrorDetail::from_frame(&contract.artifact, frame, vm_error, repr);
                    let follow = detail.error_detail.as_deref().is_some_and(|d| {
                        EXTERNAL_CALL_ERRORS.contains(&d) || CREATE_ERRORS.contains(&d)
                    });
                    chain.push(detail);
                    follow
                }
                None => {
                    trace!(address = %frame.code_address, "frame of unregistered contract");
                    chain.push(ErrorDetail::opaque(frame, vm_error));
                    true
                }
            };
            if !follow {
                break;
            }
            match trace.last_child(frame.id) {
                Some(child) if child.is_error() => frame = child,
                _ => break,
            }
        }

        chain.reverse();
        debug!(frames = chain.len(), "reconstructed stack trace");
        Ok(StackTrace::new(chain))
    }

    /// Reconstruct the root failure and check it against `expectation`.
    pub fn check_failure(
        &self,
        trace: &ExecutionTrace,
        expectation: &Expectation,
    ) -> Result<(), IntrospectError> {
        let stack_trace = self.reconstruct_stack_trace(trace)?;
        Ok(match_failure(&stack_trace, expectation)?)
    }

    /// Calldata for calling `function` on the contract at `address`.
    pub fn encode_call(
        &self,
        address: Address,
        function: &str,
        args: &[DynSolValue],
        kwargs: &[(&str, DynSolValue)],
    ) -> Result<Bytes, IntrospectError> {
        Ok(self.lookup_contract(address)?.encode_call(function, args, kwargs)?)
    }

    /// Decode the root call's output as `return_type`.
    ///
    /// A failed root call surfaces as [`IntrospectError::Reverted`] with its stack trace.
    /// A non-tuple return type is decoded as a one-element tuple and unwrapped.
    pub fn decode_return_value(
        &self,
        trace: &ExecutionTrace,
        return_type: Option<&VarType>,
    ) -> Result<Option<TypedValue>, IntrospectError> {
        let root = trace.root().ok_or(IntrospectError::EmptyTrace)?;
        if root.is_error() {
            return Err(self.stack_trace_at(trace, root.id)?.into());
        }
        let Some(ty) = return_type else { return Ok(None) };

        let raw = match ty {
            VarType::Tuple(members) => DynSolValue::Tuple(decode(members, &root.output)?),
            _ => decode(slice::from_ref(ty), &root.output)?.pop().ok_or_else(|| {
                AbiError::Decoding { signature: ty.to_string(), reason: "no value".to_string() }
            })?,
        };
        Ok(Some(TypedValue::new(raw, ty.clone())))
    }

    /// Decode `entry` with the artifact of its emitter, keeping it raw when the emitter is
    /// unregistered or the log matches none of its events.
    ///
    /// A log that matches a declared event but does not decode against it is an error.
    pub fn decode_event_log(&self, entry: &LogEntry) -> Result<DecodedLog, EventDecodeError> {
        let Some(contract) = self.contracts.get(&entry.log.address) else {
            return Ok(DecodedLog::Raw(RawEvent::from(entry)));
        };
        match decode_log(&contract.artifact, entry) {
            Ok(event) => Ok(DecodedLog::Event(event)),
            Err(EventDecodeError::Unknown(err)) => {
                debug!(log_id = entry.log_id, %err, "keeping log undecoded");
                Ok(DecodedLog::Raw(RawEvent::from(entry)))
            }
            Err(err) => Err(err),
        }
    }

    /// Logs of the root call in emission order.
    ///
    /// With `include_child_logs` set, logs of successful sub-calls are included; logs of
    /// failed sub-calls were discarded by the VM and are skipped with their whole subtree.
    pub fn get_logs(&self, trace: &ExecutionTrace) -> Result<Vec<DecodedLog>, EventDecodeError> {
        let Some(root) = trace.root() else { return Ok(Vec::new()) };
        let mut frames: Vec<&CallFrame> = vec![root];
        if self.config.include_child_logs {
            let mut stack: Vec<&CallFrame> =
                trace.get_children(root.id).into_iter().filter(|f| !f.is_error()).collect();
            while let Some(frame) = stack.pop() {
                frames.push(frame);
                stack.extend(trace.get_children(frame.id).into_iter().filter(|f| !f.is_error()));
            }
        }
        frames
            .iter()
            .flat_map(|frame| &frame.logs)
            .sorted_by_key(|entry| entry.log_id)
            .map(|entry| self.decode_event_log(entry))
            .collect()
    }
}
