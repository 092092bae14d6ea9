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

//! Event log decoding.

use std::fmt;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, B256};
use itertools::Itertools;
use pmdb_common::types::{LogEntry, TypedValue, VarType};
use serde::Serialize;
use thiserror::Error;

use crate::{decode, AbiError, CompiledArtifact};

/// A log whose topic-0 matches no event of the emitting contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{address} declares no event with topic {topic0:?}")]
pub struct UnknownEvent {
    /// Emitter
    pub address: Address,
    /// First topic, absent for anonymous logs
    pub topic0: Option<B256>,
}

/// Errors raised while decoding a log against its event declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    /// No matching declaration
    #[error(transparent)]
    Unknown(#[from] UnknownEvent),

    /// Topic count disagrees with the number of indexed arguments
    #[error("event `{event}` expects {expected} topics, got {got}")]
    TopicCount {
        /// Event name
        event: String,
        /// Topics implied by the declaration
        expected: usize,
        /// Topics on the log
        got: usize,
    },

    /// Payload does not decode
    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Position in the transaction's emission order
    pub log_id: u64,
    /// Emitter
    pub address: Address,
    /// Event name
    pub name: String,
    /// Arguments in declaration order
    #[serde(serialize_with = "serialize_args")]
    pub args: Vec<(String, TypedValue)>,
}

fn serialize_args<S>(args: &[(String, TypedValue)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_map(args.iter().map(|(k, v)| (k, v.to_json())))
}

impl Event {
    /// Argument `name`
    pub fn arg(&self, name: &str) -> Option<&TypedValue> {
        self.args.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().map(|(k, v)| format!("{k}={v}")).join(", ");
        write!(f, "{}({args})", self.name)
    }
}

/// A log that could not be decoded, kept as emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    /// Position in the transaction's emission order
    pub log_id: u64,
    /// Emitter
    pub address: Address,
    /// Topics
    pub topics: Vec<B256>,
    /// Unindexed payload
    pub data: Bytes,
}

impl From<&LogEntry> for RawEvent {
    fn from(entry: &LogEntry) -> Self {
        Self {
            log_id: entry.log_id,
            address: entry.log.address,
            topics: entry.log.data.topics().to_vec(),
            data: entry.log.data.data.clone(),
        }
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawEvent(address={}, topics=[{}], data={})",
            self.address,
            self.topics.iter().join(", "),
            self.data
        )
    }
}

/// A log, decoded when possible.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedLog {
    /// Matched a declared event
    Event(Event),
    /// Kept as emitted
    Raw(RawEvent),
}

impl DecodedLog {
    /// Position in the transaction's emission order
    pub fn log_id(&self) -> u64 {
        match self {
            Self::Event(event) => event.log_id,
            Self::Raw(raw) => raw.log_id,
        }
    }

    /// The decoded event, if any
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Raw(_) => None,
        }
    }
}

impl fmt::Display for DecodedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(event) => write!(f, "{event}"),
            Self::Raw(raw) => write!(f, "{raw}"),
        }
    }
}

/// Decode `entry` against the events declared in `artifact`.
///
/// Indexed arguments of word types are decoded from their topic. Indexed arguments of
/// any other type only survive as the keccak-256 of their encoding and are reported as
/// that `bytes32`.
pub fn decode_log(artifact: &CompiledArtifact, entry: &LogEntry) -> Result<Event, EventDecodeError> {
    let topics = entry.log.data.topics();
    let unknown = || UnknownEvent { address: entry.log.address, topic0: topics.first().copied() };
    let decl = topics.first().and_then(|t| artifact.event_for(t)).ok_or_else(unknown)?;

    let indexed = decl.inputs.iter().filter(|input| input.indexed).count();
    if topics.len() != indexed + 1 {
        return Err(EventDecodeError::TopicCount {
            event: decl.name.clone(),
            expected: indexed + 1,
            got: topics.len(),
        });
    }

    let data_types: Vec<VarType> =
        decl.inputs.iter().filter(|input| !input.indexed).map(|input| input.typ.clone()).collect();
    let mut data_values = decode(&data_types, &entry.log.data.data)?.into_iter();
    let mut topic_iter = topics[1..].iter();

    let mut args = Vec::with_capacity(decl.inputs.len());
    for input in &decl.inputs {
        let value = if input.indexed {
            let Some(topic) = topic_iter.next() else { break };
            if input.typ.is_word_type() {
                let raw = decode(std::slice::from_ref(&input.typ), topic.as_slice())?
                    .into_iter()
                    .next()
                    .ok_or_else(unknown)?;
                TypedValue::new(raw, input.typ.clone())
            } else {
                TypedValue::new(DynSolValue::FixedBytes(*topic, 32), VarType::FixedBytes(32))
            }
        } else {
            let Some(raw) = data_values.next() else { break };
            TypedValue::new(raw, input.typ.clone())
        };
        args.push((input.name.clone(), value));
    }

    Ok(Event { log_id: entry.log_id, address: entry.log.address, name: decl.name.clone(), args })
}
