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

use std::ops::Deref;

use alloy_primitives::{hex, Address, Bytes, Log, LogData};
use revm::{
    context::CreateScheme,
    interpreter::{CallScheme, InstructionResult},
};
use serde::{Deserialize, Serialize};

/// Type of call/creation operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Regular call to existing contract
    Call(CallScheme),
    /// Contract creation via CREATE opcode
    Create(CreateScheme),
}

impl CallType {
    fn label(&self) -> &'static str {
        match self {
            Self::Call(CallScheme::Call) => "CALL",
            Self::Call(CallScheme::CallCode) => "CALLCODE",
            Self::Call(CallScheme::DelegateCall) => "DELEGATECALL",
            Self::Call(CallScheme::StaticCall) => "STATICCALL",
            Self::Create(CreateScheme::Create) => "CREATE",
            Self::Create(CreateScheme::Create2 { .. }) => "CREATE2",
            Self::Create(CreateScheme::Custom { .. }) => "CREATE_CUSTOM",
        }
    }
}

/// How a call failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmError {
    /// Explicit REVERT with its payload
    Revert {
        /// Revert payload
        output: Bytes,
    },
    /// Exceptional halt (out of gas, invalid opcode, ...)
    Halt {
        /// Halting instruction result
        result: InstructionResult,
    },
}

impl VmError {
    /// The revert payload, if this was an explicit revert.
    pub fn revert_data(&self) -> Option<&Bytes> {
        match self {
            Self::Revert { output } => Some(output),
            Self::Halt { .. } => None,
        }
    }
}

/// A log entry tagged with its position in the transaction-wide emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Global sequence id, monotone over the whole transaction
    pub log_id: u64,
    /// Emitting address and payload
    pub log: Log<LogData>,
}

/// Source attribution supplied by a synthetic execution path, overriding pc lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOverride {
    /// AST node the failure is attributed to
    pub node_id: Option<u64>,
    /// Compiler error detail to report
    pub error_detail: Option<String>,
}

/// Single frame of the recorded call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Unique ID of this frame (its index in the trace vector)
    pub id: usize,
    /// ID of the parent frame (None for the root call)
    pub parent_id: Option<usize>,
    /// Depth in the call stack (0 = top level)
    pub depth: usize,
    /// Type of operation
    pub call_type: CallType,
    /// Address making the call
    pub caller: Address,
    /// Address whose code ran in this frame
    pub code_address: Address,
    /// Input data / constructor args
    pub input: Bytes,
    /// Raw return data
    pub output: Bytes,
    /// Set when the frame failed
    pub error: Option<VmError>,
    /// Program counters in execution order
    pub visited_pcs: Vec<usize>,
    /// Memory image at the end of the frame
    pub memory: Bytes,
    /// Logs emitted directly by this frame
    pub logs: Vec<LogEntry>,
    /// Attribution from a synthetic execution path
    pub source_override: Option<SourceOverride>,
    /// Display string of the callee captured when it reverted
    pub contract_repr_before_revert: Option<String>,
}

impl CallFrame {
    /// A successful frame with empty execution data. Position fields are assigned when
    /// the frame is pushed into an [`ExecutionTrace`].
    pub fn new(call_type: CallType, caller: Address, code_address: Address, input: Bytes) -> Self {
        Self {
            id: 0,
            parent_id: None,
            depth: 0,
            call_type,
            caller,
            code_address,
            input,
            output: Bytes::new(),
            error: None,
            visited_pcs: Vec::new(),
            memory: Bytes::new(),
            logs: Vec::new(),
            source_override: None,
            contract_repr_before_revert: None,
        }
    }

    /// Shorthand for a plain `CALL` frame.
    pub fn call(caller: Address, code_address: Address, input: impl Into<Bytes>) -> Self {
        Self::new(CallType::Call(CallScheme::Call), caller, code_address, input.into())
    }

    /// Set the return data.
    pub fn with_output(mut self, output: impl Into<Bytes>) -> Self {
        self.output = output.into();
        self
    }

    /// Mark the frame as failed.
    pub fn with_error(mut self, error: VmError) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the visited program counters.
    pub fn with_visited_pcs(mut self, pcs: impl IntoIterator<Item = usize>) -> Self {
        self.visited_pcs = pcs.into_iter().collect();
        self
    }

    /// Set the memory image.
    pub fn with_memory(mut self, memory: impl Into<Bytes>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Append an emitted log.
    pub fn with_log(mut self, log_id: u64, log: Log<LogData>) -> Self {
        self.logs.push(LogEntry { log_id, log });
        self
    }

    /// Attach a synthetic source attribution.
    pub fn with_source_override(mut self, source_override: SourceOverride) -> Self {
        self.source_override = Some(source_override);
        self
    }

    /// Attach the callee's display string captured at revert time.
    pub fn with_contract_repr(mut self, repr: impl Into<String>) -> Self {
        self.contract_repr_before_revert = Some(repr.into());
        self
    }

    /// Whether the frame failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Recorded call tree, stored as an arena in pre-order (root first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    inner: Vec<CallFrame>,
}

impl Deref for ExecutionTrace {
    type Target = Vec<CallFrame>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl IntoIterator for ExecutionTrace {
    type Item = CallFrame;
    type IntoIter = std::vec::IntoIter<CallFrame>;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a ExecutionTrace {
    type Item = &'a CallFrame;
    type IntoIter = std::slice::Iter<'a, CallFrame>;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl ExecutionTrace {
    /// Create a new empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert trace to serde_json::Value
    pub fn to_json_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Add a frame as-is. The caller is responsible for consistent ids and parent links.
    pub fn push(&mut self, frame: CallFrame) {
        self.inner.push(frame);
    }

    /// Add the root frame and return its id.
    pub fn push_root(&mut self, mut frame: CallFrame) -> usize {
        let id = self.inner.len();
        frame.id = id;
        frame.parent_id = None;
        frame.depth = 0;
        self.inner.push(frame);
        id
    }

    /// Add a child of `parent_id` and return its id.
    ///
    /// Children must be pushed in execution order; the last pushed child of a frame is its
    /// last sub-call.
    pub fn push_child(&mut self, parent_id: usize, mut frame: CallFrame) -> usize {
        let id = self.inner.len();
        frame.id = id;
        frame.parent_id = Some(parent_id);
        frame.depth = self.inner.get(parent_id).map_or(0, |p| p.depth + 1);
        self.inner.push(frame);
        id
    }

    /// The root call, if any.
    pub fn root(&self) -> Option<&CallFrame> {
        self.inner.iter().find(|frame| frame.parent_id.is_none())
    }

    /// Get the parent frame of the given frame
    pub fn get_parent(&self, frame_id: usize) -> Option<&CallFrame> {
        self.inner
            .get(frame_id)
            .and_then(|frame| frame.parent_id.and_then(|parent_id| self.inner.get(parent_id)))
    }

    /// Get all direct children of the given frame, in execution order
    pub fn get_children(&self, frame_id: usize) -> Vec<&CallFrame> {
        self.inner.iter().filter(|frame| frame.parent_id == Some(frame_id)).collect()
    }

    /// The most recent sub-call of the given frame
    pub fn last_child(&self, frame_id: usize) -> Option<&CallFrame> {
        self.inner.iter().rev().find(|frame| frame.parent_id == Some(frame_id))
    }

    /// The frame and all frames below it, in pre-order.
    pub fn subtree(&self, frame_id: usize) -> Vec<&CallFrame> {
        let mut out = Vec::new();
        let mut stack = vec![frame_id];
        while let Some(id) = stack.pop() {
            let Some(frame) = self.inner.get(id) else { continue };
            out.push(frame);
            stack.extend(self.get_children(id).iter().rev().map(|child| child.id));
        }
        out
    }

    /// Render the call tree, one frame per line, children indented below their parent.
    pub fn pretty_tree(&self) -> String {
        let mut out = String::new();
        let roots: Vec<&CallFrame> =
            self.inner.iter().filter(|frame| frame.parent_id.is_none()).collect();
        if roots.is_empty() {
            out.push_str("<empty trace>\n");
            return out;
        }
        for (i, root) in roots.iter().enumerate() {
            self.write_frame(&mut out, root, 0, i == roots.len() - 1, &mut Vec::new());
        }
        out
    }

    fn write_frame(
        &self,
        out: &mut String,
        frame: &CallFrame,
        indent_level: usize,
        is_last: bool,
        prefix: &mut Vec<bool>,
    ) {
        for &is_empty in prefix.iter() {
            out.push_str(if is_empty { "    " } else { "│   " });
        }
        if indent_level > 0 {
            out.push_str(if is_last { "└── " } else { "├── " });
        }

        out.push_str(&format!(
            "{:12} {} → {}",
            frame.call_type.label(),
            format_address_short(frame.caller),
            format_address_short(frame.code_address)
        ));
        match &frame.error {
            Some(VmError::Revert { output }) => {
                out.push_str(&format!(" ✗ revert {}", format_data_preview(output)));
            }
            Some(VmError::Halt { result }) => {
                out.push_str(&format!(" ✗ {result:?}"));
            }
            None => out.push_str(" ✓"),
        }
        out.push('\n');

        let padding = "    ".repeat(indent_level + 1);
        if frame.input.len() > 4 {
            out.push_str(&format!("{padding}└ Calldata: {}\n", format_data_preview(&frame.input)));
        }
        for entry in &frame.logs {
            out.push_str(&format!(
                "{padding}• log #{}: {}\n",
                entry.log_id,
                format_event(&entry.log.data)
            ));
        }

        let children = self.get_children(frame.id);
        if indent_level > 0 {
            prefix.push(is_last);
        }
        for (i, child) in children.iter().enumerate() {
            self.write_frame(out, child, indent_level + 1, i == children.len() - 1, prefix);
        }
        if indent_level > 0 {
            prefix.pop();
        }
    }
}

fn format_address_short(addr: Address) -> String {
    if addr == Address::ZERO {
        "0x0".to_string()
    } else {
        format!("{addr:?}")
    }
}

fn format_data_preview(data: &Bytes) -> String {
    if data.len() <= 4 {
        hex::encode_prefixed(data)
    } else {
        format!("{}… [{} bytes]", hex::encode_prefixed(&data[..4]), data.len())
    }
}

fn format_event(event: &LogData) -> String {
    let Some(sig_hash) = event.topics().first() else {
        return format!("anonymous ({} bytes data)", event.data.len());
    };
    format!(
        "{}... ({} indexed, {} bytes data)",
        hex::encode_prefixed(&sig_hash[..4]),
        event.topics().len() - 1,
        event.data.len()
    )
}
