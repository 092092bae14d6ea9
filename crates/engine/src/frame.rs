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

//! Per-frame failure reports.
//!
//! An [`ErrorDetail`] describes why one call frame failed: the VM error, the compiler's
//! error detail, the developer annotation on the failing line, the source excerpt and the
//! function's local variables at the failure point. A [`StackTrace`] chains the details
//! of the frames a failure propagated through, innermost first.

use std::fmt;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::Address;
use derive_more::Deref;
use itertools::Itertools;
use pmdb_common::types::{CallFrame, TypedValue, VmError};
use serde::{ser::SerializeMap, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::{
    decode_layout, decode_signature, AstNode, CallMemory, CompiledArtifact, DataLocation,
    DevReason, ASSERT_AST_TYPES,
};

/// Selector of the standard `Error(string)` revert payload.
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Named, ordered variables tagged with their owner (a function, `storage`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDetail<V = TypedValue> {
    /// Owner label
    pub owner: String,
    entries: Vec<(String, V)>,
}

impl<V> FrameDetail<V> {
    /// Empty detail for `owner`
    pub fn new(owner: impl Into<String>) -> Self {
        Self { owner: owner.into(), entries: Vec::new() }
    }

    /// Set `name`, keeping its original position if already present.
    pub fn insert(&mut self, name: impl Into<String>, value: V) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Value of `name`
    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Variable names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: fmt::Display> FrameDetail<V> {
    fn write_labeled(&self, f: &mut fmt::Formatter<'_>, label: &str) -> fmt::Result {
        let body = self.entries.iter().map(|(k, v)| format!("{k}={v}")).join(", ");
        write!(f, "<{label}: {body}>")
    }
}

impl<V: fmt::Display> fmt::Display for FrameDetail<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_labeled(f, &self.owner)
    }
}

impl<V: Serialize> Serialize for FrameDetail<V> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Why a frame's locals could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameLookupFailure {
    /// No visited pc maps to a source node
    #[error("no source location for the failing frame")]
    NoSource,

    /// The failing node is not inside a function definition
    #[error("AST node {node_id} is not inside a function")]
    NoEnclosingFunction {
        /// Failing node
        node_id: u64,
    },

    /// The enclosing function is not declared in the artifact
    #[error("function `{0}` is not declared")]
    UnknownFunction(String),

    /// The function carries no frame layout
    #[error("function `{0}` has no frame layout")]
    NoFrameInfo(String),
}

/// Local variables of the function executing in `frame` at its failure point.
///
/// Only memory-resident variables are decoded; reads past the recorded memory image see
/// zeros. Variables that fail to decode are left out.
pub fn decode_frame_locals(
    artifact: &CompiledArtifact,
    frame: &CallFrame,
) -> Result<FrameDetail, FrameLookupFailure> {
    let index = artifact.source_index();
    let node = index.source_at(frame).ok_or(FrameLookupFailure::NoSource)?;
    let no_function = || FrameLookupFailure::NoEnclosingFunction { node_id: node.node_id };
    let fn_name = index
        .enclosing_function(node)
        .and_then(|f| f.name.as_deref())
        .ok_or_else(no_function)?;
    let decl = artifact
        .function(fn_name)
        .ok_or_else(|| FrameLookupFailure::UnknownFunction(fn_name.to_string()))?;
    let info =
        decl.frame_info.as_ref().ok_or_else(|| FrameLookupFailure::NoFrameInfo(fn_name.to_string()))?;

    let memory = CallMemory(&frame.memory);
    let mut detail = FrameDetail::new(fn_name);
    for var in info.frame_vars.iter().filter(|v| v.location == DataLocation::Memory) {
        match decode_layout(&var.typ, &memory, var.pos) {
            Ok(raw) => detail.insert(var.name.clone(), TypedValue::new(raw, var.typ.clone())),
            Err(err) => debug!(function = fn_name, var = %var.name, %err, "skipping local"),
        }
    }
    Ok(detail)
}

/// The source node a failure is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttribution {
    /// The node
    pub node: AstNode,
    /// Name of the enclosing function
    pub function: Option<String>,
    /// Whether the node is, or sits inside, an `assert` or `raise`
    pub in_user_check: bool,
    /// Rendered source lines around the node
    pub excerpt: String,
}

impl SourceAttribution {
    /// Attribute a failure to `node` of `artifact`.
    pub fn new(artifact: &CompiledArtifact, node: &AstNode) -> Self {
        let index = artifact.source_index();
        let function = index.enclosing_function(node).and_then(|f| f.name.clone());
        Self {
            node: node.clone(),
            in_user_check: index.find_ancestor(node, ASSERT_AST_TYPES).is_some(),
            excerpt: render_excerpt(&artifact.source_code, node, function.as_deref()),
            function,
        }
    }
}

/// Source lines around `node` with the failing lines marked and a caret under the start
/// column.
pub fn render_excerpt(source: &str, node: &AstNode, function: Option<&str>) -> String {
    let mut out = match function {
        Some(name) => format!("  function \"{name}\", line {}:{}\n", node.lineno, node.col_offset),
        None => format!("  line {}:{}\n", node.lineno, node.col_offset),
    };

    let lines: Vec<&str> = source.lines().collect();
    let first = node.lineno.saturating_sub(1).max(1);
    let last = node.end_lineno.max(node.lineno).saturating_add(1).min(lines.len());
    let width = last.to_string().len();
    for lineno in first..=last {
        let Some(text) = lines.get(lineno - 1) else { break };
        let marker = if (node.lineno..=node.end_lineno.max(node.lineno)).contains(&lineno) {
            "--->"
        } else {
            "    "
        };
        out.push_str(&format!("  {marker} {lineno:>width$} {text}\n"));
        if lineno == node.lineno {
            out.push_str(&format!("  {}^\n", "-".repeat(marker.len() + width + 2 + node.col_offset)));
        }
    }
    out.truncate(out.trim_end().len());
    out
}

/// Human-readable VM failure: the message of an `Error(string)` payload, otherwise a
/// description of the error.
pub fn pretty_vm_reason(vm_error: &VmError) -> String {
    if let Some(data) = vm_error.revert_data() {
        if let Some(payload) = data.strip_prefix(&ERROR_STRING_SELECTOR) {
            if let Ok(values) = decode_signature("(string)", payload) {
                if let Some(DynSolValue::String(reason)) = values.into_iter().next() {
                    return reason;
                }
            }
        }
    }
    match vm_error {
        VmError::Revert { output } => format!("Revert({output})"),
        VmError::Halt { result } => format!("{result:?}"),
    }
}

/// Why one frame failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    /// Address whose code failed
    pub address: Address,
    /// The VM error
    pub vm_error: VmError,
    /// Display string of the failing contract
    pub contract_repr: String,
    /// Compiler error detail (`user revert with reason`, `safeadd`, ...)
    pub error_detail: Option<String>,
    /// Developer annotation on the failing lines
    pub dev_reason: Option<DevReason>,
    /// Local variables at the failure point
    pub frame_detail: Option<FrameDetail>,
    /// Source attribution
    pub source: Option<SourceAttribution>,
}

impl ErrorDetail {
    /// Detail for a frame of a contract with known compiler output.
    pub fn from_frame(
        artifact: &CompiledArtifact,
        frame: &CallFrame,
        vm_error: VmError,
        contract_repr: String,
    ) -> Self {
        let index = artifact.source_index();
        let error_detail = index.error_detail_at(frame).map(str::to_string);
        let node = index.source_at(frame);
        let dev_reason = node.and_then(|n| {
            DevReason::at_source_location(&artifact.source_code, n.lineno, n.end_lineno)
        });
        let frame_detail = match decode_frame_locals(artifact, frame) {
            Ok(detail) => Some(detail),
            Err(err) => {
                debug!(address = %frame.code_address, %err, "no locals for frame");
                None
            }
        };
        Self {
            address: frame.code_address,
            vm_error,
            contract_repr,
            error_detail,
            dev_reason,
            frame_detail,
            source: node.map(|n| SourceAttribution::new(artifact, n)),
        }
    }

    /// Detail for a frame of a contract with no compiler output.
    pub fn opaque(frame: &CallFrame, vm_error: VmError) -> Self {
        Self {
            address: frame.code_address,
            vm_error,
            contract_repr: format!("<Unknown location in unknown contract {}>", frame.code_address),
            error_detail: None,
            dev_reason: None,
            frame_detail: None,
            source: None,
        }
    }

    /// See [`pretty_vm_reason`].
    pub fn pretty_vm_reason(&self) -> String {
        pretty_vm_reason(&self.vm_error)
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.contract_repr)?;
        if let Some(detail) = &self.error_detail {
            write!(f, " <compiler: {detail}>")?;
        }
        if let Some(source) = &self.source {
            write!(f, "\n{}", source.excerpt)?;
        }
        if let Some(locals) = self.frame_detail.as_ref().filter(|d| !d.is_empty()) {
            f.write_str(" ")?;
            locals.write_labeled(f, "locals")?;
        }
        Ok(())
    }
}

/// Frames a failure propagated through, innermost (where it originated) first.
#[derive(Debug, Clone, Default, PartialEq, Deref)]
pub struct StackTrace(Vec<ErrorDetail>);

impl StackTrace {
    /// Wrap frames ordered innermost first.
    pub fn new(frames: Vec<ErrorDetail>) -> Self {
        Self(frames)
    }

    /// The frame the failure originated in.
    pub fn innermost(&self) -> Option<&ErrorDetail> {
        self.0.first()
    }

    /// The frame the failure surfaced from.
    pub fn outermost(&self) -> Option<&ErrorDetail> {
        self.0.last()
    }

    /// The frame expectations are matched against (the outermost one).
    pub fn last_frame(&self) -> Option<&ErrorDetail> {
        self.outermost()
    }

    /// Frames, innermost first.
    pub fn into_frames(self) -> Vec<ErrorDetail> {
        self.0
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.iter().map(ToString::to_string).join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_signature;
    use alloy_primitives::{address, Bytes, U256};
    use revm::interpreter::InstructionResult;
    use serde_json::json;

    const SOURCE: &str = "counter: uint256

@external
def bump(x: uint256):
    y: uint256 = x + 1
    assert y < 10  # dev: too big
";

    fn artifact() -> CompiledArtifact {
        let json = json!({
            "contract_name": "Counter",
            "compiler_version": "0.3.10",
            "source_code": SOURCE,
            "source_map": {"pc_pos_map": {"40": 3}, "error_map": {"40": "user assert"}},
            "ast": [
                {"node_id": 1, "ast_type": "FunctionDef", "lineno": 4, "col_offset": 0,
                 "end_lineno": 6, "end_col_offset": 30, "name": "bump"},
                {"node_id": 2, "ast_type": "Assert", "lineno": 6, "col_offset": 4,
                 "end_lineno": 6, "end_col_offset": 17, "parent": 1},
                {"node_id": 3, "ast_type": "Compare", "lineno": 6, "col_offset": 11,
                 "end_lineno": 6, "end_col_offset": 17, "parent": 2}
            ],
            "functions": [{
                "name": "bump",
                "positional_args": [{"name": "x", "type": "uint256"}],
                "frame_info": {"frame_start": 64, "frame_size": 64, "frame_vars": [
                    {"name": "x", "location": "calldata", "pos": 4, "type": "uint256"},
                    {"name": "y", "location": "memory", "pos": 64, "type": "uint256"},
                    {"name": "z", "location": "memory", "pos": 96, "type": "uint256"}
                ]}
            }]
        });
        CompiledArtifact::from_json_str(&json.to_string()).unwrap()
    }

    fn failing_frame() -> CallFrame {
        let mut memory = vec![0u8; 96];
        memory[64..96].copy_from_slice(&U256::from(12).to_be_bytes::<32>());
        CallFrame::call(Address::ZERO, address!("0x00000000000000000000000000000000000000c0"), vec![])
            .with_visited_pcs([5, 40])
            .with_memory(memory)
            .with_error(VmError::Revert { output: Bytes::new() })
    }

    #[test]
    fn test_locals_decode_memory_vars_only() {
        pmdb_common::logging::ensure_test_logging(None);
        let locals = decode_frame_locals(&artifact(), &failing_frame()).unwrap();
        assert_eq!(locals.owner, "bump");
        assert_eq!(locals.names().collect::<Vec<_>>(), vec!["y", "z"]);
        assert_eq!(locals.to_string(), "<bump: y=12, z=0>");

        let lost = CallFrame::call(Address::ZERO, Address::ZERO, vec![]).with_visited_pcs([1]);
        assert_eq!(decode_frame_locals(&artifact(), &lost), Err(FrameLookupFailure::NoSource));
    }

    #[test]
    fn test_error_detail_collects_attribution() {
        pmdb_common::logging::ensure_test_logging(None);
        let artifact = artifact();
        let frame = failing_frame();
        let vm_error = frame.error.clone().unwrap();
        let detail = ErrorDetail::from_frame(&artifact, &frame, vm_error, "<Counter>".into());

        assert_eq!(detail.error_detail.as_deref(), Some("user assert"));
        assert_eq!(detail.dev_reason, Some(DevReason::new("dev", "too big")));
        let source = detail.source.as_ref().unwrap();
        assert!(source.in_user_check);
        assert_eq!(source.function.as_deref(), Some("bump"));

        let rendered = detail.to_string();
        assert!(rendered.starts_with("<Counter>\n <compiler: user assert>\n"));
        assert!(rendered.contains("function \"bump\", line 6:11"));
        assert!(rendered.contains("---> 6     assert y < 10  # dev: too big"));
        assert!(rendered.ends_with(" <locals: y=12, z=0>"));
    }

    #[test]
    fn test_excerpt_marks_failing_line() {
        pmdb_common::logging::ensure_test_logging(None);
        let artifact = artifact();
        let node = artifact.source_index().node(2).unwrap();
        let excerpt = render_excerpt(SOURCE, node, None);
        let lines: Vec<&str> = excerpt.lines().collect();
        assert_eq!(lines[0], "  line 6:4");
        assert_eq!(lines[1], "       5     y: uint256 = x + 1");
        assert_eq!(lines[2], "  ---> 6     assert y < 10  # dev: too big");
        assert_eq!(lines[3], "  -----------^");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_pretty_vm_reason() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut payload = ERROR_STRING_SELECTOR.to_vec();
        payload.extend_from_slice(
            &encode_signature("(string)", &[DynSolValue::String("bar".into())]).unwrap(),
        );
        assert_eq!(pretty_vm_reason(&VmError::Revert { output: payload.into() }), "bar");
        assert_eq!(
            pretty_vm_reason(&VmError::Revert { output: Bytes::from_static(&[0xde, 0xad]) }),
            "Revert(0xdead)"
        );
        assert_eq!(
            pretty_vm_reason(&VmError::Halt { result: InstructionResult::OutOfGas }),
            "OutOfGas"
        );
    }

    #[test]
    fn test_stack_trace_order_and_display() {
        pmdb_common::logging::ensure_test_logging(None);
        let frame = failing_frame();
        let vm_error = VmError::Revert { output: Bytes::new() };
        let inner = ErrorDetail::opaque(&frame, vm_error.clone());
        let mut outer = inner.clone();
        outer.contract_repr = "<Outer>".into();
        let trace = StackTrace::new(vec![inner, outer]);

        assert_eq!(trace.len(), 2);
        assert_eq!(trace.last_frame().unwrap().contract_repr, "<Outer>");
        assert!(trace.innermost().unwrap().contract_repr.starts_with("<Unknown location"));
        assert_eq!(
            trace.to_string(),
            format!("{}\n\n\n<Outer>\n", trace.innermost().unwrap().contract_repr)
        );
    }
}
