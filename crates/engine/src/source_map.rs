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

//! Program-counter to source attribution.

use std::collections::{BTreeMap, HashMap};

use pmdb_common::types::CallFrame;
use serde::{Deserialize, Serialize};

/// AST node types that mark an explicit user failure.
pub const ASSERT_AST_TYPES: &[&str] = &["Assert", "Raise"];

/// AST node type of a function definition.
pub const FUNCTION_AST_TYPE: &str = "FunctionDef";

/// One node of the compiler's AST, flattened with a parent link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstNode {
    /// Unique id, referenced by the pc map
    pub node_id: u64,
    /// Node kind (`FunctionDef`, `Assert`, `Raise`, ...)
    pub ast_type: String,
    /// First line, 1-based
    pub lineno: usize,
    /// Column on the first line, 0-based
    pub col_offset: usize,
    /// Last line, 1-based
    pub end_lineno: usize,
    /// Column after the node on the last line
    pub end_col_offset: usize,
    /// Enclosing node
    #[serde(default)]
    pub parent: Option<u64>,
    /// Declared name, for named nodes such as functions
    #[serde(default)]
    pub name: Option<String>,
}

/// Compiler-emitted maps from runtime program counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapData {
    /// pc -> AST node id
    #[serde(default)]
    pub pc_pos_map: BTreeMap<usize, u64>,
    /// pc -> compiler error detail (`user revert with reason`, `safeadd`, ...)
    #[serde(default)]
    pub error_map: BTreeMap<usize, String>,
}

/// Lookup tables built once per artifact.
#[derive(Debug, Clone, Default)]
pub struct SourcePositionIndex {
    pc_nodes: HashMap<usize, u64>,
    error_map: HashMap<usize, String>,
    nodes: HashMap<u64, AstNode>,
}

impl SourcePositionIndex {
    /// Index the compiler's maps and AST.
    pub fn new(source_map: &SourceMapData, ast: &[AstNode]) -> Self {
        Self {
            pc_nodes: source_map.pc_pos_map.iter().map(|(pc, id)| (*pc, *id)).collect(),
            error_map: source_map.error_map.clone().into_iter().collect(),
            nodes: ast.iter().map(|node| (node.node_id, node.clone())).collect(),
        }
    }

    /// Look up an AST node by id.
    pub fn node(&self, id: u64) -> Option<&AstNode> {
        self.nodes.get(&id)
    }

    /// The AST node the frame's failure is attributed to.
    ///
    /// A synthetic override wins. Otherwise the visited pcs are scanned most recent first,
    /// and the first pc whose node resolves in the AST is used.
    pub fn source_at(&self, frame: &CallFrame) -> Option<&AstNode> {
        if let Some(id) = frame.source_override.as_ref().and_then(|o| o.node_id) {
            return self.node(id);
        }
        frame
            .visited_pcs
            .iter()
            .rev()
            .find_map(|pc| self.pc_nodes.get(pc).and_then(|id| self.nodes.get(id)))
    }

    /// The compiler error detail for the frame's failure.
    pub fn error_detail_at<'a>(&'a self, frame: &'a CallFrame) -> Option<&'a str> {
        if let Some(detail) =
            frame.source_override.as_ref().and_then(|o| o.error_detail.as_deref())
        {
            return Some(detail);
        }
        frame.visited_pcs.iter().rev().find_map(|pc| self.error_map.get(pc).map(String::as_str))
    }

    /// The node and its ancestors, innermost first.
    pub fn ancestors<'a>(&'a self, node: &'a AstNode) -> impl Iterator<Item = &'a AstNode> + 'a {
        let mut next = Some(node);
        // Bounded by the node count in case parent links form a cycle.
        let mut budget = self.nodes.len() + 1;
        std::iter::from_fn(move || {
            let current = next.take()?;
            budget = budget.checked_sub(1)?;
            next = current.parent.and_then(|id| self.nodes.get(&id));
            Some(current)
        })
    }

    /// Closest node (including `node` itself) whose type is one of `ast_types`.
    pub fn find_ancestor<'a>(&'a self, node: &'a AstNode, ast_types: &[&str]) -> Option<&'a AstNode> {
        self.ancestors(node).find(|n| ast_types.contains(&n.ast_type.as_str()))
    }

    /// The function definition enclosing `node`.
    pub fn enclosing_function<'a>(&'a self, node: &'a AstNode) -> Option<&'a AstNode> {
        self.find_ancestor(node, &[FUNCTION_AST_TYPE])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::Address;
    use pmdb_common::types::SourceOverride;

    pub(crate) fn node(id: u64, ast_type: &str, line: usize, parent: Option<u64>) -> AstNode {
        AstNode {
            node_id: id,
            ast_type: ast_type.to_string(),
            lineno: line,
            col_offset: 4,
            end_lineno: line,
            end_col_offset: 20,
            parent,
            name: None,
        }
    }

    fn index() -> SourcePositionIndex {
        let mut fn_node = node(1, "FunctionDef", 2, None);
        fn_node.name = Some("foo".into());
        let ast = vec![fn_node, node(2, "Assert", 3, Some(1)), node(3, "Compare", 3, Some(2))];
        let source_map = SourceMapData {
            pc_pos_map: [(10, 3), (20, 99), (30, 1)].into_iter().collect(),
            error_map: [(10, "user assert".to_string())].into_iter().collect(),
        };
        SourcePositionIndex::new(&source_map, &ast)
    }

    fn frame(pcs: &[usize]) -> CallFrame {
        CallFrame::call(Address::ZERO, Address::ZERO, vec![]).with_visited_pcs(pcs.to_vec())
    }

    #[test]
    fn test_lookup_scans_most_recent_first() {
        pmdb_common::logging::ensure_test_logging(None);
        let index = index();
        assert_eq!(index.source_at(&frame(&[30, 10, 5])).unwrap().node_id, 3);
        assert_eq!(index.source_at(&frame(&[10, 30])).unwrap().node_id, 1);
        // pc 20 maps to a node missing from the AST and is skipped.
        assert_eq!(index.source_at(&frame(&[10, 20])).unwrap().node_id, 3);
        assert!(index.source_at(&frame(&[5])).is_none());

        assert_eq!(index.error_detail_at(&frame(&[10, 30])), Some("user assert"));
        assert_eq!(index.error_detail_at(&frame(&[30])), None);
    }

    #[test]
    fn test_override_takes_precedence() {
        pmdb_common::logging::ensure_test_logging(None);
        let index = index();
        let f = frame(&[10]).with_source_override(SourceOverride {
            node_id: Some(1),
            error_detail: Some("safeadd".into()),
        });
        assert_eq!(index.source_at(&f).unwrap().node_id, 1);
        assert_eq!(index.error_detail_at(&f), Some("safeadd"));
    }

    #[test]
    fn test_ancestor_queries() {
        pmdb_common::logging::ensure_test_logging(None);
        let index = index();
        let leaf = index.node(3).unwrap();
        let ids: Vec<u64> = index.ancestors(leaf).map(|n| n.node_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(index.find_ancestor(leaf, ASSERT_AST_TYPES).unwrap().node_id, 2);
        assert_eq!(index.enclosing_function(leaf).unwrap().name.as_deref(), Some("foo"));

        // A node counts as its own ancestor.
        let assert_node = index.node(2).unwrap();
        assert_eq!(index.find_ancestor(assert_node, ASSERT_AST_TYPES).unwrap().node_id, 2);
    }
}
