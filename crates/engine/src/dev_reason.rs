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

//! Developer reason annotations: `# <kind>: <text>` comments on the failing lines.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static REASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<kind>\w+)\s*:\s*(?P<text>.*\S)\s*$").unwrap());

/// A developer-supplied failure annotation, e.g. `# dev: balance too low`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevReason {
    /// Annotation kind (`dev`, `user`, ...)
    pub reason_type: String,
    /// Annotation text
    pub reason_str: String,
}

impl DevReason {
    /// Create a reason
    pub fn new(reason_type: impl Into<String>, reason_str: impl Into<String>) -> Self {
        Self { reason_type: reason_type.into(), reason_str: reason_str.into() }
    }

    /// First annotation found on lines `lineno..=end_lineno` (1-based) of `source`.
    pub fn at_source_location(source: &str, lineno: usize, end_lineno: usize) -> Option<Self> {
        let first = lineno.max(1) - 1;
        let count = end_lineno.max(lineno).saturating_sub(first);
        source.lines().skip(first).take(count).find_map(|line| {
            let comment = comment_of(line)?;
            let captures = REASON_RE.captures(comment)?;
            Some(Self::new(&captures["kind"], &captures["text"]))
        })
    }
}

impl fmt::Display for DevReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", self.reason_type, self.reason_str)
    }
}

/// Text after the first `#` that is not inside a string literal.
fn comment_of(line: &str) -> Option<&str> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '#' => return Some(&line[i + 1..]),
                _ => {}
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r##"@external
def foo(x: uint256):
    assert x > 0  # dev: x must be positive
    raise "no # here"  # user: second
    y: String[5] = "#ok"
"##;

    #[test]
    fn test_parses_annotation_on_line() {
        pmdb_common::logging::ensure_test_logging(None);
        let reason = DevReason::at_source_location(SOURCE, 3, 3).unwrap();
        assert_eq!(reason, DevReason::new("dev", "x must be positive"));
        assert_eq!(reason.to_string(), "<dev: x must be positive>");
    }

    #[test]
    fn test_ignores_hash_inside_strings() {
        pmdb_common::logging::ensure_test_logging(None);
        assert_eq!(
            DevReason::at_source_location(SOURCE, 4, 4).unwrap(),
            DevReason::new("user", "second")
        );
        assert!(DevReason::at_source_location(SOURCE, 5, 5).is_none());
    }

    #[test]
    fn test_multi_line_range_returns_first() {
        pmdb_common::logging::ensure_test_logging(None);
        assert_eq!(DevReason::at_source_location(SOURCE, 1, 5).unwrap().reason_type, "dev");
        assert!(DevReason::at_source_location(SOURCE, 1, 2).is_none());
        assert!(DevReason::at_source_location(SOURCE, 40, 41).is_none());
    }

    #[test]
    fn test_plain_comment_is_not_a_reason() {
        pmdb_common::logging::ensure_test_logging(None);
        assert!(DevReason::at_source_location("x = 1  # just a note\n", 1, 1).is_none());
    }
}
