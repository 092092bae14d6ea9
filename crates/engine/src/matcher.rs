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

//! Matching a failure against an expected reason.
//!
//! An expectation is either a bare string, which may match any of the frame's reasons,
//! or a keyword form: `compiler=<detail>`, `vm_error=<message>`, or `<kind>=<text>` for a
//! developer annotation such as `# dev: <text>`.

use std::fmt;

use thiserror::Error;

use crate::{ErrorDetail, StackTrace};

/// Compiler error details for which a developer annotation on an `assert` or `raise` is
/// the actual failure reason.
pub const DEV_REASON_ALLOWED: &[&str] = &["user raise", "user assert"];

/// Compiler error detail of a `raise` or `assert` with a reason string.
pub const USER_REVERT_WITH_REASON: &str = "user revert with reason";

/// Annotation kinds that would shadow the keyword forms.
const RESERVED_KINDS: &[&str] = &["vm_error", "compiler"];

/// What a failure is expected to look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Matches the VM reason, the compiler detail or the annotation text
    Any(String),
    /// Exact compiler error detail
    Compiler(String),
    /// Reason string of a user revert
    VmError(String),
    /// Developer annotation of the given kind
    DevReason {
        /// Annotation kind (`dev`, `user`, ...)
        kind: String,
        /// Annotation text
        text: String,
    },
}

impl Expectation {
    /// Bare-string expectation.
    pub fn any(value: impl Into<String>) -> Self {
        Self::Any(value.into())
    }

    /// Keyword expectation `key=value`.
    pub fn keyword(key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match key {
            "compiler" => Self::Compiler(value),
            "vm_error" => Self::VmError(value),
            kind => Self::DevReason { kind: kind.to_string(), text: value },
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any(value) => write!(f, "{value:?}"),
            Self::Compiler(value) => write!(f, "<compiler: {value}>"),
            Self::VmError(value) => write!(f, "<vm_error: {value}>"),
            Self::DevReason { kind, text } => write!(f, "<{kind}: {text}>"),
        }
    }
}

/// A failure did not match its expectation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchFailure {
    /// The stack trace has no frames
    #[error("stack trace is empty")]
    EmptyTrace,

    /// The frame's annotation uses a kind reserved for keyword forms
    #[error("developer reason kind `{0}` is reserved")]
    ReservedKind(String),

    /// Expected and actual reasons differ
    #[error("{0}")]
    Mismatch(String),
}

/// Check the outermost frame of `trace` against `expectation`.
pub fn match_failure(trace: &StackTrace, expectation: &Expectation) -> Result<(), MatchFailure> {
    let frame = trace.last_frame().ok_or(MatchFailure::EmptyTrace)?;
    match_frame(frame, expectation)
}

/// Check one frame against `expectation`.
pub fn match_frame(frame: &ErrorDetail, expectation: &Expectation) -> Result<(), MatchFailure> {
    let check = |cond: bool, msg: String| if cond { Ok(()) } else { Err(MatchFailure::Mismatch(msg)) };
    let detail = frame.error_detail.as_deref();
    let shown_detail = detail.unwrap_or("None");

    if let Expectation::Any(value) = expectation {
        let pretty = frame.pretty_vm_reason();
        return check(
            *value == pretty
                || Some(value.as_str()) == detail
                || frame.dev_reason.as_ref().is_some_and(|r| r.reason_str == *value),
            format!("does not match {value:?}"),
        );
    }

    if let Some(reason) = &frame.dev_reason {
        if RESERVED_KINDS.contains(&reason.reason_type.as_str()) {
            return Err(MatchFailure::ReservedKind(reason.reason_type.clone()));
        }
    }

    match expectation {
        Expectation::Any(_) => Ok(()),
        Expectation::Compiler(value) => {
            check(Some(value.as_str()) == detail, format!("{shown_detail} != {value}"))
        }
        Expectation::VmError(value) => {
            check(
                detail == Some(USER_REVERT_WITH_REASON),
                format!("expected {expectation} but got <compiler: {shown_detail}>"),
            )?;
            let pretty = frame.pretty_vm_reason();
            check(*value == pretty, format!("{pretty} != {value}"))
        }
        Expectation::DevReason { kind, text } => {
            if frame.source.as_ref().is_some_and(|s| s.in_user_check) {
                check(
                    detail.is_some_and(|d| DEV_REASON_ALLOWED.contains(&d)),
                    format!("expected {expectation} but got <compiler: {shown_detail}>"),
                )?;
            }
            let got = frame.dev_reason.as_ref().map_or_else(|| "None".to_string(), |r| r.to_string());
            check(
                frame
                    .dev_reason
                    .as_ref()
                    .is_some_and(|r| r.reason_type == *kind && r.reason_str == *text),
                format!("expected {expectation} but got {got}"),
            )
        }
    }
}
