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

use alloy_primitives::Address;
use thiserror::Error;

use crate::{
    AbiError, CallEncodingError, EventDecodeError, FrameLookupFailure, LayoutError, MatchFailure,
    StackTrace, UnknownEvent, UnwindError,
};

/// Errors surfaced by the [`Introspector`](crate::Introspector).
#[derive(Debug, Error)]
pub enum IntrospectError {
    /// ABI marshaling failed
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// A value could not be decoded from its native layout
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// A storage key could not be unwound
    #[error(transparent)]
    Unwind(#[from] UnwindError),

    /// Locals of a frame could not be located
    #[error(transparent)]
    FrameLookup(#[from] FrameLookupFailure),

    /// A log matched no declared event
    #[error(transparent)]
    UnknownEvent(#[from] UnknownEvent),

    /// A log did not decode against its declaration
    #[error(transparent)]
    EventDecode(#[from] EventDecodeError),

    /// Calldata could not be prepared
    #[error(transparent)]
    CallEncoding(#[from] CallEncodingError),

    /// A failure did not match its expectation
    #[error(transparent)]
    Match(#[from] MatchFailure),

    /// The call reverted
    #[error("call reverted:\n{0}")]
    Reverted(Box<StackTrace>),

    /// The trace has no root frame
    #[error("execution trace is empty")]
    EmptyTrace,

    /// No frame with this id
    #[error("no frame with id {0}")]
    UnknownFrame(usize),

    /// The frame completed without error
    #[error("frame {0} did not fail")]
    NotFailed(usize),

    /// No contract registered at the address
    #[error("no contract registered at {0}")]
    UnknownContract(Address),
}

impl From<StackTrace> for IntrospectError {
    fn from(trace: StackTrace) -> Self {
        Self::Reverted(Box::new(trace))
    }
}

impl IntrospectError {
    /// The stack trace of a reverted call.
    pub fn stack_trace(&self) -> Option<&StackTrace> {
        match self {
            Self::Reverted(trace) => Some(trace),
            _ => None,
        }
    }
}
