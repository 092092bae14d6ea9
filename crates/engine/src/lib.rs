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

//! PMDB Engine - post-mortem introspection of compiled EVM contracts
//!
//! Given compiler metadata and a finished execution trace, the engine reconstructs
//! multi-frame stack traces with source attribution, decodes local variables at the
//! failure point, dumps persistent storage (reconstructing hashed mappings from recorded
//! preimages), decodes event logs, and marshals call data with type tagging.

pub mod abi;
pub use abi::*;

pub mod artifact;
pub use artifact::*;

pub mod config;
pub use config::*;

pub mod contract;
pub use contract::*;

pub mod dev_reason;
pub use dev_reason::*;

pub mod error;
pub use error::*;

pub mod event;
pub use event::*;

pub mod frame;
pub use frame::*;

pub mod introspector;
pub use introspector::*;

pub mod layout;
pub use layout::*;

pub mod matcher;
pub use matcher::*;

pub mod source_map;
pub use source_map::*;

pub mod storage;
pub use storage::*;
