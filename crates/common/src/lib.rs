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

// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! PMDB Common - Shared functionality for PMDB components
//!
//! This crate provides the data model shared by the introspection engine and its
//! collaborators: recorded execution traces, hash preimages, storage-write logs,
//! compiler type descriptions and type-tagged decoded values, plus logging setup.

/// Common types used throughout PMDB including execution traces, compiler types and decoded values
pub mod types;

/// Logging setup and utilities for consistent logging across PMDB components
pub mod logging;

pub use logging::*;
