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

use std::{fs, path::Path};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Default cap, in bytes, on the size of a single decoded storage value.
pub const DEFAULT_STORAGE_TRUNCATE_LIMIT: usize = 1024;

/// Default bound on the number of hash levels the storage key unwinder follows.
pub const DEFAULT_MAX_UNWIND_DEPTH: usize = 256;

/// Configuration for the introspection engine
///
/// Every field has a default, so a TOML file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// Storage values larger than this many bytes are reported as truncated
    pub storage_truncate_limit: Option<usize>,
    /// Maximum nesting the storage key unwinder follows before giving up
    pub max_unwind_depth: usize,
    /// Whether contract display strings include the storage dump
    pub dump_storage_in_repr: bool,
    /// Whether log collection descends into sub-calls
    pub include_child_logs: bool,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            storage_truncate_limit: Some(DEFAULT_STORAGE_TRUNCATE_LIMIT),
            max_unwind_depth: DEFAULT_MAX_UNWIND_DEPTH,
            dump_storage_in_repr: true,
            include_child_logs: true,
        }
    }
}

impl InspectorConfig {
    /// Set the storage truncation limit (`None` disables truncation)
    pub fn with_storage_truncate_limit(mut self, limit: Option<usize>) -> Self {
        self.storage_truncate_limit = limit;
        self
    }

    /// Set the maximum unwinding depth
    pub fn with_max_unwind_depth(mut self, depth: usize) -> Self {
        self.max_unwind_depth = depth;
        self
    }

    /// Include or omit the storage dump in contract display strings
    pub fn with_dump_storage_in_repr(mut self, dump: bool) -> Self {
        self.dump_storage_in_repr = dump;
        self
    }

    /// Include or omit sub-call logs during log collection
    pub fn with_include_child_logs(mut self, include: bool) -> Self {
        self.include_child_logs = include;
        self
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).wrap_err("failed to parse inspector configuration")
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        pmdb_common::logging::ensure_test_logging(None);
        let config = InspectorConfig::from_toml_str("max_unwind_depth = 8\n").unwrap();
        assert_eq!(config.max_unwind_depth, 8);
        assert_eq!(config.storage_truncate_limit, Some(DEFAULT_STORAGE_TRUNCATE_LIMIT));
        assert!(config.dump_storage_in_repr);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        pmdb_common::logging::ensure_test_logging(None);
        assert!(InspectorConfig::from_toml_str("max_unwind_depth = \"deep\"").is_err());
    }

    #[test]
    fn test_builders() {
        pmdb_common::logging::ensure_test_logging(None);
        let config = InspectorConfig::default()
            .with_storage_truncate_limit(None)
            .with_include_child_logs(false);
        assert_eq!(config.storage_truncate_limit, None);
        assert!(!config.include_child_logs);
    }
}
