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

//! Recover the access path of a hashed storage key.
//!
//! A mapping entry lives at `keccak256(parent || key)`, where `parent` is either the
//! mapping's slot or, for nested mappings, another hashed location. Following recorded
//! preimages backwards from a written key yields its path from root slot to leaf key.

use alloy_primitives::{Bytes, B256};
use pmdb_common::types::PreimageDatabase;
use thiserror::Error;
use tracing::trace;

/// Errors raised while unwinding a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwindError {
    /// The preimage chain is deeper than the configured bound
    #[error("storage key {key} nests deeper than {limit} levels")]
    DepthExceeded {
        /// Key being unwound
        key: B256,
        /// Configured bound
        limit: usize,
    },
}

/// Path of `key`: the root slot word first, then each mapping key from outermost to
/// innermost.
///
/// A key with no recorded preimage is its own root, so it unwinds to `[key]`. At most
/// `max_depth` hash levels are followed.
pub fn unwind_storage_key(
    preimages: &PreimageDatabase,
    key: B256,
    max_depth: usize,
) -> Result<Vec<Bytes>, UnwindError> {
    let mut path = Vec::new();
    let mut current = key;
    loop {
        match preimages.get(&current) {
            Some(preimage) if preimage.len() >= 32 => {
                if path.len() >= max_depth {
                    return Err(UnwindError::DepthExceeded { key, limit: max_depth });
                }
                trace!(%current, preimage = %preimage, "unwinding storage key");
                path.push(preimage.slice(32..));
                current = B256::from_slice(&preimage[..32]);
            }
            _ => {
                path.push(Bytes::copy_from_slice(current.as_slice()));
                break;
            }
        }
    }
    path.reverse();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn word(v: u64) -> [u8; 32] {
        U256::from(v).to_be_bytes::<32>()
    }

    #[test]
    fn test_unwinds_nested_mapping_key() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut preimages = PreimageDatabase::new();
        let h1 = preimages.record([word(3), word(11)].concat());
        let h2 = preimages.record([h1.0, word(22)].concat());

        let path = unwind_storage_key(&preimages, h2, 8).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(&path[0][..], word(3).as_slice());
        assert_eq!(&path[1][..], word(11).as_slice());
        assert_eq!(&path[2][..], word(22).as_slice());
    }

    #[test]
    fn test_unknown_key_is_its_own_root() {
        pmdb_common::logging::ensure_test_logging(None);
        let preimages = PreimageDatabase::new();
        let key = B256::repeat_byte(0x42);
        assert_eq!(unwind_storage_key(&preimages, key, 8).unwrap(), vec![Bytes::from(key.0)]);
    }

    #[test]
    fn test_short_preimage_stops_unwinding() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut preimages = PreimageDatabase::new();
        let h = preimages.record(b"abc".to_vec());
        assert_eq!(unwind_storage_key(&preimages, h, 8).unwrap(), vec![Bytes::from(h.0)]);
    }

    #[test]
    fn test_depth_bound() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut preimages = PreimageDatabase::new();
        let mut key = B256::from(word(0));
        for i in 0..5 {
            key = preimages.record([key.0, word(i)].concat());
        }
        assert_eq!(unwind_storage_key(&preimages, key, 5).unwrap().len(), 6);
        assert_eq!(
            unwind_storage_key(&preimages, key, 4),
            Err(UnwindError::DepthExceeded { key, limit: 4 })
        );
    }
}
