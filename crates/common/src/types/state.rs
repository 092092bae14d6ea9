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

//! Execution-side state the introspector reads but never produces: hash preimages,
//! the storage-write log, world-state storage and address labels.

use std::collections::{BTreeSet, HashMap};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use auto_impl::auto_impl;
use derive_more::{Deref, From};
use eyre::{eyre, Result};
use revm::DatabaseRef;
use serde::{Deserialize, Serialize};

/// keccak-256 digests observed during execution, mapped back to their inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, From)]
pub struct PreimageDatabase(HashMap<B256, Bytes>);

impl PreimageDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `preimage`, remember it, and return the digest.
    pub fn record(&mut self, preimage: impl Into<Bytes>) -> B256 {
        let preimage = preimage.into();
        let digest = keccak256(&preimage);
        self.0.insert(digest, preimage);
        digest
    }

    /// Store a known digest/preimage pair.
    pub fn insert(&mut self, digest: B256, preimage: impl Into<Bytes>) {
        self.0.insert(digest, preimage.into());
    }
}

/// Storage keys written during execution, per account.
///
/// Keys are kept sorted so that mapping dumps are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageWriteLog {
    writes: HashMap<Address, BTreeSet<U256>>,
}

impl StorageWriteLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write of `slot` at `address`.
    pub fn record(&mut self, address: Address, slot: U256) {
        self.writes.entry(address).or_default().insert(slot);
    }

    /// Slots written at `address`, ascending.
    pub fn slots(&self, address: Address) -> impl Iterator<Item = U256> + '_ {
        self.writes.get(&address).into_iter().flatten().copied()
    }

    /// Whether anything was written at `address`.
    pub fn touched(&self, address: Address) -> bool {
        self.writes.get(&address).is_some_and(|slots| !slots.is_empty())
    }
}

/// Read access to account storage.
#[auto_impl(&, Arc, Box)]
pub trait StorageReader {
    /// The 32-byte word at `slot` of `address`'s storage.
    fn storage_word(&self, address: Address, slot: U256) -> Result<U256>;
}

/// [`StorageReader`] over any revm database.
#[derive(Debug, Clone)]
pub struct DatabaseStorage<DB> {
    db: DB,
}

impl<DB> DatabaseStorage<DB> {
    /// Wrap `db`
    pub fn new(db: DB) -> Self {
        Self { db }
    }

    /// Unwrap the database
    pub fn into_inner(self) -> DB {
        self.db
    }
}

impl<DB> StorageReader for DatabaseStorage<DB>
where
    DB: DatabaseRef,
    DB::Error: std::fmt::Debug,
{
    fn storage_word(&self, address: Address, slot: U256) -> Result<U256> {
        self.db
            .storage_ref(address, slot)
            .map_err(|e| eyre!("failed to read slot {slot} of {address}: {e:?}"))
    }
}

impl StorageReader for HashMap<(Address, U256), U256> {
    fn storage_word(&self, address: Address, slot: U256) -> Result<U256> {
        Ok(self.get(&(address, slot)).copied().unwrap_or_default())
    }
}

/// Maps addresses to human-readable names.
#[auto_impl(&, Arc, Box)]
pub trait AliasResolver {
    /// Known display name for `address`, if any.
    fn alias(&self, address: Address) -> Option<String>;
}

impl AliasResolver for HashMap<Address, String> {
    fn alias(&self, address: Address) -> Option<String> {
        self.get(&address).cloned()
    }
}

/// Resolver that knows no names.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAliases;

impl AliasResolver for NoAliases {
    fn alias(&self, _address: Address) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use revm::{
        database::{CacheDB, EmptyDB},
        state::AccountInfo,
    };

    const OWNER: Address = address!("0x0000000000000000000000000000000000001234");

    #[test]
    fn test_preimage_record() {
        crate::logging::ensure_test_logging(None);
        let mut db = PreimageDatabase::new();
        let digest = db.record(vec![1u8, 2, 3]);
        assert_eq!(digest, keccak256([1u8, 2, 3]));
        assert_eq!(&db.get(&digest).unwrap()[..], &[1, 2, 3]);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_write_log_is_sorted_and_deduplicated() {
        crate::logging::ensure_test_logging(None);
        let mut log = StorageWriteLog::new();
        log.record(OWNER, U256::from(9));
        log.record(OWNER, U256::from(2));
        log.record(OWNER, U256::from(9));
        assert_eq!(log.slots(OWNER).collect::<Vec<_>>(), vec![U256::from(2), U256::from(9)]);
        assert!(log.touched(OWNER));
        assert!(!log.touched(Address::ZERO));
        assert_eq!(log.slots(Address::ZERO).count(), 0);
    }

    #[test]
    fn test_database_storage_reads_revm_db() {
        crate::logging::ensure_test_logging(None);
        let mut db = CacheDB::new(EmptyDB::default());
        db.insert_account_info(OWNER, AccountInfo::default());
        db.insert_account_storage(OWNER, U256::from(1), U256::from(77)).unwrap();

        let storage = DatabaseStorage::new(db);
        assert_eq!(storage.storage_word(OWNER, U256::from(1)).unwrap(), U256::from(77));
        assert_eq!(storage.storage_word(OWNER, U256::from(2)).unwrap(), U256::ZERO);

        // Readers work through references too.
        let by_ref: &dyn StorageReader = &storage;
        assert_eq!(by_ref.storage_word(OWNER, U256::from(1)).unwrap(), U256::from(77));
    }

    #[test]
    fn test_alias_resolvers() {
        crate::logging::ensure_test_logging(None);
        let mut names = HashMap::new();
        names.insert(OWNER, "owner".to_string());
        assert_eq!(names.alias(OWNER).as_deref(), Some("owner"));
        assert_eq!(names.alias(Address::ZERO), None);
        assert_eq!(NoAliases.alias(OWNER), None);
    }
}
