//! In-memory storage backend.
//!
//! Thread-safe via `std::sync::RwLock`. Loads hand out clones of single
//! tables or partitions, so a merge in progress never affects readers.

use std::sync::RwLock;

use chrono::NaiveDate;

use super::state::StoreState;
use super::traits::{Commit, StorageError, TableStore};
use crate::fact::{FactLookup, FactManifest, FactPartition, FactQuery};
use crate::keys::KeyHighWater;
use crate::model::TableId;
use crate::table::Table;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Volatile store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    state: RwLock<StoreState>,
}

impl InMemoryTableStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for InMemoryTableStore {
    fn load(&self, table: TableId) -> Result<Table, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("table.load"))?;
        state.load(table)
    }

    fn load_fact_manifest(&self) -> Result<FactManifest, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.manifest"))?;
        state.load_fact_manifest()
    }

    fn load_partition(&self, start: NaiveDate) -> Result<FactPartition, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.partition"))?;
        state.load_partition(start)
    }

    fn lookup_facts(&self, query: &FactQuery) -> Result<FactLookup, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.lookup"))?;
        Ok(state.lookup_facts(query))
    }

    fn contains(&self, table: TableId) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("table.contains"))?;
        Ok(state.contains(table))
    }

    fn key_high_water(&self) -> Result<KeyHighWater, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("keys.high_water"))?;
        Ok(state.key_high_water.clone())
    }

    fn commit(&self, commit: Commit) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        // A rejected commit leaves the state untouched.
        state.apply(commit)
    }
}
