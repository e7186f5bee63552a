//! Abstract storage contract for starmerge.
//!
//! A store holds committed table images and fact partitions. Merges never
//! mutate a store in place: they load private copies, change them, and
//! hand them back in a single [`Commit`] that either applies completely or
//! not at all.

use chrono::NaiveDate;
use thiserror::Error;

use crate::fact::{FactCommit, FactLookup, FactManifest, FactPartition, FactQuery, FactTable};
use crate::keys::KeyHighWater;
use crate::model::TableId;
use crate::table::Table;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Table has never been created.
    #[error("Table not found: {0}")]
    TableNotFound(TableId),

    /// No committed fact partition starts at this date.
    #[error("Fact partition not found: {0}")]
    PartitionNotFound(NaiveDate),

    /// Another invocation committed the table after this copy was loaded.
    #[error("Revision conflict on {table}: expected {expected}, found {found}")]
    RevisionConflict {
        table: TableId,
        expected: u64,
        found: u64,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything one invocation publishes.
///
/// Each table and fact partition carries the revision it was loaded at;
/// the store rejects the whole commit if any of them is stale.
#[derive(Debug, Default, Clone)]
pub struct Commit {
    pub tables: Vec<Table>,
    pub facts: Option<FactCommit>,
    /// Allocator marks at commit time; merged by maximum.
    pub key_high_water: KeyHighWater,
}

impl Commit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    #[must_use]
    pub fn with_facts(mut self, facts: FactCommit) -> Self {
        self.facts = Some(facts);
        self
    }

    #[must_use]
    pub fn with_key_high_water(mut self, marks: KeyHighWater) -> Self {
        self.key_high_water = marks;
        self
    }
}

/// Storage trait for warehouse tables.
///
/// # Safety Considerations
/// - `commit` must be atomic: readers see all of it or none of it
/// - Implementations must handle concurrent access safely
pub trait TableStore: Send + Sync {
    /// Loads a private copy of a conformed or dimension table.
    fn load(&self, table: TableId) -> Result<Table, StorageError>;

    /// Loads the committed fact manifest.
    fn load_fact_manifest(&self) -> Result<FactManifest, StorageError>;

    /// Loads a private copy of the fact partition starting at `start`.
    fn load_partition(&self, start: NaiveDate) -> Result<FactPartition, StorageError>;

    /// Answers a fact lookup from the store's directory, loading no rows.
    fn lookup_facts(&self, query: &FactQuery) -> Result<FactLookup, StorageError>;

    /// Returns true if `table` has been created.
    fn contains(&self, table: TableId) -> Result<bool, StorageError>;

    /// Last committed allocator marks.
    fn key_high_water(&self) -> Result<KeyHighWater, StorageError>;

    /// Publishes a commit atomically, bumping each revision it carries.
    fn commit(&self, commit: Commit) -> Result<(), StorageError>;

    /// Read view over every committed fact partition.
    fn load_facts(&self) -> Result<FactTable, StorageError> {
        let manifest = self.load_fact_manifest()?;
        let partitions = manifest
            .partitions()
            .iter()
            .map(|p| self.load_partition(p.start))
            .collect::<Result<Vec<_>, _>>()?;
        FactTable::assemble(manifest, partitions)
            .map_err(|e| StorageError::BackendError(e.to_string()))
    }
}
