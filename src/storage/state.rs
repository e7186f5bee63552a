//! Committed warehouse state shared by every backend.
//!
//! Commits go through two phases. [`StoreState::prepare`] validates every
//! revision and stamps the commit with the revisions it will publish,
//! without touching the state; [`StoreState::install`] then moves the
//! prepared commit in. Only the tables and partitions a commit carries
//! are replaced.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::traits::{Commit, StorageError};
use crate::fact::{FactDirectory, FactLookup, FactManifest, FactPartition, FactQuery};
use crate::keys::KeyHighWater;
use crate::model::TableId;
use crate::table::Table;

/// Every committed table and fact partition plus allocator marks.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) tables: BTreeMap<TableId, Table>,
    pub(crate) facts: Option<FactManifest>,
    pub(crate) partitions: BTreeMap<NaiveDate, FactPartition>,
    pub(crate) key_high_water: KeyHighWater,
    directory: FactDirectory,
}

fn check(table: TableId, expected: u64, stored: Option<u64>) -> Result<(), StorageError> {
    let found = stored.unwrap_or(0);
    if found == expected {
        Ok(())
    } else {
        Err(StorageError::RevisionConflict {
            table,
            expected,
            found,
        })
    }
}

impl StoreState {
    /// Rebuilds state (and the fact directory) from recovered parts.
    pub(crate) fn restore(
        tables: BTreeMap<TableId, Table>,
        facts: Option<FactManifest>,
        partitions: BTreeMap<NaiveDate, FactPartition>,
        key_high_water: KeyHighWater,
    ) -> Self {
        let mut directory = FactDirectory::default();
        for partition in partitions.values() {
            directory.add(partition);
        }
        Self {
            tables,
            facts,
            partitions,
            key_high_water,
            directory,
        }
    }

    pub(crate) fn load(&self, table: TableId) -> Result<Table, StorageError> {
        self.tables
            .get(&table)
            .cloned()
            .ok_or(StorageError::TableNotFound(table))
    }

    pub(crate) fn load_fact_manifest(&self) -> Result<FactManifest, StorageError> {
        self.facts
            .clone()
            .ok_or(StorageError::TableNotFound(TableId::Facts))
    }

    pub(crate) fn load_partition(&self, start: NaiveDate) -> Result<FactPartition, StorageError> {
        self.partitions
            .get(&start)
            .cloned()
            .ok_or(StorageError::PartitionNotFound(start))
    }

    pub(crate) fn lookup_facts(&self, query: &FactQuery) -> FactLookup {
        self.directory.lookup(query)
    }

    pub(crate) fn contains(&self, table: TableId) -> bool {
        match table {
            TableId::Facts => self.facts.is_some(),
            other => self.tables.contains_key(&other),
        }
    }

    /// Validates every revision in `commit` and stamps it with the
    /// revisions it publishes. The state is not modified.
    pub(crate) fn prepare(&self, commit: &mut Commit) -> Result<(), StorageError> {
        for table in &commit.tables {
            let stored = self.tables.get(&table.id()).map(Table::revision);
            check(table.id(), table.revision(), stored)?;
        }
        if let Some(facts) = &commit.facts {
            let stored = self.facts.as_ref().map(FactManifest::revision);
            check(TableId::Facts, facts.manifest.revision(), stored)?;
            for partition in &facts.partitions {
                if facts.manifest.partitions().get(partition.start()) != Some(partition.partition())
                {
                    return Err(StorageError::BackendError(format!(
                        "partition {} is not in the committed manifest",
                        partition.partition()
                    )));
                }
                let stored = self.partitions.get(&partition.start()).map(FactPartition::revision);
                check(TableId::Facts, partition.revision(), stored)?;
            }
        }

        for table in &mut commit.tables {
            table.set_revision(table.revision() + 1);
        }
        if let Some(facts) = &mut commit.facts {
            let mut rows = self.directory.len();
            for partition in &mut facts.partitions {
                let replaced = self
                    .partitions
                    .get(&partition.start())
                    .map_or(0, FactPartition::len);
                rows = rows.saturating_sub(replaced) + partition.len();
                partition.set_revision(partition.revision() + 1);
            }
            facts.manifest.set_revision(facts.manifest.revision() + 1);
            facts.manifest.set_rows(rows);
        }
        Ok(())
    }

    /// Moves a prepared commit into the state.
    pub(crate) fn install(&mut self, commit: Commit) {
        for table in commit.tables {
            self.tables.insert(table.id(), table);
        }
        if let Some(facts) = commit.facts {
            for partition in facts.partitions {
                if let Some(old) = self.partitions.get(&partition.start()) {
                    self.directory.remove(old);
                }
                self.directory.add(&partition);
                self.partitions.insert(partition.start(), partition);
            }
            self.facts = Some(facts.manifest);
        }
        for (table, key) in commit.key_high_water {
            let mark = self.key_high_water.entry(table).or_insert(0);
            *mark = (*mark).max(key);
        }
    }

    pub(crate) fn apply(&mut self, mut commit: Commit) -> Result<(), StorageError> {
        self.prepare(&mut commit)?;
        self.install(commit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactCommit;
    use crate::model::{EntityKind, MergePolicy};

    fn table() -> Table {
        Table::new(TableId::Conformed(EntityKind::Country), MergePolicy::Overwrite)
    }

    #[test]
    fn stale_copy_is_rejected_and_nothing_applies() {
        let mut state = StoreState::default();
        state.apply(Commit::new().with_table(table())).unwrap();

        let fresh = state.load(table().id()).unwrap();
        assert_eq!(fresh.revision(), 1);
        state.apply(Commit::new().with_table(fresh)).unwrap();

        let stale = table();
        let err = state
            .apply(Commit::new().with_facts(FactCommit::empty(3)).with_table(stale))
            .unwrap_err();
        assert!(matches!(err, StorageError::RevisionConflict { expected: 0, found: 2, .. }));
        assert!(state.facts.is_none());
    }

    #[test]
    fn prepare_leaves_state_untouched() {
        let state = StoreState::default();
        let mut commit = Commit::new().with_table(table()).with_facts(FactCommit::empty(3));
        state.prepare(&mut commit).unwrap();
        assert_eq!(commit.tables[0].revision(), 1);
        assert_eq!(commit.facts.as_ref().map(|f| f.manifest.revision()), Some(1));
        assert!(state.tables.is_empty());
        assert!(!state.contains(TableId::Facts));
    }

    #[test]
    fn partition_outside_manifest_is_refused() {
        let mut state = StoreState::default();
        let span = crate::partition::Partition {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        };
        let mut commit = FactCommit::empty(3);
        commit.partitions.push(FactPartition::new(span));
        let err = state.apply(Commit::new().with_facts(commit)).unwrap_err();
        assert!(matches!(err, StorageError::BackendError(_)));
        assert!(state.partitions.is_empty());
    }

    #[test]
    fn high_water_marks_only_grow() {
        let mut state = StoreState::default();
        let id = TableId::Facts;
        state
            .apply(Commit::new().with_key_high_water(KeyHighWater::from([(id, 5)])))
            .unwrap();
        state
            .apply(Commit::new().with_key_high_water(KeyHighWater::from([(id, 3)])))
            .unwrap();
        assert_eq!(state.key_high_water[&id], 5);
    }
}
