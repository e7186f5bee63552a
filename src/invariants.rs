//! Whole-table invariant checks.
//!
//! Merges enforce these as they go; the checks here re-verify committed
//! state and are used by tests and operators after a run.

use std::collections::BTreeMap;

use crate::error::{MergeError, StarResult};
use crate::fact::FactTable;
use crate::model::{DimensionKind, MergePolicy, RecordIdentity, TableId};
use crate::table::{Row, Table};
use crate::warehouse::Warehouse;

/// At most one active version per identity.
///
/// # Errors
///
/// Returns `MergeError::MultipleActiveVersions` for the first offender.
pub fn active_uniqueness(table: &Table) -> Result<(), MergeError> {
    table.check_active_uniqueness()
}

/// Versions of each identity form one gap-free, non-overlapping chain that
/// ends in the single active, open-ended version.
///
/// # Errors
///
/// Returns `MergeError::InvalidWindow` describing the first broken chain.
pub fn validity_contiguity(table: &Table) -> Result<(), MergeError> {
    if table.policy() != MergePolicy::Versioned {
        return Ok(());
    }
    let invalid = |identity: &RecordIdentity, detail: String| MergeError::InvalidWindow {
        table: table.id(),
        detail: format!("{identity}: {detail}"),
    };

    let mut chains: BTreeMap<&RecordIdentity, Vec<&Row>> = BTreeMap::new();
    for row in table.rows() {
        chains.entry(&row.identity).or_default().push(row);
    }

    for (identity, versions) in chains {
        let mut windows = Vec::with_capacity(versions.len());
        for row in &versions {
            match row.version {
                Some(state) => windows.push((row.key, state)),
                None => {
                    return Err(invalid(
                        identity,
                        format!("row {} has no version state", row.key),
                    ))
                }
            }
        }
        windows.sort_by_key(|(_, state)| state.window.valid_from);

        for pair in windows.windows(2) {
            let (prev_key, prev) = pair[0];
            let (next_key, next) = pair[1];
            if prev.is_active {
                return Err(invalid(
                    identity,
                    format!("row {prev_key} is active but superseded by {next_key}"),
                ));
            }
            if !prev.window.abuts(&next.window) || prev.window.overlaps(&next.window) {
                return Err(invalid(
                    identity,
                    format!("gap or overlap between rows {prev_key} and {next_key}"),
                ));
            }
        }
        if let Some((last_key, last)) = windows.last() {
            if !last.is_active || !last.window.is_open_ended() {
                return Err(invalid(
                    identity,
                    format!("latest row {last_key} is not active and open-ended"),
                ));
            }
        }
    }
    Ok(())
}

/// Every dimension key of every fact resolves to a row of that dimension.
///
/// # Errors
///
/// Returns `MergeError::RowNotFound` naming the missing dimension row.
pub fn fact_coverage(
    facts: &FactTable,
    dimensions: &BTreeMap<DimensionKind, Table>,
) -> Result<(), MergeError> {
    for fact in facts.rows() {
        for (kind, key) in fact.dimension_keys() {
            let table = TableId::Dimension(kind);
            let found = dimensions.get(&kind).is_some_and(|dim| dim.get(key).is_some());
            if !found {
                tracing::debug!(fact = %fact.key, %table, key = %key, "dangling fact reference");
                return Err(MergeError::RowNotFound { table, key: key.get() });
            }
        }
    }
    Ok(())
}

/// Partitions form one contiguous run.
///
/// # Errors
///
/// Returns `MergeError::PartitionCoverage` if a gap exists.
pub fn partition_contiguity(facts: &FactTable) -> Result<(), MergeError> {
    if facts.partitions().is_contiguous() {
        Ok(())
    } else {
        Err(MergeError::PartitionCoverage {
            table: TableId::Facts,
            detail: "partitions are not contiguous".to_string(),
        })
    }
}

/// Runs every check against committed warehouse state.
///
/// # Errors
///
/// Returns the first violation found, or a storage error.
pub fn check_warehouse(warehouse: &Warehouse) -> StarResult<()> {
    let mut dimensions = BTreeMap::new();
    for id in TableId::all() {
        match id {
            TableId::Conformed(_) => {
                let table = warehouse.table(id)?;
                active_uniqueness(&table)?;
                validity_contiguity(&table)?;
            }
            TableId::Dimension(kind) => {
                let table = warehouse.table(id)?;
                active_uniqueness(&table)?;
                validity_contiguity(&table)?;
                dimensions.insert(kind, table);
            }
            TableId::Facts => {}
        }
    }
    let facts = warehouse.facts()?;
    fact_coverage(&facts, &dimensions)?;
    partition_contiguity(&facts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::RowDigest;
    use crate::model::{EntityKind, SurrogateKey};
    use crate::table::VersionState;
    use crate::time::ValidityWindow;
    use crate::value::Attributes;
    use chrono::{Duration, TimeZone, Utc};

    fn versioned_row(key: i64, from_hours: i64, to_hours: Option<i64>) -> Row {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut window = ValidityWindow::open_at(base + Duration::hours(from_hours));
        if let Some(to) = to_hours {
            window.close_at(base + Duration::hours(to)).unwrap();
        }
        Row {
            key: SurrogateKey::new(key),
            identity: RecordIdentity::new("P1", "erp", "products"),
            attributes: Attributes::new(),
            digest: RowDigest::of(&Attributes::new(), std::iter::empty()),
            version: Some(VersionState {
                is_active: to_hours.is_none(),
                window,
            }),
            insert_dt: base,
            update_dt: base,
        }
    }

    fn table(rows: Vec<Row>) -> Table {
        let mut table = Table::new(TableId::Conformed(EntityKind::Product), MergePolicy::Versioned);
        for row in rows {
            table.insert(row).unwrap();
        }
        table
    }

    #[test]
    fn abutting_chain_is_valid() {
        let t = table(vec![
            versioned_row(1, 0, Some(5)),
            versioned_row(2, 5, Some(9)),
            versioned_row(3, 9, None),
        ]);
        assert!(validity_contiguity(&t).is_ok());
        assert!(active_uniqueness(&t).is_ok());
    }

    #[test]
    fn gap_is_reported() {
        let t = table(vec![versioned_row(1, 0, Some(5)), versioned_row(2, 6, None)]);
        let err = validity_contiguity(&t).unwrap_err();
        assert!(matches!(err, MergeError::InvalidWindow { .. }));
        assert!(err.to_string().contains("rows 1 and 2"));
    }

    #[test]
    fn retired_tail_is_reported() {
        let t = table(vec![versioned_row(1, 0, Some(5))]);
        assert!(validity_contiguity(&t).is_err());
    }

    #[test]
    fn empty_fact_table_is_covered() {
        let facts = FactTable::default();
        assert!(fact_coverage(&facts, &BTreeMap::new()).is_ok());
        assert!(partition_contiguity(&facts).is_ok());
    }
}
