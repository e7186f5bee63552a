//! Change detection: classify prepared rows against a table snapshot.
//!
//! Classification is pure. Duplicates within a batch are collapsed by
//! [`select_representatives`] before comparison, so the result does not
//! depend on the order rows arrive in.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::MergeError;
use crate::model::{IdentityScope, SurrogateKey};
use crate::staging::PreparedRow;
use crate::table::Table;

/// Classification of one representative row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// No stored row for the identity.
    New,
    /// Stored, comparison set differs.
    Changed,
    /// Stored, comparison set equal.
    Unchanged,
}

/// A stored row whose comparison set differs from the staged one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Current key (the active version for versioned tables).
    pub key: SurrogateKey,
    pub row: PreparedRow,
}

/// Result of classifying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub new: Vec<PreparedRow>,
    pub changed: Vec<Change>,
    pub unchanged: Vec<SurrogateKey>,
    pub duplicates_dropped: usize,
}

impl ChangeSet {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty()
    }

    /// Kind of the row classified under `key`, if any.
    #[must_use]
    pub fn kind_of(&self, key: SurrogateKey) -> Option<ChangeKind> {
        if self.changed.iter().any(|c| c.key == key) {
            Some(ChangeKind::Changed)
        } else if self.unchanged.contains(&key) {
            Some(ChangeKind::Unchanged)
        } else {
            None
        }
    }
}

/// Orders two rows competing for the same identity slot; `Less` wins.
///
/// Rows from one source: the latest observation wins, then the smallest
/// digest. Across sources (global scope only): the smallest source system
/// label, then source entity label, decides first.
fn precedence(a: &PreparedRow, b: &PreparedRow) -> Ordering {
    a.identity
        .source_system
        .cmp(&b.identity.source_system)
        .then_with(|| a.identity.source_entity.cmp(&b.identity.source_entity))
        .then_with(|| b.observed_at.cmp(&a.observed_at))
        .then_with(|| a.digest.cmp(&b.digest))
}

/// Keeps exactly one row per identity (per natural key under global
/// scope). Returns the representatives in identity order and the number
/// of rows dropped.
#[must_use]
pub fn select_representatives(
    rows: Vec<PreparedRow>,
    scope: IdentityScope,
) -> (Vec<PreparedRow>, usize) {
    let total = rows.len();
    let mut groups: BTreeMap<String, PreparedRow> = BTreeMap::new();
    for row in rows {
        let group = match scope {
            IdentityScope::PerSource => row.identity.to_string(),
            IdentityScope::Global => row.identity.natural_key.clone(),
        };
        match groups.get_mut(&group) {
            Some(kept) if precedence(&row, kept) == Ordering::Less => *kept = row,
            Some(_) => {}
            None => {
                groups.insert(group, row);
            }
        }
    }
    let mut kept: Vec<_> = groups.into_values().collect();
    kept.sort_by(|a, b| a.identity.cmp(&b.identity));
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Classifies `rows` against `target`.
///
/// Under global scope a row adopts the identity already stored for its
/// natural key, so a second source never creates a second row.
///
/// # Errors
///
/// Returns `MergeError::MultipleActiveVersions` if the snapshot already
/// violates active-version uniqueness for a staged identity.
pub fn classify(
    rows: Vec<PreparedRow>,
    scope: IdentityScope,
    target: &Table,
) -> Result<ChangeSet, MergeError> {
    let (representatives, duplicates_dropped) = select_representatives(rows, scope);
    let mut set = ChangeSet {
        duplicates_dropped,
        ..ChangeSet::default()
    };

    for mut row in representatives {
        if scope == IdentityScope::Global {
            if let Some(stored) = target.identities_for(&row.identity.natural_key).next() {
                row.identity = stored.clone();
            }
        }
        match target.current(&row.identity)? {
            None => set.new.push(row),
            Some(current) if current.digest == row.digest => set.unchanged.push(current.key),
            Some(current) => set.changed.push(Change { key: current.key, row }),
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::RowDigest;
    use crate::model::{EntityKind, MergePolicy, RecordIdentity, TableId};
    use crate::table::Row;
    use crate::value::{Attributes, Value};
    use chrono::{DateTime, Duration, Utc};

    fn prepared(nk: &str, source: &str, name: &str, at: DateTime<Utc>) -> PreparedRow {
        PreparedRow::from_attributes(
            RecordIdentity::new(nk, source, "countries"),
            Attributes::new().with("country_name", Value::from(name)),
            ["country_name"],
            at,
        )
    }

    fn stored(table: &mut Table, key: i64, row: &PreparedRow) {
        table
            .insert(Row {
                key: SurrogateKey::new(key),
                identity: row.identity.clone(),
                attributes: row.attributes.clone(),
                digest: row.digest,
                version: None,
                insert_dt: row.observed_at,
                update_dt: row.observed_at,
            })
            .unwrap();
    }

    fn countries() -> Table {
        Table::new(TableId::Conformed(EntityKind::Country), MergePolicy::Overwrite)
    }

    #[test]
    fn partitions_new_changed_unchanged() {
        let now = Utc::now();
        let mut table = countries();
        stored(&mut table, 1, &prepared("DE", "erp", "Germany", now));
        stored(&mut table, 2, &prepared("FR", "erp", "France", now));

        let batch = vec![
            prepared("DE", "erp", "Germany", now),
            prepared("FR", "erp", "Frankreich", now),
            prepared("IT", "erp", "Italy", now),
        ];
        let set = classify(batch, IdentityScope::PerSource, &table).unwrap();
        assert_eq!(set.new.len(), 1);
        assert_eq!(set.new[0].identity.natural_key, "IT");
        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.changed[0].key, SurrogateKey::new(2));
        assert_eq!(set.unchanged, vec![SurrogateKey::new(1)]);
        assert_eq!(set.kind_of(SurrogateKey::new(2)), Some(ChangeKind::Changed));
    }

    #[test]
    fn duplicate_rows_keep_latest_observation() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);
        let rows = vec![prepared("DE", "erp", "Late", t1), prepared("DE", "erp", "Early", t0)];
        let (kept, dropped) = select_representatives(rows, IdentityScope::PerSource);
        assert_eq!(dropped, 1);
        assert_eq!(kept[0].attributes.text_or_unassigned("country_name"), "Late");
    }

    #[test]
    fn tie_break_is_order_independent() {
        let now = Utc::now();
        let a = prepared("DE", "erp", "Germany", now);
        let b = prepared("DE", "erp", "Deutschland", now);
        let (first, _) =
            select_representatives(vec![a.clone(), b.clone()], IdentityScope::PerSource);
        let (second, _) = select_representatives(vec![b, a], IdentityScope::PerSource);
        assert_eq!(first, second);
    }

    #[test]
    fn per_source_scope_keeps_both_sources() {
        let now = Utc::now();
        let rows = vec![
            prepared("DE", "erp", "Germany", now),
            prepared("DE", "web", "Germany", now),
        ];
        let set = classify(rows, IdentityScope::PerSource, &countries()).unwrap();
        assert_eq!(set.new.len(), 2);
        assert_eq!(set.duplicates_dropped, 0);
    }

    #[test]
    fn global_scope_picks_smallest_source_and_reuses_stored_identity() {
        let now = Utc::now();
        let rows = vec![
            prepared("DE", "web", "Germany", now),
            prepared("DE", "erp", "Germany", now),
        ];
        let set = classify(rows, IdentityScope::Global, &countries()).unwrap();
        assert_eq!(set.new.len(), 1);
        assert_eq!(set.new[0].identity.source_system, "erp");
        assert_eq!(set.duplicates_dropped, 1);

        let mut table = countries();
        stored(&mut table, 1, &prepared("DE", "web", "Germany", now));
        let rows = vec![prepared("DE", "erp", "Germany", now)];
        let set = classify(rows, IdentityScope::Global, &table).unwrap();
        assert!(set.new.is_empty());
        assert_eq!(set.unchanged, vec![SurrogateKey::new(1)]);
    }

    #[test]
    fn digest_equality_drives_classification() {
        let now = Utc::now();
        let mut table = countries();
        let original = prepared("DE", "erp", "Germany", now);
        stored(&mut table, 1, &original);
        let same = PreparedRow::from_attributes(
            original.identity.clone(),
            original.attributes.clone().with("unused", Value::from("x")),
            ["country_name"],
            now,
        );
        assert_eq!(same.digest, RowDigest::of(&original.attributes, ["country_name"]));
        let set = classify(vec![same], IdentityScope::PerSource, &table).unwrap();
        assert!(set.is_noop());
    }
}
