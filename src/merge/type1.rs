use crate::detect::ChangeSet;
use crate::error::MergeError;
use crate::table::{Row, Table};

use super::{MergeContext, MergeCounts};

/// Overwrite in place: insert new identities, rewrite changed rows,
/// leave unchanged rows alone.
pub(super) fn apply(
    table: &mut Table,
    changes: ChangeSet,
    ctx: &MergeContext<'_>,
) -> Result<MergeCounts, MergeError> {
    let mut counts = MergeCounts {
        unchanged: changes.unchanged.len(),
        ..MergeCounts::default()
    };

    for change in changes.changed {
        table.overwrite(change.key, change.row.attributes, change.row.digest, ctx.now)?;
        counts.updated += 1;
    }

    for row in changes.new {
        let key = ctx.allocator.allocate(table.id());
        table.insert(Row {
            key,
            identity: row.identity,
            attributes: row.attributes,
            digest: row.digest,
            version: None,
            insert_dt: ctx.now,
            update_dt: ctx.now,
        })?;
        counts.inserted += 1;
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::classify;
    use crate::keys::AtomicKeyAllocator;
    use crate::model::{
        EntityKind, IdentityScope, MergePolicy, RecordIdentity, SurrogateKey, TableId,
    };
    use crate::staging::PreparedRow;
    use crate::value::{Attributes, Value};
    use chrono::{Duration, Utc};

    fn customer(email: &str, first_name: &str) -> PreparedRow {
        PreparedRow::from_attributes(
            RecordIdentity::new("C1", "erp", "customers"),
            Attributes::new()
                .with("email", Value::from(email))
                .with("first_name", Value::from(first_name)),
            ["email"],
            Utc::now(),
        )
    }

    #[test]
    fn update_keeps_key_and_insert_timestamp() {
        let alloc = AtomicKeyAllocator::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::hours(1);
        let mut table =
            Table::new(TableId::Conformed(EntityKind::Customer), MergePolicy::Overwrite);

        let set = classify(vec![customer("a@x", "Ann")], IdentityScope::PerSource, &table).unwrap();
        let first = apply(&mut table, set, &MergeContext { allocator: &alloc, now: t0 }).unwrap();
        assert_eq!(first.inserted, 1);

        let set = classify(vec![customer("b@x", "Ann")], IdentityScope::PerSource, &table).unwrap();
        let second = apply(&mut table, set, &MergeContext { allocator: &alloc, now: t1 }).unwrap();
        assert_eq!((second.inserted, second.updated), (0, 1));

        let row = table.get(SurrogateKey::new(1)).unwrap();
        assert_eq!(row.insert_dt, t0);
        assert_eq!(row.update_dt, t1);
        assert_eq!(row.attributes.text_or_unassigned("email"), "b@x");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn display_only_change_is_a_noop() {
        let alloc = AtomicKeyAllocator::new();
        let now = Utc::now();
        let mut table =
            Table::new(TableId::Conformed(EntityKind::Customer), MergePolicy::Overwrite);
        let set = classify(vec![customer("a@x", "Ann")], IdentityScope::PerSource, &table).unwrap();
        apply(&mut table, set, &MergeContext { allocator: &alloc, now }).unwrap();

        let set =
            classify(vec![customer("a@x", "Anna")], IdentityScope::PerSource, &table).unwrap();
        let counts = apply(&mut table, set, &MergeContext { allocator: &alloc, now }).unwrap();
        assert_eq!(counts, MergeCounts { inserted: 0, updated: 0, unchanged: 1 });
    }
}
