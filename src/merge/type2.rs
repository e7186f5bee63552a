use crate::detect::ChangeSet;
use crate::error::MergeError;
use crate::table::{Row, Table, VersionState};
use crate::time::ValidityWindow;

use super::{MergeContext, MergeCounts};

/// Versioned merge: a changed identity retires its active version and
/// gains a new one under a fresh key; a new identity opens its first
/// version.
pub(super) fn apply(
    table: &mut Table,
    changes: ChangeSet,
    ctx: &MergeContext<'_>,
) -> Result<MergeCounts, MergeError> {
    table.check_active_uniqueness()?;

    let mut counts = MergeCounts {
        unchanged: changes.unchanged.len(),
        ..MergeCounts::default()
    };

    for change in changes.changed {
        let replacement = Row {
            key: ctx.allocator.allocate(table.id()),
            identity: change.row.identity,
            attributes: change.row.attributes,
            digest: change.row.digest,
            version: None,
            insert_dt: ctx.now,
            update_dt: ctx.now,
        };
        table.retire_and_replace(change.key, replacement, ctx.now)?;
        counts.updated += 1;
        counts.inserted += 1;
    }

    for row in changes.new {
        table.insert(Row {
            key: ctx.allocator.allocate(table.id()),
            identity: row.identity,
            attributes: row.attributes,
            digest: row.digest,
            version: Some(VersionState {
                is_active: true,
                window: ValidityWindow::open_at(ctx.now),
            }),
            insert_dt: ctx.now,
            update_dt: ctx.now,
        })?;
        counts.inserted += 1;
    }

    Ok(counts)
}
