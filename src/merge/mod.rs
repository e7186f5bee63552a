//! Type-1 and Type-2 merges of a classified batch into a table copy.
//!
//! Merges mutate a private copy loaded from the store; nothing is visible
//! to readers until the caller commits that copy.

mod type1;
mod type2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::ChangeSet;
use crate::error::MergeError;
use crate::keys::KeyAllocator;
use crate::model::MergePolicy;
use crate::table::Table;

/// Everything a merge needs besides the table and the changes.
pub struct MergeContext<'a> {
    pub allocator: &'a dyn KeyAllocator,
    /// Timestamp applied to every row touched by this invocation.
    pub now: DateTime<Utc>,
}

/// Row counts of one merge.
///
/// For versioned tables `updated` counts retired versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Applies `changes` to `table` according to the table's policy.
///
/// # Errors
///
/// Any `MergeError` leaves `table` in an unspecified state; the caller
/// must discard the copy.
pub fn apply(
    table: &mut Table,
    changes: ChangeSet,
    ctx: &MergeContext<'_>,
) -> Result<MergeCounts, MergeError> {
    let counts = match table.policy() {
        MergePolicy::Overwrite => type1::apply(table, changes, ctx)?,
        MergePolicy::Versioned => type2::apply(table, changes, ctx)?,
    };
    tracing::debug!(
        table = %table.id(),
        inserted = counts.inserted,
        updated = counts.updated,
        unchanged = counts.unchanged,
        "merge applied"
    );
    Ok(counts)
}
