//! Conformed and dimension tables.
//!
//! A [`Table`] owns its rows keyed by surrogate key plus two indexes:
//! identity -> versions (ascending key order) and natural key ->
//! identities. Indexes are rebuilt on deserialization.
//!
//! Versioned tables expose [`Table::retire_and_replace`], the single
//! operation that closes an active version and opens its successor, so
//! the two halves can never diverge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::RowDigest;
use crate::error::MergeError;
use crate::model::{MergePolicy, RecordIdentity, SurrogateKey, TableId, UNKNOWN_MEMBER_KEY};
use crate::time::ValidityWindow;
use crate::value::Attributes;

/// Version bookkeeping of a row in a versioned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub is_active: bool,
    pub window: ValidityWindow,
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: SurrogateKey,
    pub identity: RecordIdentity,
    pub attributes: Attributes,
    pub digest: RowDigest,
    /// `Some` in versioned tables only.
    pub version: Option<VersionState>,
    pub insert_dt: DateTime<Utc>,
    pub update_dt: DateTime<Utc>,
}

impl Row {
    /// Non-versioned rows are always active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.version.map_or(true, |v| v.is_active)
    }

    #[must_use]
    pub fn is_unknown_member(&self) -> bool {
        self.key.is_unknown()
    }
}

#[derive(Serialize, Deserialize)]
struct TableImage {
    id: TableId,
    policy: MergePolicy,
    revision: u64,
    rows: Vec<Row>,
}

/// In-memory table with identity indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TableImage", into = "TableImage")]
pub struct Table {
    id: TableId,
    policy: MergePolicy,
    revision: u64,
    rows: BTreeMap<SurrogateKey, Row>,
    by_identity: HashMap<RecordIdentity, Vec<SurrogateKey>>,
    by_natural_key: HashMap<String, BTreeSet<RecordIdentity>>,
}

impl From<TableImage> for Table {
    fn from(image: TableImage) -> Self {
        let mut table = Self::new(image.id, image.policy);
        table.revision = image.revision;
        for row in image.rows {
            table.index(&row);
            table.rows.insert(row.key, row);
        }
        for keys in table.by_identity.values_mut() {
            keys.sort_unstable();
        }
        table
    }
}

impl From<Table> for TableImage {
    fn from(table: Table) -> Self {
        Self {
            id: table.id,
            policy: table.policy,
            revision: table.revision,
            rows: table.rows.into_values().collect(),
        }
    }
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn new(id: TableId, policy: MergePolicy) -> Self {
        Self {
            id,
            policy,
            revision: 0,
            rows: BTreeMap::new(),
            by_identity: HashMap::new(),
            by_natural_key: HashMap::new(),
        }
    }

    /// Creates a table holding only its unknown-member row.
    #[must_use]
    pub fn with_unknown_member(
        id: TableId,
        policy: MergePolicy,
        attributes: Attributes,
        digest: RowDigest,
        now: DateTime<Utc>,
    ) -> Self {
        let mut table = Self::new(id, policy);
        let row = Row {
            key: UNKNOWN_MEMBER_KEY,
            identity: RecordIdentity::unknown_member(),
            attributes,
            digest,
            version: match policy {
                MergePolicy::Overwrite => None,
                MergePolicy::Versioned => Some(VersionState {
                    is_active: true,
                    window: ValidityWindow::forever(),
                }),
            },
            insert_dt: now,
            update_dt: now,
        };
        table.index(&row);
        table.rows.insert(row.key, row);
        table
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    #[must_use]
    pub const fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Revision this copy was loaded at; bumped by the store on commit.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: SurrogateKey) -> Option<&Row> {
        self.rows.get(&key)
    }

    /// All rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    /// All rows except the unknown member.
    pub fn data_rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values().filter(|r| !r.is_unknown_member())
    }

    #[must_use]
    pub fn max_key(&self) -> Option<SurrogateKey> {
        self.rows.keys().next_back().copied()
    }

    /// Every version of `identity`, oldest first.
    pub fn versions<'a>(&'a self, identity: &RecordIdentity) -> impl Iterator<Item = &'a Row> + 'a {
        self.by_identity
            .get(identity)
            .into_iter()
            .flatten()
            .filter_map(|key| self.rows.get(key))
    }

    /// Identities stored under a natural key, smallest first.
    pub fn identities_for<'a>(
        &'a self,
        natural_key: &str,
    ) -> impl Iterator<Item = &'a RecordIdentity> + 'a {
        self.by_natural_key.get(natural_key).into_iter().flatten()
    }

    /// All identities, unordered.
    pub fn identities(&self) -> impl Iterator<Item = &RecordIdentity> {
        self.by_identity.keys()
    }

    /// The current row for `identity`: the only row of a non-versioned
    /// table, or the active version of a versioned one.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::MultipleActiveVersions` if more than one row is active.
    pub fn current(&self, identity: &RecordIdentity) -> Result<Option<&Row>, MergeError> {
        let mut active = self.versions(identity).filter(|r| r.is_active());
        let first = active.next();
        let extra = active.count();
        if extra > 0 {
            return Err(MergeError::MultipleActiveVersions {
                table: self.id,
                identity: identity.to_string(),
                count: extra + 1,
            });
        }
        Ok(first)
    }

    /// Inserts a new row.
    ///
    /// # Errors
    ///
    /// Fails if the key is taken, or if a non-versioned table already holds
    /// the identity, or if a versioned table already has an active version.
    pub fn insert(&mut self, row: Row) -> Result<(), MergeError> {
        if self.rows.contains_key(&row.key) {
            return Err(MergeError::DuplicateKey {
                table: self.id,
                key: row.key.get(),
            });
        }
        let clashes = match self.policy {
            MergePolicy::Overwrite => self.versions(&row.identity).next().is_some(),
            MergePolicy::Versioned => self.current(&row.identity)?.is_some(),
        };
        if clashes {
            return Err(MergeError::DuplicateIdentity {
                table: self.id,
                identity: row.identity.to_string(),
            });
        }
        self.index(&row);
        self.rows.insert(row.key, row);
        Ok(())
    }

    /// Overwrites attributes of an existing row in place. Key, identity
    /// and `insert_dt` are preserved.
    ///
    /// # Errors
    ///
    /// Fails for missing rows and the unknown member.
    pub fn overwrite(
        &mut self,
        key: SurrogateKey,
        attributes: Attributes,
        digest: RowDigest,
        now: DateTime<Utc>,
    ) -> Result<(), MergeError> {
        if key.is_unknown() {
            return Err(MergeError::UnknownMemberMutation { table: self.id });
        }
        let row = self.rows.get_mut(&key).ok_or(MergeError::RowNotFound {
            table: self.id,
            key: key.get(),
        })?;
        row.attributes = attributes;
        row.digest = digest;
        row.update_dt = now;
        Ok(())
    }

    /// Retires the active version `retiring` at `now` and inserts
    /// `replacement` as the new active version starting at `now`.
    ///
    /// Both halves are validated before either is applied.
    ///
    /// # Errors
    ///
    /// Fails if `retiring` is missing, inactive, the unknown member, or
    /// belongs to a different identity than `replacement`.
    pub fn retire_and_replace(
        &mut self,
        retiring: SurrogateKey,
        replacement: Row,
        now: DateTime<Utc>,
    ) -> Result<(), MergeError> {
        if retiring.is_unknown() {
            return Err(MergeError::UnknownMemberMutation { table: self.id });
        }
        if self.rows.contains_key(&replacement.key) {
            return Err(MergeError::DuplicateKey {
                table: self.id,
                key: replacement.key.get(),
            });
        }
        let old = self.rows.get(&retiring).ok_or(MergeError::RowNotFound {
            table: self.id,
            key: retiring.get(),
        })?;
        if old.identity != replacement.identity {
            return Err(MergeError::DuplicateIdentity {
                table: self.id,
                identity: replacement.identity.to_string(),
            });
        }
        let Some(mut state) = old.version.filter(|v| v.is_active) else {
            return Err(MergeError::MissingActiveVersion {
                table: self.id,
                identity: old.identity.to_string(),
            });
        };
        state
            .window
            .close_at(now)
            .map_err(|detail| MergeError::InvalidWindow { table: self.id, detail })?;
        state.is_active = false;

        if let Some(old) = self.rows.get_mut(&retiring) {
            old.version = Some(state);
            old.update_dt = now;
        }
        let replacement = Row {
            version: Some(VersionState {
                is_active: true,
                window: ValidityWindow::open_at(now),
            }),
            ..replacement
        };
        self.index(&replacement);
        self.rows.insert(replacement.key, replacement);
        Ok(())
    }

    /// Checks that no identity has more than one active row.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_active_uniqueness(&self) -> Result<(), MergeError> {
        for identity in self.by_identity.keys() {
            self.current(identity)?;
        }
        Ok(())
    }

    fn index(&mut self, row: &Row) {
        // Keys are allocated monotonically, so pushing keeps versions ordered.
        self.by_identity
            .entry(row.identity.clone())
            .or_default()
            .push(row.key);
        self.by_natural_key
            .entry(row.identity.natural_key.clone())
            .or_default()
            .insert(row.identity.clone());
    }
}
