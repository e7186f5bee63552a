//! The date-partitioned sales fact and its merge.
//!
//! Facts are stored partition by partition. A store keeps the
//! [`FactManifest`] (the partition set and a table-wide revision), one
//! [`FactPartition`] per partition with its own revision, and a directory
//! that answers [`FactQuery`] lookups without loading any rows. A merge
//! works in a [`FactWorkspace`], which loads only the partitions it
//! changes and commits only those.
//!
//! The fact merge runs in three steps against committed snapshots:
//!
//! - **Step A** inserts a fact for every conformed order line not yet in
//!   the fact table, resolving all dimension references and taking price
//!   and cost from the active product version.
//! - **Step B** re-points facts that reference a retired product version
//!   to the active one and refreshes their price and cost.
//! - **Step C** fills unknown-member references that have since become
//!   resolvable, refreshing the measures that come with them.
//!
//! No step touches a fact's order-line identity, partition or `insert_dt`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::date_key;
use crate::error::{MergeError, StarResult};
use crate::keys::KeyAllocator;
use crate::model::{
    DimensionKind, EntityKind, RecordIdentity, SurrogateKey, TableId, UNKNOWN_MEMBER_KEY,
};
use crate::partition::{Partition, PartitionSet};
use crate::resolve::ReferenceResolver;
use crate::storage::{StorageError, TableStore};
use crate::table::Row;

/// One order line in `fact_sales`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRow {
    pub key: SurrogateKey,
    /// Identity of the conformed order line.
    pub identity: RecordIdentity,
    pub order_number: String,
    pub date_key: i32,
    pub order_date: NaiveDate,
    pub product_key: SurrogateKey,
    pub customer_key: SurrogateKey,
    pub payment_key: SurrogateKey,
    pub discount_key: SurrogateKey,
    pub quantity: i64,
    pub price_each: BigDecimal,
    pub cost_each: BigDecimal,
    pub discount_rate: BigDecimal,
    pub insert_dt: DateTime<Utc>,
    pub update_dt: DateTime<Utc>,
}

impl FactRow {
    /// `quantity * price_each`.
    #[must_use]
    pub fn gross_amount(&self) -> BigDecimal {
        BigDecimal::from(self.quantity) * &self.price_each
    }

    /// Gross amount after discount.
    #[must_use]
    pub fn net_amount(&self) -> BigDecimal {
        self.gross_amount() * (BigDecimal::from(1) - &self.discount_rate)
    }

    /// `quantity * (price_each - cost_each)`.
    #[must_use]
    pub fn margin(&self) -> BigDecimal {
        BigDecimal::from(self.quantity) * (&self.price_each - &self.cost_each)
    }

    /// Every dimension key this fact references, with its dimension.
    #[must_use]
    pub fn dimension_keys(&self) -> [(DimensionKind, SurrogateKey); 4] {
        [
            (DimensionKind::Customer, self.customer_key),
            (DimensionKind::Product, self.product_key),
            (DimensionKind::Discount, self.discount_key),
            (DimensionKind::Payment, self.payment_key),
        ]
    }

    /// Dimensions this fact references through the unknown member.
    #[must_use]
    pub fn unresolved(&self) -> Vec<DimensionKind> {
        self.dimension_keys()
            .into_iter()
            .filter(|(_, key)| key.is_unknown())
            .map(|(kind, _)| kind)
            .collect()
    }

    /// Points the `kind` reference at `row` and refreshes the measures
    /// snapshotted from it.
    fn point_at(&mut self, kind: DimensionKind, row: &Row) {
        match kind {
            DimensionKind::Product => {
                self.product_key = row.key;
                self.price_each = decimal_or_zero(Some(row), "price");
                self.cost_each = decimal_or_zero(Some(row), "cost");
            }
            DimensionKind::Customer => self.customer_key = row.key,
            DimensionKind::Discount => {
                self.discount_key = row.key;
                self.discount_rate = decimal_or_zero(Some(row), "discount_rate");
            }
            DimensionKind::Payment => self.payment_key = row.key,
        }
    }
}

/// Table-wide fact metadata: the partition set and the revision every
/// fact commit is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactManifest {
    revision: u64,
    partitions: PartitionSet,
    rows: usize,
}

impl Default for FactManifest {
    fn default() -> Self {
        Self::new(PartitionSet::default().width_months())
    }
}

impl FactManifest {
    #[must_use]
    pub fn new(partition_width_months: u32) -> Self {
        Self {
            revision: 0,
            partitions: PartitionSet::new(partition_width_months),
            rows: 0,
        }
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    #[must_use]
    pub const fn partitions(&self) -> &PartitionSet {
        &self.partitions
    }

    /// Committed fact count.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn set_rows(&mut self, rows: usize) {
        self.rows = rows;
    }
}

#[derive(Serialize, Deserialize)]
struct PartitionImage {
    partition: Partition,
    revision: u64,
    rows: Vec<FactRow>,
}

/// The facts of one partition. Unit of copy-on-write and commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PartitionImage", into = "PartitionImage")]
pub struct FactPartition {
    partition: Partition,
    revision: u64,
    rows: BTreeMap<SurrogateKey, FactRow>,
}

impl TryFrom<PartitionImage> for FactPartition {
    type Error = String;

    fn try_from(image: PartitionImage) -> Result<Self, Self::Error> {
        let mut partition = Self::new(image.partition);
        partition.revision = image.revision;
        for row in image.rows {
            partition.insert(row).map_err(|e| e.to_string())?;
        }
        Ok(partition)
    }
}

impl From<FactPartition> for PartitionImage {
    fn from(partition: FactPartition) -> Self {
        Self {
            partition: partition.partition,
            revision: partition.revision,
            rows: partition.rows.into_values().collect(),
        }
    }
}

impl FactPartition {
    /// Empty, never committed partition.
    #[must_use]
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            revision: 0,
            rows: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.partition.start
    }

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
    pub fn get(&self, key: SurrogateKey) -> Option<&FactRow> {
        self.rows.get(&key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &FactRow> {
        self.rows.values()
    }

    /// Adds a fact dated inside this partition.
    ///
    /// # Errors
    ///
    /// Fails if the order date lies outside the partition or the key is
    /// taken.
    pub fn insert(&mut self, row: FactRow) -> Result<(), MergeError> {
        if !self.partition.contains(row.order_date) {
            return Err(MergeError::PartitionCoverage {
                table: TableId::Facts,
                detail: format!("{} lies outside partition {}", row.order_date, self.partition),
            });
        }
        if self.rows.contains_key(&row.key) {
            return Err(MergeError::DuplicateKey {
                table: TableId::Facts,
                key: row.key.get(),
            });
        }
        self.rows.insert(row.key, row);
        Ok(())
    }

    fn get_mut(&mut self, key: SurrogateKey) -> Option<&mut FactRow> {
        self.rows.get_mut(&key)
    }
}

/// Where a committed fact lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactLocation {
    pub key: SurrogateKey,
    /// Start of the partition holding the fact.
    pub partition: NaiveDate,
}

/// A committed fact with at least one unknown-member reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedFact {
    pub identity: RecordIdentity,
    pub location: FactLocation,
    pub missing: Vec<DimensionKind>,
}

/// Questions a fact merge asks the store before loading partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactQuery {
    /// Order lines whose facts should be located.
    pub identities: Vec<RecordIdentity>,
    /// Product dimension keys whose referencing partitions are wanted.
    pub products: BTreeSet<SurrogateKey>,
    /// Also list every fact with an unknown-member reference.
    pub unresolved: bool,
}

/// Answer to a [`FactQuery`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactLookup {
    /// Queried order lines that already have a fact.
    pub existing: HashMap<RecordIdentity, FactLocation>,
    /// Partitions holding facts that reference a queried product.
    pub referencing: BTreeSet<NaiveDate>,
    pub unresolved: Vec<UnresolvedFact>,
}

/// Store-side index over committed partitions.
#[derive(Debug, Clone, Default)]
pub(crate) struct FactDirectory {
    by_identity: HashMap<RecordIdentity, FactLocation>,
    by_product: HashMap<SurrogateKey, BTreeMap<NaiveDate, usize>>,
    unresolved: BTreeMap<RecordIdentity, UnresolvedFact>,
}

impl FactDirectory {
    pub(crate) fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub(crate) fn add(&mut self, partition: &FactPartition) {
        let start = partition.start();
        for fact in partition.rows() {
            let location = FactLocation {
                key: fact.key,
                partition: start,
            };
            self.by_identity.insert(fact.identity.clone(), location);
            *self
                .by_product
                .entry(fact.product_key)
                .or_default()
                .entry(start)
                .or_insert(0) += 1;
            let missing = fact.unresolved();
            if !missing.is_empty() {
                let entry = UnresolvedFact {
                    identity: fact.identity.clone(),
                    location,
                    missing,
                };
                self.unresolved.insert(fact.identity.clone(), entry);
            }
        }
    }

    pub(crate) fn remove(&mut self, partition: &FactPartition) {
        let start = partition.start();
        for fact in partition.rows() {
            self.by_identity.remove(&fact.identity);
            self.unresolved.remove(&fact.identity);
            if let Some(partitions) = self.by_product.get_mut(&fact.product_key) {
                if let Some(count) = partitions.get_mut(&start) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        partitions.remove(&start);
                    }
                }
                if partitions.is_empty() {
                    self.by_product.remove(&fact.product_key);
                }
            }
        }
    }

    pub(crate) fn lookup(&self, query: &FactQuery) -> FactLookup {
        let existing = query
            .identities
            .iter()
            .filter_map(|identity| {
                self.by_identity
                    .get(identity)
                    .map(|location| (identity.clone(), *location))
            })
            .collect();
        let referencing = query
            .products
            .iter()
            .filter_map(|key| self.by_product.get(key))
            .flat_map(BTreeMap::keys)
            .copied()
            .collect();
        let unresolved = if query.unresolved {
            self.unresolved.values().cloned().collect()
        } else {
            Vec::new()
        };
        FactLookup {
            existing,
            referencing,
            unresolved,
        }
    }
}

/// Read view over every committed partition.
#[derive(Debug, Clone, Default)]
pub struct FactTable {
    manifest: FactManifest,
    partitions: BTreeMap<NaiveDate, FactPartition>,
    location: HashMap<SurrogateKey, NaiveDate>,
    by_identity: HashMap<RecordIdentity, SurrogateKey>,
}

impl FactTable {
    /// Assembles the view from a manifest and its partitions.
    ///
    /// # Errors
    ///
    /// Fails if a partition is not in the manifest or a fact key or
    /// order-line identity appears twice.
    pub fn assemble(
        manifest: FactManifest,
        partitions: impl IntoIterator<Item = FactPartition>,
    ) -> Result<Self, MergeError> {
        let mut table = Self {
            manifest,
            ..Self::default()
        };
        for partition in partitions {
            let start = partition.start();
            if table.manifest.partitions().get(start) != Some(partition.partition()) {
                return Err(MergeError::PartitionCoverage {
                    table: TableId::Facts,
                    detail: format!("partition {} is not in the manifest", partition.partition()),
                });
            }
            for fact in partition.rows() {
                if table.location.insert(fact.key, start).is_some() {
                    return Err(MergeError::DuplicateKey {
                        table: TableId::Facts,
                        key: fact.key.get(),
                    });
                }
                if table.by_identity.insert(fact.identity.clone(), fact.key).is_some() {
                    return Err(MergeError::DuplicateIdentity {
                        table: TableId::Facts,
                        identity: fact.identity.to_string(),
                    });
                }
            }
            table.partitions.insert(start, partition);
        }
        Ok(table)
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.manifest.revision()
    }

    #[must_use]
    pub const fn manifest(&self) -> &FactManifest {
        &self.manifest
    }

    #[must_use]
    pub const fn partitions(&self) -> &PartitionSet {
        self.manifest.partitions()
    }

    /// The committed partition starting at `start`.
    #[must_use]
    pub fn partition(&self, start: NaiveDate) -> Option<&FactPartition> {
        self.partitions.get(&start)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.location.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.location.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: SurrogateKey) -> Option<&FactRow> {
        let start = self.location.get(&key)?;
        self.partitions.get(start)?.get(key)
    }

    /// The fact for a conformed order-line identity.
    #[must_use]
    pub fn find(&self, identity: &RecordIdentity) -> Option<&FactRow> {
        self.by_identity.get(identity).and_then(|key| self.get(*key))
    }

    /// All facts, partition by partition.
    pub fn rows(&self) -> impl Iterator<Item = &FactRow> {
        self.partitions.values().flat_map(FactPartition::rows)
    }

    /// Facts stored in `partition`.
    pub fn rows_in(&self, partition: &Partition) -> impl Iterator<Item = &FactRow> {
        self.partitions
            .get(&partition.start)
            .into_iter()
            .flat_map(FactPartition::rows)
    }
}

/// What a fact merge publishes: the grown manifest and the partitions it
/// changed or created, each at the revision it was loaded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactCommit {
    pub manifest: FactManifest,
    pub partitions: Vec<FactPartition>,
}

impl FactCommit {
    /// The commit creating an empty fact table.
    #[must_use]
    pub fn empty(partition_width_months: u32) -> Self {
        Self {
            manifest: FactManifest::new(partition_width_months),
            partitions: Vec::new(),
        }
    }
}

/// Private working copy of the partitions one fact merge touches.
pub struct FactWorkspace<'s> {
    store: &'s dyn TableStore,
    committed: PartitionSet,
    manifest: FactManifest,
    loaded: BTreeMap<NaiveDate, FactPartition>,
    dirty: BTreeSet<NaiveDate>,
    updated: BTreeSet<SurrogateKey>,
}

impl<'s> FactWorkspace<'s> {
    /// Opens a workspace on the committed manifest.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn open(store: &'s dyn TableStore) -> Result<Self, StorageError> {
        let manifest = store.load_fact_manifest()?;
        Ok(Self {
            store,
            committed: manifest.partitions().clone(),
            manifest,
            loaded: BTreeMap::new(),
            dirty: BTreeSet::new(),
            updated: BTreeSet::new(),
        })
    }

    #[must_use]
    pub const fn manifest(&self) -> &FactManifest {
        &self.manifest
    }

    /// Starts of the partitions loaded so far.
    pub fn loaded(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.loaded.keys().copied()
    }

    /// Distinct committed facts changed so far.
    #[must_use]
    pub fn updated(&self) -> usize {
        self.updated.len()
    }

    /// Asks the store's fact directory.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn lookup(&self, query: &FactQuery) -> Result<FactLookup, StorageError> {
        self.store.lookup_facts(query)
    }

    fn partition(&mut self, start: NaiveDate) -> StarResult<&mut FactPartition> {
        use std::collections::btree_map::Entry;

        match self.loaded.entry(start) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let partition = if self.committed.get(start).is_some() {
                    self.store.load_partition(start)?
                } else {
                    let span = self.manifest.partitions().get(start).copied().ok_or_else(|| {
                        MergeError::PartitionCoverage {
                            table: TableId::Facts,
                            detail: format!("no partition starts at {start}"),
                        }
                    })?;
                    FactPartition::new(span)
                };
                tracing::debug!(partition = %partition.partition(), "fact partition loaded");
                Ok(entry.insert(partition))
            }
        }
    }

    /// Inserts a new fact, growing the partition set first. Returns the
    /// partitions created.
    ///
    /// # Errors
    ///
    /// Fails on partition growth errors, storage errors or a taken key.
    pub fn insert(&mut self, row: FactRow) -> StarResult<Vec<Partition>> {
        let created = self.manifest.partitions.ensure_covering(row.order_date)?;
        for partition in &created {
            self.loaded.insert(partition.start, FactPartition::new(*partition));
            self.dirty.insert(partition.start);
        }
        let start = self
            .manifest
            .partitions()
            .locate(row.order_date)
            .map(|p| p.start)
            .ok_or_else(|| MergeError::PartitionCoverage {
                table: TableId::Facts,
                detail: format!("no partition covers {}", row.order_date),
            })?;
        self.partition(start)?.insert(row)?;
        self.dirty.insert(start);
        Ok(created)
    }

    /// Applies `change` to a committed fact. The change reports whether it
    /// modified the row; only then is the partition republished and the
    /// row's `update_dt` set to `now`.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::RowNotFound` if the fact is not where the
    /// directory said, or a storage error.
    pub fn update(
        &mut self,
        location: FactLocation,
        now: DateTime<Utc>,
        change: impl FnOnce(&mut FactRow) -> bool,
    ) -> StarResult<bool> {
        let row = self
            .partition(location.partition)?
            .get_mut(location.key)
            .ok_or(MergeError::RowNotFound {
                table: TableId::Facts,
                key: location.key.get(),
            })?;
        if !change(row) {
            return Ok(false);
        }
        row.update_dt = now;
        self.dirty.insert(location.partition);
        self.updated.insert(location.key);
        Ok(true)
    }

    /// The commit for every changed partition, or `None` if nothing changed.
    #[must_use]
    pub fn into_commit(mut self) -> Option<FactCommit> {
        if self.dirty.is_empty() {
            return None;
        }
        let partitions = self
            .dirty
            .iter()
            .filter_map(|start| self.loaded.remove(start))
            .collect();
        Some(FactCommit {
            manifest: self.manifest,
            partitions,
        })
    }
}

/// Counts reported by one fact merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCounts {
    /// Step A inserts.
    pub inserted: usize,
    /// Facts changed by Step B or Step C, each counted once.
    pub updated: usize,
    /// Order lines that could not become facts.
    pub skipped: usize,
    pub partitions_created: Vec<Partition>,
}

fn decimal_or_zero(row: Option<&Row>, name: &str) -> BigDecimal {
    row.and_then(|r| r.attributes.decimal(name))
        .cloned()
        .unwrap_or_default()
}

/// Smallest payment per order line.
fn payments_by_order(snapshots: &ReferenceResolver<'_>) -> HashMap<SurrogateKey, SurrogateKey> {
    let mut payments: HashMap<SurrogateKey, SurrogateKey> = HashMap::new();
    if let Some(table) = snapshots.table(TableId::Conformed(EntityKind::Payment)) {
        for payment in table.data_rows().filter(|r| r.is_active()) {
            let order_key = payment.attributes.key("order_line_id");
            if !order_key.is_unknown() {
                let smallest = payments.entry(order_key).or_insert(payment.key);
                *smallest = (*smallest).min(payment.key);
            }
        }
    }
    payments
}

/// Dimension rows an order line resolves to right now.
struct References<'a> {
    product: Option<&'a Row>,
    customer: Option<&'a Row>,
    discount: Option<&'a Row>,
    payment: Option<&'a Row>,
}

impl<'a> References<'a> {
    fn resolve(
        snapshots: &ReferenceResolver<'a>,
        order: &Row,
        payments: &HashMap<SurrogateKey, SurrogateKey>,
    ) -> Self {
        let follow = |entity: EntityKind, key: SurrogateKey, dimension: DimensionKind| {
            snapshots.follow(TableId::Conformed(entity), key, TableId::Dimension(dimension))
        };
        let attrs = &order.attributes;
        Self {
            product: follow(EntityKind::Product, attrs.key("product_id"), DimensionKind::Product),
            customer: follow(
                EntityKind::Customer,
                attrs.key("customer_id"),
                DimensionKind::Customer,
            ),
            discount: follow(
                EntityKind::Discount,
                attrs.key("discount_id"),
                DimensionKind::Discount,
            ),
            payment: payments
                .get(&order.key)
                .and_then(|key| follow(EntityKind::Payment, *key, DimensionKind::Payment)),
        }
    }

    fn get(&self, kind: DimensionKind) -> Option<&'a Row> {
        match kind {
            DimensionKind::Product => self.product,
            DimensionKind::Customer => self.customer,
            DimensionKind::Discount => self.discount,
            DimensionKind::Payment => self.payment,
        }
    }
}

/// Step A: inserts facts for order lines not yet loaded.
///
/// `snapshots` must hold the conformed order, payment, customer, product
/// and discount tables and every dimension table.
///
/// # Errors
///
/// Aborts on partition, index or storage errors.
pub fn insert_new_facts(
    workspace: &mut FactWorkspace<'_>,
    snapshots: &ReferenceResolver<'_>,
    allocator: &dyn KeyAllocator,
    now: DateTime<Utc>,
    counts: &mut FactCounts,
) -> StarResult<()> {
    let Some(orders) = snapshots.table(TableId::Conformed(EntityKind::Order)) else {
        tracing::warn!("no conformed order snapshot; nothing to insert");
        return Ok(());
    };
    let query = FactQuery {
        identities: orders
            .data_rows()
            .filter(|r| r.is_active())
            .map(|r| r.identity.clone())
            .collect(),
        ..FactQuery::default()
    };
    let lookup = workspace.lookup(&query)?;
    let payments = payments_by_order(snapshots);

    for order in orders.data_rows().filter(|r| r.is_active()) {
        if lookup.existing.contains_key(&order.identity) {
            continue;
        }
        let attrs = &order.attributes;
        let (Some(order_date), Some(quantity)) =
            (attrs.date("order_date"), attrs.integer("quantity"))
        else {
            tracing::warn!(
                order = %order.identity,
                "order line lacks date or quantity; not loaded"
            );
            counts.skipped += 1;
            continue;
        };

        let refs = References::resolve(snapshots, order, &payments);
        let key_of = |row: Option<&Row>| row.map_or(UNKNOWN_MEMBER_KEY, |r| r.key);
        let row = FactRow {
            key: allocator.allocate(TableId::Facts),
            identity: order.identity.clone(),
            order_number: attrs.text_or_unassigned("order_number"),
            date_key: date_key(order_date),
            order_date,
            product_key: key_of(refs.product),
            customer_key: key_of(refs.customer),
            payment_key: key_of(refs.payment),
            discount_key: key_of(refs.discount),
            quantity,
            price_each: decimal_or_zero(refs.product, "price"),
            cost_each: decimal_or_zero(refs.product, "cost"),
            discount_rate: decimal_or_zero(refs.discount, "discount_rate"),
            insert_dt: now,
            update_dt: now,
        };
        counts.partitions_created.extend(workspace.insert(row)?);
        counts.inserted += 1;
    }
    Ok(())
}

/// Step B: re-points facts referencing retired product versions.
///
/// Only partitions holding such facts are loaded.
///
/// # Errors
///
/// Aborts if the product dimension has no active version for a retired
/// row's identity, or on index or storage errors.
pub fn repair_retired_products(
    workspace: &mut FactWorkspace<'_>,
    snapshots: &ReferenceResolver<'_>,
    now: DateTime<Utc>,
    counts: &mut FactCounts,
) -> StarResult<()> {
    let table_id = TableId::Dimension(DimensionKind::Product);
    let Some(products) = snapshots.table(table_id) else {
        return Ok(());
    };
    let retired: BTreeSet<SurrogateKey> = products
        .data_rows()
        .filter(|row| !row.is_active())
        .map(|row| row.key)
        .collect();
    if retired.is_empty() {
        return Ok(());
    }
    let query = FactQuery {
        products: retired.clone(),
        ..FactQuery::default()
    };
    let partitions = workspace.lookup(&query)?.referencing;

    let mut replacements: HashMap<SurrogateKey, &Row> = HashMap::new();
    for start in partitions {
        let stale: Vec<(SurrogateKey, SurrogateKey)> = workspace
            .partition(start)?
            .rows()
            .filter(|fact| retired.contains(&fact.product_key))
            .map(|fact| (fact.key, fact.product_key))
            .collect();
        for (fact_key, old_key) in stale {
            let active = match replacements.get(&old_key) {
                Some(row) => *row,
                None => {
                    let identity = products
                        .get(old_key)
                        .map(|row| row.identity.clone())
                        .ok_or(MergeError::RowNotFound {
                            table: table_id,
                            key: old_key.get(),
                        })?;
                    let row = products.current(&identity)?.ok_or_else(|| {
                        MergeError::MissingActiveVersion {
                            table: table_id,
                            identity: identity.to_string(),
                        }
                    })?;
                    replacements.insert(old_key, row);
                    row
                }
            };
            let location = FactLocation {
                key: fact_key,
                partition: start,
            };
            workspace.update(location, now, |fact| {
                fact.point_at(DimensionKind::Product, active);
                true
            })?;
        }
    }
    counts.updated = workspace.updated();
    Ok(())
}

/// Step C: fills unknown-member references that now resolve.
///
/// The directory lists every fact with an unknown reference. Each is
/// re-resolved from its conformed order line; only partitions where a
/// reference became resolvable are loaded.
///
/// # Errors
///
/// Aborts on invariant, index or storage errors.
pub fn repair_late_references(
    workspace: &mut FactWorkspace<'_>,
    snapshots: &ReferenceResolver<'_>,
    now: DateTime<Utc>,
    counts: &mut FactCounts,
) -> StarResult<()> {
    let query = FactQuery {
        unresolved: true,
        ..FactQuery::default()
    };
    let unresolved = workspace.lookup(&query)?.unresolved;
    if unresolved.is_empty() {
        return Ok(());
    }
    let Some(orders) = snapshots.table(TableId::Conformed(EntityKind::Order)) else {
        return Ok(());
    };
    let payments = payments_by_order(snapshots);

    for fact in unresolved {
        let Some(order) = orders.current(&fact.identity)? else {
            continue;
        };
        let refs = References::resolve(snapshots, order, &payments);
        let found: Vec<(DimensionKind, &Row)> = fact
            .missing
            .iter()
            .filter_map(|kind| refs.get(*kind).map(|row| (*kind, row)))
            .collect();
        if found.is_empty() {
            continue;
        }
        let changed = workspace.update(fact.location, now, |row| {
            let mut changed = false;
            for (kind, dimension_row) in &found {
                let still_unknown = row
                    .dimension_keys()
                    .iter()
                    .any(|(k, key)| k == kind && key.is_unknown());
                if still_unknown {
                    row.point_at(*kind, dimension_row);
                    changed = true;
                }
            }
            changed
        })?;
        if changed {
            tracing::debug!(
                order = %fact.identity,
                filled = found.len(),
                "late-arriving references resolved"
            );
        }
    }
    counts.updated = workspace.updated();
    Ok(())
}
