//! The warehouse: merge invocations over a [`TableStore`].
//!
//! Every invocation follows the same shape:
//!
//! 1. take the target table's invocation lock
//! 2. load committed snapshots of everything it reads, and a private
//!    copy of the table it writes
//! 3. classify and merge into the copy
//! 4. publish the copy in one atomic commit
//! 5. report to the audit sink, success or failure
//!
//! A failure at any step discards the copy, records zero counts with the
//! error kind, and returns the error to the caller.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditSink, TracingAuditSink};
use crate::config::WarehouseConfig;
use crate::detect::{classify, ChangeSet};
use crate::digest::RowDigest;
use crate::dimension;
use crate::error::{StarError, StarResult};
use crate::fact::{self, FactCommit, FactCounts, FactTable, FactWorkspace};
use crate::invocation::InvocationLocks;
use crate::keys::{AtomicKeyAllocator, KeyAllocator};
use crate::merge::{self, MergeContext};
use crate::model::{DimensionKind, EntityKind, IdentityScope, TableId};
use crate::partition::Partition;
use crate::resolve::{ReferenceResolver, ResolutionStats};
use crate::schema::SalesSchema;
use crate::staging::{prepare_batch, RejectedRow, StagedBatch};
use crate::storage::{Commit, InMemoryTableStore, TableStore};
use crate::table::Table;
use crate::time::{Clock, SystemClock};

/// Outcome of one successful merge invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub operation: String,
    /// Rows (or versions) inserted.
    pub inserted: usize,
    /// Rows overwritten, versions retired, or facts re-pointed.
    pub updated: usize,
    pub unchanged: usize,
    /// Staged rows excluded by classification errors.
    pub rejected: Vec<RejectedRow>,
    /// Source rows that could not be loaded for other reasons.
    pub skipped: usize,
    pub duplicates_dropped: usize,
    pub resolution: ResolutionStats,
    pub partitions_created: Vec<Partition>,
}

impl MergeReport {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unchanged={} rejected={} skipped={} duplicates={} partitions_created={} {}",
            self.unchanged,
            self.rejected.len(),
            self.skipped,
            self.duplicates_dropped,
            self.partitions_created.len(),
            self.resolution
        )
    }
}

/// Operation name recorded for merges into `table`.
#[must_use]
pub fn operation_name(table: TableId) -> String {
    format!("merge {table}")
}

/// Builder for [`Warehouse`].
pub struct WarehouseBuilder {
    store: Arc<dyn TableStore>,
    allocator: Arc<dyn KeyAllocator>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    schema: Option<SalesSchema>,
    config: WarehouseConfig,
}

impl Default for WarehouseBuilder {
    fn default() -> Self {
        Self {
            store: Arc::new(InMemoryTableStore::new()),
            allocator: Arc::new(AtomicKeyAllocator::new()),
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
            schema: None,
            config: WarehouseConfig::default(),
        }
    }
}

impl WarehouseBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn KeyAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: SalesSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn config(mut self, config: WarehouseConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration, resumes the allocator and creates any
    /// missing table with its unknown-member row.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or storage errors.
    pub fn open(self) -> StarResult<Warehouse> {
        let config = self.config.validate()?;
        let schema = match self.schema {
            Some(schema) => schema,
            None => SalesSchema::standard()?,
        };
        let warehouse = Warehouse {
            locks: InvocationLocks::new(config.concurrency),
            store: self.store,
            allocator: self.allocator,
            clock: self.clock,
            audit: self.audit,
            schema,
            config,
        };
        warehouse.bootstrap()?;
        Ok(warehouse)
    }
}

/// Entry point for merge invocations.
pub struct Warehouse {
    store: Arc<dyn TableStore>,
    allocator: Arc<dyn KeyAllocator>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    schema: SalesSchema,
    config: WarehouseConfig,
    locks: InvocationLocks,
}

impl fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Warehouse")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Warehouse {
    #[must_use]
    pub fn builder() -> WarehouseBuilder {
        WarehouseBuilder::default()
    }

    /// In-memory warehouse with defaults.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in schema is inconsistent.
    pub fn in_memory() -> StarResult<Self> {
        Self::builder().open()
    }

    #[must_use]
    pub const fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    #[must_use]
    pub const fn schema(&self) -> &SalesSchema {
        &self.schema
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Committed copy of a conformed or dimension table.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn table(&self, table: TableId) -> StarResult<Table> {
        Ok(self.store.load(table)?)
    }

    /// Committed copy of the fact table.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn facts(&self) -> StarResult<FactTable> {
        Ok(self.store.load_facts()?)
    }

    fn bootstrap(&self) -> StarResult<()> {
        self.allocator.resume(&self.store.key_high_water()?);
        let now = self.clock.now();
        let mut commit = Commit::new();

        for id in TableId::all() {
            if self.store.contains(id)? {
                if let TableId::Conformed(_) | TableId::Dimension(_) = id {
                    if let Some(max) = self.store.load(id)?.max_key() {
                        self.allocator.observe(id, max);
                    }
                }
                continue;
            }
            match id {
                TableId::Conformed(entity) => {
                    let schema = self.schema.get(entity);
                    let attributes = schema.unknown_member_attributes();
                    let digest = RowDigest::of(&attributes, schema.comparison_names());
                    commit = commit.with_table(Table::with_unknown_member(
                        id,
                        schema.policy(),
                        attributes,
                        digest,
                        now,
                    ));
                }
                TableId::Dimension(kind) => {
                    let attributes = dimension::unknown_member_attributes(kind);
                    let digest = RowDigest::of(
                        &attributes,
                        dimension::comparison_names(kind).iter().copied(),
                    );
                    commit = commit.with_table(Table::with_unknown_member(
                        id,
                        dimension::policy(kind),
                        attributes,
                        digest,
                        now,
                    ));
                }
                TableId::Facts => {
                    commit =
                        commit.with_facts(FactCommit::empty(self.config.partition_width_months));
                }
            }
        }

        if !commit.tables.is_empty() || commit.facts.is_some() {
            tracing::info!(tables = commit.tables.len(), "bootstrapping warehouse tables");
            self.store.commit(commit.with_key_high_water(self.allocator.snapshot()))?;
        }
        Ok(())
    }

    /// Runs `body` as one audited invocation against `table`.
    fn invoke(
        &self,
        run_id: Option<Uuid>,
        table: TableId,
        body: impl FnOnce(&mut MergeReport) -> StarResult<()>,
    ) -> StarResult<MergeReport> {
        let operation = operation_name(table);
        let span = tracing::info_span!("invocation", operation = %operation, run_id = ?run_id);
        let _entered = span.enter();

        let mut report = MergeReport::new(&operation);
        let result = self
            .locks
            .acquire(table)
            .map_err(StarError::from)
            .and_then(|_guard| body(&mut report));

        match result {
            Ok(()) => {
                tracing::info!(
                    table = %table,
                    inserted = report.inserted,
                    updated = report.updated,
                    rejected = report.rejected.len(),
                    "invocation committed"
                );
                self.audit.record(
                    AuditEntry::succeeded(
                        &operation,
                        report.inserted,
                        report.updated,
                        self.clock.now(),
                    )
                    .with_run(run_id)
                    .with_detail(report.to_string()),
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(
                    table = %table,
                    kind = %err.kind(),
                    error = %err,
                    "invocation aborted"
                );
                self.audit.record(
                    AuditEntry::failed(&operation, err.kind(), err.to_string(), self.clock.now())
                        .with_run(run_id),
                );
                Err(err)
            }
        }
    }

    fn snapshots(&self, tables: impl IntoIterator<Item = TableId>) -> StarResult<Vec<Table>> {
        tables
            .into_iter()
            .map(|id| self.store.load(id).map_err(StarError::from))
            .collect()
    }

    /// Merges one staged batch into its conformed table.
    ///
    /// # Errors
    ///
    /// Invariant, concurrency and storage failures abort the invocation;
    /// row-level problems are reported in [`MergeReport::rejected`].
    pub fn merge_conformed(&self, batch: &StagedBatch) -> StarResult<MergeReport> {
        self.merge_conformed_in_run(None, batch)
    }

    pub(crate) fn merge_conformed_in_run(
        &self,
        run_id: Option<Uuid>,
        batch: &StagedBatch,
    ) -> StarResult<MergeReport> {
        let table = TableId::Conformed(batch.entity);
        self.invoke(run_id, table, |report| {
            let schema = self.schema.get(batch.entity);
            let now = self.clock.now();

            let referenced = self.snapshots(
                schema
                    .references()
                    .map(|(_, target)| TableId::Conformed(target)),
            )?;
            let resolver = referenced
                .iter()
                .fold(ReferenceResolver::new(), ReferenceResolver::with_table);
            let (rows, rejected, resolution) = prepare_batch(schema, &batch.rows, &resolver);
            for rejected_row in &rejected {
                tracing::warn!(
                    identity = %rejected_row.identity,
                    error = %rejected_row.error,
                    "staged row rejected"
                );
            }
            report.rejected = rejected;
            report.resolution = resolution;

            let target = self.store.load(table)?;
            let changes = classify(rows, schema.scope(), &target)?;
            report.duplicates_dropped = changes.duplicates_dropped;
            self.apply_and_commit(target, changes, now, report)
        })
    }

    /// Rebuilds one dimension from the committed conformed layer.
    ///
    /// # Errors
    ///
    /// Invariant, concurrency and storage failures abort the invocation.
    pub fn project_dimension(&self, kind: DimensionKind) -> StarResult<MergeReport> {
        self.project_dimension_in_run(None, kind)
    }

    pub(crate) fn project_dimension_in_run(
        &self,
        run_id: Option<Uuid>,
        kind: DimensionKind,
    ) -> StarResult<MergeReport> {
        let table = TableId::Dimension(kind);
        self.invoke(run_id, table, |report| {
            let now = self.clock.now();
            let sources = self.snapshots(kind.sources().iter().map(|e| TableId::Conformed(*e)))?;
            let resolver = sources
                .iter()
                .fold(ReferenceResolver::new(), ReferenceResolver::with_table);
            let rows = dimension::project(kind, &resolver);

            let target = self.store.load(table)?;
            let changes = classify(rows, IdentityScope::PerSource, &target)?;
            report.duplicates_dropped = changes.duplicates_dropped;
            self.apply_and_commit(target, changes, now, report)
        })
    }

    fn apply_and_commit(
        &self,
        mut target: Table,
        changes: ChangeSet,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> StarResult<()> {
        if changes.is_noop() {
            report.unchanged = changes.unchanged.len();
            return Ok(());
        }
        let ctx = MergeContext {
            allocator: self.allocator.as_ref(),
            now,
        };
        let counts = merge::apply(&mut target, changes, &ctx)?;
        report.inserted = counts.inserted;
        report.updated = counts.updated;
        report.unchanged = counts.unchanged;

        let commit = Commit::new()
            .with_table(target)
            .with_key_high_water(self.allocator.snapshot());
        self.store.commit(commit)?;
        Ok(())
    }

    /// Loads new order lines into the fact table, repairs facts that
    /// reference retired product versions and fills unknown references
    /// that have since arrived.
    ///
    /// # Errors
    ///
    /// Partition, invariant, concurrency and storage failures abort the
    /// invocation.
    pub fn merge_facts(&self) -> StarResult<MergeReport> {
        self.merge_facts_in_run(None)
    }

    pub(crate) fn merge_facts_in_run(&self, run_id: Option<Uuid>) -> StarResult<MergeReport> {
        self.invoke(run_id, TableId::Facts, |report| {
            let now = self.clock.now();
            let conformed = [
                EntityKind::Order,
                EntityKind::Payment,
                EntityKind::Customer,
                EntityKind::Product,
                EntityKind::Discount,
            ]
            .into_iter()
            .map(TableId::Conformed);
            let dimensions = DimensionKind::ALL.into_iter().map(TableId::Dimension);
            let snapshots = self.snapshots(conformed.chain(dimensions))?;
            let resolver = snapshots
                .iter()
                .fold(ReferenceResolver::new(), ReferenceResolver::with_table);

            let mut workspace = FactWorkspace::open(self.store.as_ref())?;
            let committed = workspace.manifest().rows();
            let mut counts = FactCounts::default();
            let allocator = self.allocator.as_ref();
            fact::insert_new_facts(&mut workspace, &resolver, allocator, now, &mut counts)?;
            fact::repair_retired_products(&mut workspace, &resolver, now, &mut counts)?;
            fact::repair_late_references(&mut workspace, &resolver, now, &mut counts)?;
            tracing::debug!(
                partitions = workspace.loaded().count(),
                "fact partitions loaded"
            );

            report.inserted = counts.inserted;
            report.updated = counts.updated;
            report.skipped = counts.skipped;
            report.unchanged = committed.saturating_sub(counts.updated);
            report.partitions_created = counts.partitions_created;

            if let Some(facts) = workspace.into_commit() {
                self.store.commit(
                    Commit::new()
                        .with_facts(facts)
                        .with_key_high_water(self.allocator.snapshot()),
                )?;
            }
            Ok(())
        })
    }
}
