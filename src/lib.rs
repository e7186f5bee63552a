//! # starmerge - Incremental Dimensional Merge Engine
//!
//! starmerge loads staged source rows into a conformed layer, projects
//! that layer into star-schema dimensions and merges a date-partitioned
//! sales fact on top of it. Every step is idempotent: re-running it on
//! the same input changes nothing.
//!
//! ## Core Concepts
//!
//! - **Conformed entity**: a source-reconciled table keyed by a
//!   [`RecordIdentity`] (natural key, source system, source entity)
//! - **Type-1 merge**: changed rows are overwritten in place
//! - **Type-2 merge**: changed rows are retired and a new version with a
//!   fresh [`SurrogateKey`] is opened
//! - **Unknown member**: the key `-1` row every unresolved reference
//!   points at
//! - **Fact repair**: facts pointing at a retired product version are
//!   re-pointed at the active one
//!
//! ## Usage
//!
//! ```rust
//! use chrono::Utc;
//! use starmerge::{EntityKind, Pipeline, StagedBatch, StagedRow, Warehouse};
//!
//! let warehouse = Warehouse::in_memory()?;
//! let countries = StagedBatch::new(
//!     EntityKind::Country,
//!     vec![StagedRow::new("DE", "erp", "countries", Utc::now())
//!         .compare("country_name", "Germany")],
//! );
//!
//! let run = Pipeline::new(&warehouse).run(vec![countries]);
//! assert!(run.is_success());
//! # Ok::<(), starmerge::StarError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod digest;
pub mod error;
pub mod model;
pub mod schema;
pub mod time;
pub mod value;

// Tables and staging
pub mod resolve;
pub mod staging;
pub mod table;

// Merge machinery
pub mod detect;
pub mod dimension;
pub mod fact;
pub mod keys;
pub mod merge;
pub mod partition;

// Runtime
pub mod audit;
pub mod config;
pub mod invariants;
pub mod invocation;
pub mod pipeline;
pub mod storage;
pub mod warehouse;

// Re-export primary types at crate root for convenience
pub use audit::{
    AuditEntry, AuditSink, AuditStatus, FanoutAuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use config::WarehouseConfig;
pub use detect::{ChangeKind, ChangeSet};
pub use digest::RowDigest;
pub use error::{
    ClassificationError, ErrorKind, MergeError, StarError, StarResult, ValidationError,
};
pub use fact::{
    FactCommit, FactLookup, FactManifest, FactPartition, FactQuery, FactRow, FactTable,
    FactWorkspace,
};
pub use invocation::ConcurrencyPolicy;
pub use keys::{AtomicKeyAllocator, KeyAllocator};
pub use model::{
    DimensionKind, EntityKind, IdentityScope, MergePolicy, RecordIdentity, SurrogateKey, TableId,
    UNASSIGNED_LABEL, UNKNOWN_MEMBER_KEY,
};
pub use partition::{Partition, PartitionSet};
pub use pipeline::{Pipeline, RunReport, Step, StepOutcome};
pub use schema::{AttributeDef, EntitySchema, SalesSchema};
pub use staging::{StagedBatch, StagedRow};
pub use storage::{Commit, InMemoryTableStore, StorageError, TableStore};
pub use table::{Row, Table};
pub use time::{Clock, ManualClock, SystemClock, ValidityWindow};
pub use value::{AttributeType, Attributes, Value};
pub use warehouse::{MergeReport, Warehouse, WarehouseBuilder};
