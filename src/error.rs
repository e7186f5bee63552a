//! Error types for starmerge.
//!
//! Errors are layered the way they propagate:
//! - [`ClassificationError`]: one staged row is unusable; the row is
//!   excluded and reported, the invocation carries on
//! - [`MergeError`]: an invariant or concurrency rule was broken; the
//!   invocation aborts
//! - [`StorageError`]: infrastructure failure; the invocation aborts
//! - [`ValidationError`]: bad configuration or schema input
//!
//! [`StarError`] wraps the fatal ones and maps them to an audit
//! [`ErrorKind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EntityKind, TableId};
pub use crate::storage::StorageError;

/// Row-level problems found while preparing a staged row.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ClassificationError {
    #[error("natural key is empty")]
    EmptyNaturalKey,

    #[error("natural key '{natural_key}' is reserved for the unknown member")]
    ReservedNaturalKey {
        natural_key: String,
    },

    #[error("natural key '{natural_key}' does not match pattern {pattern}")]
    MalformedNaturalKey {
        natural_key: String,
        pattern: String,
    },

    #[error("source system and source entity labels must be non-empty")]
    EmptySourceLabel,

    #[error("required attribute '{name}' is missing")]
    MissingAttribute {
        name: String,
    },

    #[error("attribute '{name}' is not defined for {entity}")]
    UnknownAttribute {
        entity: EntityKind,
        name: String,
    },

    #[error("attribute '{name}' expected {expected}, got '{raw}'")]
    InvalidAttribute {
        name: String,
        expected: String,
        raw: String,
    },
}

/// Validation errors for configuration and schema input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Invalid natural key pattern for {entity}: {reason}")]
    InvalidKeyPattern {
        entity: EntityKind,
        reason: String,
    },

    #[error("Schema for {entity} is inconsistent: {reason}")]
    InconsistentSchema {
        entity: EntityKind,
        reason: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

/// Fatal conditions detected by a merge invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("{table}: {count} active versions for {identity}")]
    MultipleActiveVersions {
        table: TableId,
        identity: String,
        count: usize,
    },

    #[error("{table}: no active version for {identity}")]
    MissingActiveVersion {
        table: TableId,
        identity: String,
    },

    #[error("{table}: duplicate row for {identity}")]
    DuplicateIdentity {
        table: TableId,
        identity: String,
    },

    #[error("{table}: surrogate key {key} is already taken")]
    DuplicateKey {
        table: TableId,
        key: i64,
    },

    #[error("{table}: row {key} not found")]
    RowNotFound {
        table: TableId,
        key: i64,
    },

    #[error("{table}: the unknown member row is immutable")]
    UnknownMemberMutation {
        table: TableId,
    },

    #[error("{table}: another merge invocation is in flight")]
    InvocationInProgress {
        table: TableId,
    },

    #[error("{table}: partition coverage violated: {detail}")]
    PartitionCoverage {
        table: TableId,
        detail: String,
    },

    #[error("{table}: invalid validity window: {detail}")]
    InvalidWindow {
        table: TableId,
        detail: String,
    },
}

/// Coarse error category recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A data-model invariant would have been broken.
    Invariant,
    /// An overlapping invocation was rejected.
    Concurrency,
    /// Storage or filesystem failure.
    Infrastructure,
    /// Invalid configuration or schema.
    Configuration,
    /// Bug or unexpected state.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Invariant => "invariant",
            Self::Concurrency => "concurrency",
            Self::Infrastructure => "infrastructure",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        })
    }
}

/// Top-level error type for starmerge.
#[derive(Debug, Error)]
pub enum StarError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl StarError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Audit category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Configuration,
            Self::Merge(MergeError::InvocationInProgress { .. }) => ErrorKind::Concurrency,
            Self::Merge(MergeError::PartitionCoverage { .. }) => ErrorKind::Infrastructure,
            Self::Merge(_) => ErrorKind::Invariant,
            Self::Storage(StorageError::RevisionConflict { .. }) => ErrorKind::Concurrency,
            Self::Storage(_) => ErrorKind::Infrastructure,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if an external scheduler may retry the invocation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Infrastructure)
    }
}

/// Result type alias for starmerge operations.
pub type StarResult<T> = Result<T, StarError>;
