//! Audit sink: one record per merge invocation.
//!
//! Recording is best-effort. [`AuditSink::record`] returns nothing, and a
//! sink that cannot deliver an entry logs the loss with `tracing` instead
//! of failing the merge that called it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Final status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Succeeded,
    Failed,
}

/// What one invocation reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Pipeline run, when the invocation was part of one.
    pub run_id: Option<Uuid>,
    /// Operation name, e.g. `merge ce_products_scd`.
    pub operation: String,
    /// Zero on failure.
    pub rows_inserted: usize,
    /// Zero on failure.
    pub rows_updated: usize,
    pub status: AuditStatus,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// A successful invocation.
    #[must_use]
    pub fn succeeded(
        operation: impl Into<String>,
        inserted: usize,
        updated: usize,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: None,
            operation: operation.into(),
            rows_inserted: inserted,
            rows_updated: updated,
            status: AuditStatus::Succeeded,
            error_kind: None,
            detail: None,
            recorded_at,
        }
    }

    /// A failed invocation; counts are frozen at zero.
    #[must_use]
    pub fn failed(
        operation: impl Into<String>,
        kind: ErrorKind,
        detail: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: None,
            operation: operation.into(),
            rows_inserted: 0,
            rows_updated: 0,
            status: AuditStatus::Failed,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            recorded_at,
        }
    }

    #[must_use]
    pub fn with_run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives audit entries.
pub trait AuditSink: Send + Sync {
    /// Records one entry. Must not panic and must not block for long.
    fn record(&self, entry: AuditEntry);
}

/// Emits every entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let run_id = entry.run_id.map(|id| id.to_string()).unwrap_or_default();
        let detail = entry.detail.as_deref().unwrap_or("");
        match entry.status {
            AuditStatus::Succeeded => tracing::info!(
                run_id = %run_id,
                operation = %entry.operation,
                inserted = entry.rows_inserted,
                updated = entry.rows_updated,
                detail,
                "merge invocation succeeded"
            ),
            AuditStatus::Failed => tracing::error!(
                run_id = %run_id,
                operation = %entry.operation,
                kind = ?entry.error_kind,
                detail,
                "merge invocation failed"
            ),
        }
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Forwards each entry to several sinks.
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, entry: AuditEntry) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(entry.clone());
            }
            last.record(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_entry_freezes_counts() {
        let entry = AuditEntry::failed(
            "merge ce_products_scd",
            ErrorKind::Invariant,
            "two active versions",
            Utc::now(),
        );
        assert_eq!((entry.rows_inserted, entry.rows_updated), (0, 0));
        assert_eq!(entry.status, AuditStatus::Failed);
        assert_eq!(entry.error_kind, Some(ErrorKind::Invariant));
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingAuditSink));
        fanout.record(AuditEntry::succeeded("merge ce_countries", 2, 0, Utc::now()));
        assert_eq!(a.entries().len(), 1);
        assert_eq!(b.entries()[0].rows_inserted, 2);
    }

    #[test]
    fn entry_serializes_with_snake_case_status() {
        let entry = AuditEntry::succeeded("merge ce_countries", 1, 0, Utc::now());
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"status\":\"succeeded\""));
    }
}
