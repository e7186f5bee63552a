//! Warehouse configuration.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::invocation::ConcurrencyPolicy;
use crate::partition::DEFAULT_PARTITION_WIDTH_MONTHS;

/// Tunables of a warehouse and its pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Width of fact partitions in months.
    pub partition_width_months: u32,
    /// Behaviour of overlapping invocations on one table.
    pub concurrency: ConcurrencyPolicy,
    /// Skip the rest of a run after the first failed step.
    pub halt_on_failure: bool,
    /// Queue length of the background audit journal.
    pub audit_queue_capacity: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            partition_width_months: DEFAULT_PARTITION_WIDTH_MONTHS,
            concurrency: ConcurrencyPolicy::Block,
            halt_on_failure: true,
            audit_queue_capacity: 1024,
        }
    }
}

impl WarehouseConfig {
    const MAX_PARTITION_WIDTH_MONTHS: u32 = 12;

    /// Checks bounds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the offending field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if !(1..=Self::MAX_PARTITION_WIDTH_MONTHS).contains(&self.partition_width_months) {
            return Err(ValidationError::InvalidConfig {
                field: "partition_width_months".to_string(),
                reason: format!(
                    "must be between 1 and {} (got {})",
                    Self::MAX_PARTITION_WIDTH_MONTHS,
                    self.partition_width_months
                ),
            });
        }
        if self.audit_queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "audit_queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(self)
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Parse` for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::Parse {
            message: e.to_string(),
        })?;
        config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = WarehouseConfig::default().validate().unwrap();
        assert_eq!(config.partition_width_months, 3);
        assert_eq!(config.concurrency, ConcurrencyPolicy::Block);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"concurrency": "reject", "partition_width_months": 1}"#;
        let config = WarehouseConfig::from_json_str(json).unwrap();
        assert_eq!(config.concurrency, ConcurrencyPolicy::Reject);
        assert_eq!(config.partition_width_months, 1);
        assert!(config.halt_on_failure);
    }

    #[test]
    fn out_of_range_width_is_rejected() {
        let err = WarehouseConfig::from_json_str(r#"{"partition_width_months": 0}"#).unwrap_err();
        assert!(err.to_string().contains("partition_width_months"));
        assert!(matches!(
            WarehouseConfig::from_json_str("{not json"),
            Err(ValidationError::Parse { .. })
        ));
    }
}
