//! Full-run driver.
//!
//! A run executes one invocation per conformed entity, then every
//! dimension projection, then the fact merge, in dependency order. Each
//! step yields a typed [`StepOutcome`]; the driver decides from it whether
//! to continue.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::{DimensionKind, EntityKind, TableId};
use crate::staging::StagedBatch;
use crate::warehouse::{MergeReport, Warehouse};

/// One invocation of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Conformed(EntityKind),
    Dimension(DimensionKind),
    Facts,
}

impl Step {
    /// Every step of a full run in execution order.
    #[must_use]
    pub fn plan() -> Vec<Self> {
        EntityKind::ALL
            .into_iter()
            .map(Self::Conformed)
            .chain(DimensionKind::ALL.into_iter().map(Self::Dimension))
            .chain(std::iter::once(Self::Facts))
            .collect()
    }

    /// Table the step writes.
    #[must_use]
    pub const fn table(self) -> TableId {
        match self {
            Self::Conformed(entity) => TableId::Conformed(entity),
            Self::Dimension(kind) => TableId::Dimension(kind),
            Self::Facts => TableId::Facts,
        }
    }

    /// Steps that must have succeeded earlier in the same run.
    #[must_use]
    pub fn dependencies(self) -> Vec<Self> {
        match self {
            Self::Conformed(entity) => {
                entity.dependencies().iter().copied().map(Self::Conformed).collect()
            }
            Self::Dimension(kind) => {
                kind.sources().iter().copied().map(Self::Conformed).collect()
            }
            Self::Facts => [EntityKind::Order, EntityKind::Payment]
                .into_iter()
                .map(Self::Conformed)
                .chain(DimensionKind::ALL.into_iter().map(Self::Dimension))
                .collect(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.table(), f)
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded(MergeReport),
    Failed {
        kind: ErrorKind,
        detail: String,
    },
    /// Not executed. `blocked_by` is set when an earlier failure caused it.
    Skipped {
        reason: String,
        blocked_by: Option<Step>,
    },
}

impl StepOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The step did not produce committed state this run.
    const fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. }
                | Self::Skipped {
                    blocked_by: Some(_),
                    ..
                }
        )
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub steps: Vec<(Step, StepOutcome)>,
}

impl RunReport {
    /// True if no step failed or was blocked.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|(_, outcome)| !outcome.blocks_dependents())
    }

    #[must_use]
    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, outcome)| outcome)
    }

    /// Report of a succeeded step.
    #[must_use]
    pub fn report(&self, step: Step) -> Option<&MergeReport> {
        match self.outcome(step)? {
            StepOutcome::Succeeded(report) => Some(report),
            _ => None,
        }
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = (Step, &StepOutcome)> {
        self.steps
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(step, outcome)| (*step, outcome))
    }
}

/// Drives full runs against one warehouse.
#[derive(Debug)]
pub struct Pipeline<'w> {
    warehouse: &'w Warehouse,
}

impl<'w> Pipeline<'w> {
    #[must_use]
    pub const fn new(warehouse: &'w Warehouse) -> Self {
        Self { warehouse }
    }

    /// Runs every step. Batches for the same entity are concatenated; an
    /// entity without a batch is skipped without blocking its dependents.
    pub fn run(&self, batches: impl IntoIterator<Item = StagedBatch>) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id);
        let _entered = span.enter();

        let mut staged: BTreeMap<EntityKind, StagedBatch> = BTreeMap::new();
        for batch in batches {
            staged
                .entry(batch.entity)
                .or_insert_with(|| StagedBatch::new(batch.entity, Vec::new()))
                .rows
                .extend(batch.rows);
        }

        let halt = self.warehouse.config().halt_on_failure;
        let mut blocked: BTreeSet<Step> = BTreeSet::new();
        let mut halted_by: Option<Step> = None;
        let mut steps = Vec::new();

        for step in Step::plan() {
            let outcome = if let Some(first) = halted_by {
                StepOutcome::Skipped {
                    reason: format!("run halted after {first} failed"),
                    blocked_by: Some(first),
                }
            } else if let Some(dep) =
                step.dependencies().into_iter().find(|d| blocked.contains(d))
            {
                StepOutcome::Skipped {
                    reason: format!("dependency {dep} did not complete"),
                    blocked_by: Some(dep),
                }
            } else {
                self.execute(run_id, step, &staged)
            };

            if outcome.blocks_dependents() {
                blocked.insert(step);
                if halt && outcome.is_failure() {
                    halted_by = Some(step);
                }
            }
            steps.push((step, outcome));
        }

        let report = RunReport { run_id, steps };
        if report.is_success() {
            tracing::info!(steps = report.steps.len(), "run completed");
        } else {
            tracing::warn!(failed = report.failures().count(), "run completed with failures");
        }
        report
    }

    fn execute(
        &self,
        run_id: Uuid,
        step: Step,
        staged: &BTreeMap<EntityKind, StagedBatch>,
    ) -> StepOutcome {
        let result = match step {
            Step::Conformed(entity) => match staged.get(&entity) {
                Some(batch) => self.warehouse.merge_conformed_in_run(Some(run_id), batch),
                None => {
                    return StepOutcome::Skipped {
                        reason: "no staged batch".to_string(),
                        blocked_by: None,
                    }
                }
            },
            Step::Dimension(kind) => self.warehouse.project_dimension_in_run(Some(run_id), kind),
            Step::Facts => self.warehouse.merge_facts_in_run(Some(run_id)),
        };
        match result {
            Ok(report) => StepOutcome::Succeeded(report),
            Err(err) => StepOutcome::Failed {
                kind: err.kind(),
                detail: err.to_string(),
            },
        }
    }
}
