//! Date-range partitions of the fact table.
//!
//! Partitions are half-open `[start, end)` month spans of a fixed width,
//! aligned so that `month_index % width == 0` (month index counts months
//! since year 0). The set is contiguous and only ever grows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::model::TableId;

/// Default partition width in months.
pub const DEFAULT_PARTITION_WIDTH_MONTHS: u32 = 3;

/// One date-range partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
}

impl Partition {
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn coverage_error(detail: impl Into<String>) -> MergeError {
    MergeError::PartitionCoverage {
        table: TableId::Facts,
        detail: detail.into(),
    }
}

/// Contiguous, append-only set of partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSet {
    width_months: u32,
    partitions: BTreeMap<NaiveDate, Partition>,
}

impl Default for PartitionSet {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION_WIDTH_MONTHS)
    }
}

impl PartitionSet {
    /// Creates an empty set. A zero width is treated as one month.
    #[must_use]
    pub fn new(width_months: u32) -> Self {
        Self {
            width_months: width_months.max(1),
            partitions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn width_months(&self) -> u32 {
        self.width_months
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// The partition starting at `start`.
    #[must_use]
    pub fn get(&self, start: NaiveDate) -> Option<&Partition> {
        self.partitions.get(&start)
    }

    /// The partition holding `date`.
    #[must_use]
    pub fn locate(&self, date: NaiveDate) -> Option<&Partition> {
        self.partitions
            .range(..=date)
            .next_back()
            .map(|(_, p)| p)
            .filter(|p| p.contains(date))
    }

    /// First day of the aligned partition holding `date`.
    fn aligned_start(&self, date: NaiveDate) -> Result<NaiveDate, MergeError> {
        let index = i64::from(date.year()) * 12 + i64::from(date.month0());
        let start = index - index.rem_euclid(i64::from(self.width_months));
        let out_of_range = || coverage_error(format!("{date} out of range"));
        let year = i32::try_from(start.div_euclid(12)).map_err(|_| out_of_range())?;
        let month = u32::try_from(start.rem_euclid(12) + 1).map_err(|_| out_of_range())?;
        NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(out_of_range)
    }

    fn span_from(&self, start: NaiveDate) -> Result<Partition, MergeError> {
        let end = start
            .checked_add_months(Months::new(self.width_months))
            .ok_or_else(|| {
                coverage_error(format!("partition starting {start} overflows the calendar"))
            })?;
        Ok(Partition { start, end })
    }

    /// Creates whatever partitions are needed so that `date` is covered,
    /// filling any gap to the existing range. Returns the new partitions.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::PartitionCoverage` for dates at the edge of the
    /// representable calendar.
    pub fn ensure_covering(&mut self, date: NaiveDate) -> Result<Vec<Partition>, MergeError> {
        if self.locate(date).is_some() {
            return Ok(Vec::new());
        }
        let target = self.aligned_start(date)?;
        let first = self.partitions.values().next().copied();
        let last = self.partitions.values().next_back().copied();

        let (mut cursor, stop) = match (first, last) {
            (Some(first), Some(_)) if date < first.start => (target, first.start),
            (Some(_), Some(last)) => (last.end, self.span_from(target)?.end),
            _ => (target, self.span_from(target)?.end),
        };

        let mut created = Vec::new();
        while cursor < stop {
            let partition = self.span_from(cursor)?;
            self.partitions.insert(partition.start, partition);
            created.push(partition);
            cursor = partition.end;
        }

        if self.locate(date).is_none() {
            return Err(coverage_error(format!("no partition covers {date} after growth")));
        }
        for partition in &created {
            tracing::info!(table = %TableId::Facts, partition = %partition, "partition created");
        }
        Ok(created)
    }

    /// True when every partition ends where the next one starts.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.partitions
            .values()
            .zip(self.partitions.values().skip(1))
            .all(|(a, b)| a.end == b.start)
    }
}
