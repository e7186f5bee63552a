//! Validity windows and the injected clock.
//!
//! Versioned rows carry a half-open window `[valid_from, valid_to)`. An
//! active version's window ends at [`open_ended_validity`]; retiring it
//! sets `valid_to` to the instant its replacement starts.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::open_ended_validity;

/// A half-open validity interval `[valid_from, valid_to)`.
///
/// # Examples
///
/// ```
/// use starmerge::ValidityWindow;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let mut window = ValidityWindow::open_at(now);
/// assert!(window.is_open_ended());
///
/// let later = now + Duration::hours(1);
/// window.close_at(later).unwrap();
/// assert!(window.contains(now));
/// assert!(!window.contains(later));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// Start of the window (inclusive).
    pub valid_from: DateTime<Utc>,

    /// End of the window (exclusive). Equals the open-ended sentinel while active.
    pub valid_to: DateTime<Utc>,
}

impl ValidityWindow {
    /// Opens a window starting at `from` with no upper bound.
    #[must_use]
    pub fn open_at(from: DateTime<Utc>) -> Self {
        Self {
            valid_from: from,
            valid_to: open_ended_validity(),
        }
    }

    /// Window of the unknown-member row: from the epoch, never closed.
    #[must_use]
    pub fn forever() -> Self {
        Self::open_at(DateTime::UNIX_EPOCH)
    }

    /// Returns true while the window has no upper bound.
    #[must_use]
    pub fn is_open_ended(&self) -> bool {
        self.valid_to == open_ended_validity()
    }

    /// Closes the window at `at`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the window is already closed
    /// or `at` precedes `valid_from`.
    pub fn close_at(&mut self, at: DateTime<Utc>) -> Result<(), String> {
        if !self.is_open_ended() {
            return Err(format!("window already closed at {}", self.valid_to));
        }
        if at < self.valid_from {
            return Err(format!(
                "cannot close at {at}, window starts at {}",
                self.valid_from
            ));
        }
        self.valid_to = at;
        Ok(())
    }

    /// Check if a timestamp falls within this window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && at < self.valid_to
    }

    /// Returns true if the two windows share an instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.valid_from < other.valid_to && other.valid_from < self.valid_to
    }

    /// Returns true if `next` starts exactly where this window ends.
    #[must_use]
    pub fn abuts(&self, next: &Self) -> bool {
        self.valid_to == next.valid_from
    }
}

/// Source of "now" for merge timestamps.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Moves the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = at;
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut guard = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
