//! # Temporal Module
//!
//! Validity intervals for dimension rows. Intervals are half-open over calendar
//! dates: `[effective, end)`. The effective date is inclusive, the end date is
//! exclusive, and an unset end means the interval is still open ("current").
//!
//! Half-open intervals make adjacent versions `[d0, d1)` and `[d1, d2)` meet
//! exactly, with neither a gap nor a shared day.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use time::Date;

/// A validity interval `[effective, end)` where `effective < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validity {
    /// Start date (inclusive)
    pub effective: Date,
    /// End date (exclusive), `None` while the interval is open
    pub end: Option<Date>,
}

impl Validity {
    /// Create an open interval starting at `effective`
    pub fn open(effective: Date) -> Self {
        Self {
            effective,
            end: None,
        }
    }

    /// Whether the interval has no end date
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Check if this interval is empty. Only reachable for rows read back
    /// from a damaged store.
    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end <= self.effective)
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.effective, end),
            None => write!(f, "[{}, +∞)", self.effective),
        }
    }
}

impl PartialOrd for Validity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Validity {
    /// Orders by effective date, then by end date with open ends last.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.effective.cmp(&other.effective) {
            Ordering::Equal => match (self.end, other.end) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            ordering => ordering,
        }
    }
}

/// How an earlier interval relates to the one that follows it in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Succession {
    /// `earlier.end == later.effective`
    Meets,
    /// `earlier.end < later.effective`; the number of uncovered days
    Gap(i64),
    /// The intervals share at least one day
    Overlaps,
}

/// Classify two intervals ordered by effective date.
pub fn succession(earlier: &Validity, later: &Validity) -> Succession {
    match earlier.end {
        None => Succession::Overlaps,
        Some(end) => match end.cmp(&later.effective) {
            Ordering::Equal => Succession::Meets,
            Ordering::Less => Succession::Gap((later.effective - end).whole_days()),
            Ordering::Greater => Succession::Overlaps,
        },
    }
}
