//! # Validator
//!
//! Post-merge checks over the full history of a dimension. Violations are
//! reported, never corrected. For every business key:
//!
//! - at most one row is current
//! - the current flag agrees with the end date (current iff open-ended)
//! - every interval is non-empty
//! - consecutive intervals meet exactly, with no gap and no overlap
//! - only the latest interval may be open-ended

use crate::error::ReconcileError;
use crate::model::{BusinessKey, DimensionRow, SurrogateKey};
use crate::store::DimensionStore;
use crate::temporal::{succession, Succession};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::Date;
use tracing::{debug, instrument, warn};

/// A broken dimension invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    DuplicateCurrent {
        business_key: BusinessKey,
        surrogate_keys: Vec<SurrogateKey>,
    },
    Overlap {
        business_key: BusinessKey,
        earlier: SurrogateKey,
        later: SurrogateKey,
    },
    Gap {
        business_key: BusinessKey,
        earlier: SurrogateKey,
        later: SurrogateKey,
        from: Date,
        to: Date,
    },
    FlagMismatch {
        business_key: BusinessKey,
        surrogate_key: SurrogateKey,
        is_current: bool,
        end_date: Option<Date>,
    },
    EmptyInterval {
        business_key: BusinessKey,
        surrogate_key: SurrogateKey,
        effective_date: Date,
        end_date: Date,
    },
    OpenBeforeLatest {
        business_key: BusinessKey,
        surrogate_key: SurrogateKey,
        latest: SurrogateKey,
    },
}

impl Violation {
    pub fn business_key(&self) -> &BusinessKey {
        match self {
            Violation::DuplicateCurrent { business_key, .. }
            | Violation::Overlap { business_key, .. }
            | Violation::Gap { business_key, .. }
            | Violation::FlagMismatch { business_key, .. }
            | Violation::EmptyInterval { business_key, .. }
            | Violation::OpenBeforeLatest { business_key, .. } => business_key,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DuplicateCurrent {
                business_key,
                surrogate_keys,
            } => write!(
                f,
                "`{}` has {} current rows",
                business_key,
                surrogate_keys.len()
            ),
            Violation::Overlap {
                business_key,
                earlier,
                later,
            } => write!(f, "`{}`: rows {} and {} overlap", business_key, earlier, later),
            Violation::Gap {
                business_key,
                from,
                to,
                ..
            } => write!(f, "`{}`: no row covers [{}, {})", business_key, from, to),
            Violation::FlagMismatch {
                business_key,
                surrogate_key,
                is_current,
                end_date,
            } => match end_date {
                Some(end) => write!(
                    f,
                    "`{}`: row {} has is_current={} but ends {}",
                    business_key, surrogate_key, is_current, end
                ),
                None => write!(
                    f,
                    "`{}`: row {} has is_current={} but no end date",
                    business_key, surrogate_key, is_current
                ),
            },
            Violation::EmptyInterval {
                business_key,
                surrogate_key,
                effective_date,
                end_date,
            } => write!(
                f,
                "`{}`: row {} has empty interval [{}, {})",
                business_key, surrogate_key, effective_date, end_date
            ),
            Violation::OpenBeforeLatest {
                business_key,
                surrogate_key,
                latest,
            } => write!(
                f,
                "`{}`: row {} is open-ended but {} follows it",
                business_key, surrogate_key, latest
            ),
        }
    }
}

/// Row counts of a dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub entities: usize,
    pub total: usize,
    pub current: usize,
    pub historical: usize,
}

pub fn summarize(rows: &[DimensionRow]) -> StoreSummary {
    let current = rows.iter().filter(|row| row.is_current).count();
    let entities = rows
        .iter()
        .map(|row| &row.business_key)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    StoreSummary {
        entities,
        total: rows.len(),
        current,
        historical: rows.len() - current,
    }
}

fn validate_entity(business_key: &BusinessKey, rows: &mut [&DimensionRow], out: &mut Vec<Violation>) {
    rows.sort_by(|a, b| {
        a.validity()
            .cmp(&b.validity())
            .then(a.surrogate_key.cmp(&b.surrogate_key))
    });

    let current: Vec<SurrogateKey> = rows
        .iter()
        .filter(|row| row.is_current)
        .map(|row| row.surrogate_key)
        .collect();
    if current.len() > 1 {
        out.push(Violation::DuplicateCurrent {
            business_key: business_key.clone(),
            surrogate_keys: current,
        });
    }

    for row in rows.iter() {
        let validity = row.validity();
        if row.is_current != validity.is_open() {
            out.push(Violation::FlagMismatch {
                business_key: business_key.clone(),
                surrogate_key: row.surrogate_key,
                is_current: row.is_current,
                end_date: row.end_date,
            });
        }
        match validity.end {
            Some(end_date) if validity.is_empty() => out.push(Violation::EmptyInterval {
                business_key: business_key.clone(),
                surrogate_key: row.surrogate_key,
                effective_date: validity.effective,
                end_date,
            }),
            _ => {}
        }
    }

    let Some(latest) = rows.last().map(|row| row.surrogate_key) else {
        return;
    };
    for pair in rows.windows(2) {
        let (earlier, later) = (pair[0], pair[1]);
        if earlier.validity().is_open() {
            out.push(Violation::OpenBeforeLatest {
                business_key: business_key.clone(),
                surrogate_key: earlier.surrogate_key,
                latest,
            });
            continue;
        }
        match succession(&earlier.validity(), &later.validity()) {
            Succession::Meets => {}
            Succession::Gap(_) => out.push(Violation::Gap {
                business_key: business_key.clone(),
                earlier: earlier.surrogate_key,
                later: later.surrogate_key,
                from: earlier.end_date.unwrap_or(later.effective_date),
                to: later.effective_date,
            }),
            Succession::Overlaps => out.push(Violation::Overlap {
                business_key: business_key.clone(),
                earlier: earlier.surrogate_key,
                later: later.surrogate_key,
            }),
        }
    }
}

/// Check every dimension invariant over a set of rows.
pub fn validate_rows(rows: &[DimensionRow]) -> Vec<Violation> {
    let mut by_key: BTreeMap<&BusinessKey, Vec<&DimensionRow>> = BTreeMap::new();
    for row in rows {
        by_key.entry(&row.business_key).or_default().push(row);
    }

    let mut violations = Vec::new();
    for (business_key, mut entity_rows) in by_key {
        validate_entity(business_key, &mut entity_rows, &mut violations);
    }
    violations
}

/// Validate the full history held by a store.
#[instrument(skip_all, level = "debug")]
pub fn validate<S>(store: &S) -> Result<Vec<Violation>, ReconcileError>
where
    S: DimensionStore + ?Sized,
{
    let rows = store
        .all_rows()
        .map_err(|err| err.into_reconcile("validate history"))?;
    let violations = validate_rows(&rows);
    if violations.is_empty() {
        debug!(rows = rows.len(), "History is consistent");
    } else {
        for violation in &violations {
            warn!(business_key = %violation.business_key(), "{}", violation);
        }
    }
    Ok(violations)
}
