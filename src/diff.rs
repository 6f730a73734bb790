//! # Diff Engine
//!
//! Joins a normalized snapshot against the current rows of the historical store
//! on business key and classifies every incoming entity:
//!
//! - `New`: no current row for the business key
//! - `Changed`: a current row exists with a different fingerprint
//! - `Unchanged`: a current row exists with the same fingerprint
//!
//! An empty historical store is the degenerate case where everything is new; it
//! takes the same path as any other run.

use crate::error::ReconcileError;
use crate::fingerprint::{fingerprint_record, Fingerprint};
use crate::model::{BusinessKey, DimensionRow, EntityAttributeRecord, SurrogateKey};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

/// Classification label of an incoming entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::New => "NEW",
            ChangeKind::Changed => "CHANGED",
            ChangeKind::Unchanged => "UNCHANGED",
        };
        f.write_str(label)
    }
}

/// Classification together with the matching current row, when there is one.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    New,
    Changed { current: DimensionRow },
    Unchanged { current: SurrogateKey },
}

/// An incoming record with its freshly computed fingerprint and classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEntity {
    pub record: EntityAttributeRecord,
    pub fingerprint: Fingerprint,
    pub classification: Classification,
}

impl ClassifiedEntity {
    pub fn kind(&self) -> ChangeKind {
        match self.classification {
            Classification::New => ChangeKind::New,
            Classification::Changed { .. } => ChangeKind::Changed,
            Classification::Unchanged { .. } => ChangeKind::Unchanged,
        }
    }
}

/// Per-class entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

impl DiffCounts {
    pub fn total(&self) -> usize {
        self.new + self.changed + self.unchanged
    }
}

/// Output of [`diff`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    /// Classified entities, in snapshot order
    pub entities: Vec<ClassifiedEntity>,
}

impl DiffResult {
    pub fn counts(&self) -> DiffCounts {
        let mut counts = DiffCounts::default();
        for entity in &self.entities {
            match entity.kind() {
                ChangeKind::New => counts.new += 1,
                ChangeKind::Changed => counts.changed += 1,
                ChangeKind::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }

    /// Entities that require a write
    pub fn actionable(&self) -> impl Iterator<Item = &ClassifiedEntity> {
        self.entities
            .iter()
            .filter(|entity| entity.kind() != ChangeKind::Unchanged)
    }

    pub fn is_all_unchanged(&self) -> bool {
        self.actionable().next().is_none()
    }
}

/// Index the current rows by business key, rejecting any that break the
/// one-current-row-per-key invariant.
fn index_current(
    current: Vec<DimensionRow>,
) -> Result<HashMap<BusinessKey, DimensionRow>, ReconcileError> {
    let mut by_key: HashMap<BusinessKey, DimensionRow> = HashMap::with_capacity(current.len());
    for row in current {
        if !row.is_current || row.end_date.is_some() {
            return Err(ReconcileError::InvariantViolation {
                business_key: Some(row.business_key.clone()),
                detail: format!(
                    "row {} was read as current but has is_current={} and end date {:?}",
                    row.surrogate_key, row.is_current, row.end_date
                ),
            });
        }
        if let Some(existing) = by_key.get(&row.business_key) {
            return Err(ReconcileError::InvariantViolation {
                business_key: Some(row.business_key.clone()),
                detail: format!(
                    "multiple current rows ({} and {})",
                    existing.surrogate_key, row.surrogate_key
                ),
            });
        }
        by_key.insert(row.business_key.clone(), row);
    }
    Ok(by_key)
}

/// Classify an incoming snapshot against the current historical rows.
///
/// # Errors
/// - [`ReconcileError::DuplicateKeyInBatch`] if two incoming records share a business key
/// - [`ReconcileError::InvariantViolation`] if the current rows hold more than one
///   current row for a key, or a row that is not actually current
#[instrument(skip_all, fields(incoming = incoming.len(), current = current.len()), level = "debug")]
pub fn diff(
    incoming: Vec<EntityAttributeRecord>,
    current: Vec<DimensionRow>,
) -> Result<DiffResult, ReconcileError> {
    let mut seen: HashMap<BusinessKey, usize> = HashMap::with_capacity(incoming.len());
    for (index, record) in incoming.iter().enumerate() {
        if let Some(&first_index) = seen.get(&record.business_key) {
            return Err(ReconcileError::DuplicateKeyInBatch {
                business_key: record.business_key.clone(),
                first_index,
                second_index: index,
            });
        }
        seen.insert(record.business_key.clone(), index);
    }

    let mut current_by_key = index_current(current)?;

    let entities: Vec<ClassifiedEntity> = incoming
        .into_iter()
        .map(|record| {
            let fingerprint = fingerprint_record(&record);
            let classification = match current_by_key.remove(&record.business_key) {
                None => Classification::New,
                Some(row) if row.fingerprint == fingerprint => Classification::Unchanged {
                    current: row.surrogate_key,
                },
                Some(row) => Classification::Changed { current: row },
            };
            ClassifiedEntity {
                record,
                fingerprint,
                classification,
            }
        })
        .collect();

    let result = DiffResult { entities };
    let counts = result.counts();
    debug!(
        new = counts.new,
        changed = counts.changed,
        unchanged = counts.unchanged,
        unobserved = current_by_key.len(),
        "Classified snapshot"
    );
    Ok(result)
}
