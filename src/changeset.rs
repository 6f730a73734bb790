//! # Changeset Builder
//!
//! Turns a classified diff into the in-memory set of CLOSE and INSERT operations
//! for one run. Nothing here touches the store: the changeset is a plain value
//! that can be inspected, logged or discarded before submission.
//!
//! - `New` entity: one INSERT, open-ended from the record's as-of date
//! - `Changed` entity: a CLOSE of the current row ending at the record's as-of
//!   date plus an INSERT starting at the same date
//! - `Unchanged` entity: nothing

use crate::diff::{Classification, DiffResult};
use crate::error::ReconcileError;
use crate::model::{BusinessKey, DimensionRow, RunId, SurrogateKey, SurrogateKeyGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::Date;
use tracing::{debug, instrument};

/// Ends the validity of a current row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOp {
    pub surrogate_key: SurrogateKey,
    pub business_key: BusinessKey,
    /// Effective date of the row being closed, as read at diff time
    pub effective_date: Date,
    /// New exclusive end of the row's validity
    pub end_date: Date,
}

/// Adds a new current row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOp {
    pub row: DimensionRow,
}

/// All operations of one run, applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub run_id: RunId,
    pub closes: Vec<CloseOp>,
    pub inserts: Vec<InsertOp>,
}

impl Changeset {
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            closes: Vec::new(),
            inserts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty() && self.inserts.is_empty()
    }

    /// Total number of operations
    pub fn len(&self) -> usize {
        self.closes.len() + self.inserts.len()
    }

    /// Business keys touched by any operation, sorted
    pub fn business_keys(&self) -> BTreeSet<&BusinessKey> {
        self.closes
            .iter()
            .map(|close| &close.business_key)
            .chain(self.inserts.iter().map(|insert| &insert.row.business_key))
            .collect()
    }
}

/// Builds changesets, minting surrogate keys from a run-scoped generator.
#[derive(Debug)]
pub struct ChangesetBuilder {
    keys: SurrogateKeyGenerator,
}

impl ChangesetBuilder {
    pub fn new(run_id: RunId) -> Self {
        Self {
            keys: SurrogateKeyGenerator::new(run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.keys.run_id()
    }

    /// Build the changeset for a classified snapshot.
    ///
    /// Fails with [`ReconcileError::OutOfOrderSnapshot`] when a changed entity's
    /// as-of date does not fall strictly after the effective date of its current
    /// row. No partial changeset is returned in that case.
    #[instrument(skip_all, fields(run_id = %self.keys.run_id()), level = "debug")]
    pub fn build(mut self, diff: DiffResult) -> Result<Changeset, ReconcileError> {
        let mut changeset = Changeset::empty(self.keys.run_id());

        for entity in diff.entities {
            match entity.classification {
                Classification::Unchanged { .. } => {}
                Classification::New => {
                    let row = DimensionRow::current_from(
                        self.keys.next_key(),
                        entity.record,
                        entity.fingerprint,
                    );
                    changeset.inserts.push(InsertOp { row });
                }
                Classification::Changed { current } => {
                    let as_of = entity.record.as_of;
                    if as_of <= current.effective_date {
                        return Err(ReconcileError::OutOfOrderSnapshot {
                            business_key: current.business_key,
                            surrogate_key: current.surrogate_key,
                            effective_date: current.effective_date,
                            as_of,
                        });
                    }
                    changeset.closes.push(CloseOp {
                        surrogate_key: current.surrogate_key,
                        business_key: current.business_key,
                        effective_date: current.effective_date,
                        end_date: as_of,
                    });
                    let row = DimensionRow::current_from(
                        self.keys.next_key(),
                        entity.record,
                        entity.fingerprint,
                    );
                    changeset.inserts.push(InsertOp { row });
                }
            }
        }

        debug!(
            closes = changeset.closes.len(),
            inserts = changeset.inserts.len(),
            minted = self.keys.minted(),
            "Built changeset"
        );
        Ok(changeset)
    }
}
