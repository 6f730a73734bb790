//! # Reconciliation Engine
//!
//! Runs one reconciliation of an incoming snapshot against a historical store:
//!
//! ```text
//! raw records -> normalize -> fingerprint + diff -> changeset -> merge -> validate
//! ```
//!
//! Everything up to the merge is side-effect free; [`Scd2Engine::plan`] stops
//! there so a caller can inspect or discard the changeset. A failed run leaves
//! the store as it was.

use crate::changeset::{Changeset, ChangesetBuilder};
use crate::config::EngineConfig;
use crate::diff::{diff, DiffCounts};
use crate::error::ReconcileError;
use crate::merge::apply_changeset;
use crate::model::RunId;
use crate::normalize::{NormalizedBatch, Normalizer, RawRecord, SkippedRecord};
use crate::schema::DimensionSchema;
use crate::store::{ApplyResult, DimensionStore};
use crate::validate::{summarize, validate_rows, StoreSummary, Violation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

/// A computed, not yet applied, reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub run_id: RunId,
    /// The store held no rows when the plan was computed
    pub first_load: bool,
    pub records_read: usize,
    pub skipped: Vec<SkippedRecord>,
    pub counts: DiffCounts,
    pub changeset: Changeset,
}

impl ReconcilePlan {
    /// Report for a plan that is not applied; closes and inserts are the planned counts.
    pub fn preview(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            applied: false,
            first_load: self.first_load,
            records_read: self.records_read,
            records_skipped: self.skipped.len(),
            skipped: self.skipped.clone(),
            new: self.counts.new,
            changed: self.counts.changed,
            unchanged: self.counts.unchanged,
            closed: self.changeset.closes.len(),
            inserted: self.changeset.inserts.len(),
            violations: Vec::new(),
            summary: None,
        }
    }
}

/// Outcome of a reconciliation run, for the orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    /// Whether the changeset was submitted to the store
    pub applied: bool,
    pub first_load: bool,
    pub records_read: usize,
    pub records_skipped: usize,
    pub skipped: Vec<SkippedRecord>,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub closed: usize,
    pub inserted: usize,
    pub violations: Vec<Violation>,
    /// Row counts after the merge
    pub summary: Option<StoreSummary>,
}

impl RunReport {
    /// A run succeeds only if post-merge validation found nothing.
    pub fn succeeded(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Reconciles snapshots of one dimension.
#[derive(Debug, Clone)]
pub struct Scd2Engine {
    schema: DimensionSchema,
    config: EngineConfig,
}

impl Scd2Engine {
    pub fn new(schema: DimensionSchema, config: EngineConfig) -> Result<Self, ReconcileError> {
        schema.validate()?;
        Ok(Self { schema, config })
    }

    pub fn schema(&self) -> &DimensionSchema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute the changeset for `raws` against the store's current rows.
    ///
    /// Reads the store once and writes nothing.
    #[instrument(skip(self, store, raws), fields(dimension = %self.schema.name, records = raws.len()), level = "debug")]
    pub fn plan<S>(
        &self,
        store: &S,
        raws: &[RawRecord],
        ingested_at: OffsetDateTime,
    ) -> Result<ReconcilePlan, ReconcileError>
    where
        S: DimensionStore + ?Sized,
    {
        let run_id = RunId::new();
        let NormalizedBatch {
            records,
            indices,
            skipped,
        } = Normalizer::new(&self.schema, ingested_at)
            .normalize_batch(raws, self.config.malformed_policy)?;

        let current = store
            .read_current_rows()
            .map_err(|err| err.into_reconcile("read current rows"))?;
        let first_load = current.is_empty()
            && store
                .is_empty()
                .map_err(|err| err.into_reconcile("read row count"))?;

        let diff_result = diff(records, current).map_err(|err| match err {
            ReconcileError::DuplicateKeyInBatch {
                business_key,
                first_index,
                second_index,
            } => ReconcileError::DuplicateKeyInBatch {
                business_key,
                first_index: indices.get(first_index).copied().unwrap_or(first_index),
                second_index: indices.get(second_index).copied().unwrap_or(second_index),
            },
            other => other,
        })?;
        let counts = diff_result.counts();
        let changeset = ChangesetBuilder::new(run_id).build(diff_result)?;

        debug!(
            %run_id,
            first_load,
            classified = counts.total(),
            new = counts.new,
            changed = counts.changed,
            unchanged = counts.unchanged,
            operations = changeset.len(),
            "Planned reconciliation"
        );
        Ok(ReconcilePlan {
            run_id,
            first_load,
            records_read: raws.len(),
            skipped,
            counts,
            changeset,
        })
    }

    /// Submit a plan's changeset and validate the resulting history.
    #[instrument(skip(self, store, plan), fields(run_id = %plan.run_id), level = "debug")]
    pub fn apply_plan<S>(&self, store: &mut S, plan: ReconcilePlan) -> Result<RunReport, ReconcileError>
    where
        S: DimensionStore + ?Sized,
    {
        let applied: ApplyResult = apply_changeset(store, &plan.changeset)?;

        let rows = store
            .all_rows()
            .map_err(|err| err.into_reconcile("read history"))?;
        let violations = if self.config.validate_after_merge {
            validate_rows(&rows)
        } else {
            Vec::new()
        };
        for violation in &violations {
            warn!(business_key = %violation.business_key(), "{}", violation);
        }

        let mut report = plan.preview();
        report.applied = true;
        report.closed = applied.closed;
        report.inserted = applied.inserted;
        report.violations = violations;
        report.summary = Some(summarize(&rows));
        debug!(
            closed = report.closed,
            inserted = report.inserted,
            violations = report.violations.len(),
            "Applied reconciliation"
        );
        Ok(report)
    }

    /// Plan and apply in one step, stamping the current time as ingestion time.
    pub fn run<S>(&self, store: &mut S, raws: &[RawRecord]) -> Result<RunReport, ReconcileError>
    where
        S: DimensionStore + ?Sized,
    {
        self.run_at(store, raws, OffsetDateTime::now_utc())
    }

    pub fn run_at<S>(
        &self,
        store: &mut S,
        raws: &[RawRecord],
        ingested_at: OffsetDateTime,
    ) -> Result<RunReport, ReconcileError>
    where
        S: DimensionStore + ?Sized,
    {
        let plan = self.plan(store, raws, ingested_at)?;
        self.apply_plan(store, plan)
    }
}
