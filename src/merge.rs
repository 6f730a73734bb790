//! Merge applier: submits a changeset to the store as one unit of work.

use crate::changeset::Changeset;
use crate::error::ReconcileError;
use crate::store::{ApplyResult, DimensionStore};
use tracing::{debug, instrument, warn};

const APPLY_OPERATION: &str = "apply changeset";

/// Submit `changeset` to the store.
///
/// An empty changeset is not submitted. Store conflicts surface as
/// [`ReconcileError::MergeConflict`] and substrate faults as
/// [`ReconcileError::StorageUnavailable`]; in both cases nothing was written and
/// the caller must recompute the diff before retrying.
#[instrument(skip_all, fields(run_id = %changeset.run_id, operations = changeset.len()), level = "debug")]
pub fn apply_changeset<S>(store: &mut S, changeset: &Changeset) -> Result<ApplyResult, ReconcileError>
where
    S: DimensionStore + ?Sized,
{
    if changeset.is_empty() {
        debug!("Empty changeset, nothing to submit");
        return Ok(ApplyResult::default());
    }

    match store.apply_changeset(changeset) {
        Ok(result) => {
            if result.closed != changeset.closes.len() || result.inserted != changeset.inserts.len()
            {
                return Err(ReconcileError::InvariantViolation {
                    business_key: None,
                    detail: format!(
                        "store applied {} closes and {} inserts, changeset holds {} and {}",
                        result.closed,
                        result.inserted,
                        changeset.closes.len(),
                        changeset.inserts.len()
                    ),
                });
            }
            Ok(result)
        }
        Err(err) => {
            let err = err.into_reconcile(APPLY_OPERATION);
            warn!(error = %err, "Changeset rejected by store");
            Err(err)
        }
    }
}
