//! Error types for reconciliation runs.
//!
//! - [`ReconcileError`]: every failure that halts a run, surfaced to the caller
//! - [`RecordFault`]: why a single raw record failed normalization
//! - [`StoreError`]: failures reported by a [`crate::store::DimensionStore`]
//!
//! Every variant except [`ReconcileError::InvalidSchema`] is raised either before
//! any write is attempted or by the store's atomic apply, so a failed run leaves
//! the historical store as it was.

use crate::model::{BusinessKey, SurrogateKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

/// A single raw record that could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("field `{field}`: {problem}")]
pub struct RecordFault {
    /// Business key, when it could be built before the fault
    pub business_key: Option<BusinessKey>,
    pub field: String,
    pub problem: String,
}

impl RecordFault {
    pub fn new(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            business_key: None,
            field: field.into(),
            problem: problem.into(),
        }
    }

    pub fn with_key(mut self, business_key: &BusinessKey) -> Self {
        self.business_key = Some(business_key.clone());
        self
    }
}

/// Errors that halt a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A raw record failed normalization under the fail-fast policy.
    #[error("malformed record at index {index}{}: {fault}", fault_key_suffix(.fault))]
    MalformedRecord { index: usize, fault: RecordFault },

    /// The incoming snapshot names the same business key more than once.
    #[error("duplicate business key `{business_key}` in incoming batch (indices {first_index} and {second_index})")]
    DuplicateKeyInBatch {
        business_key: BusinessKey,
        first_index: usize,
        second_index: usize,
    },

    /// The historical store breaks a dimension invariant.
    #[error("invariant violation{}: {detail}", key_suffix(.business_key))]
    InvariantViolation {
        business_key: Option<BusinessKey>,
        detail: String,
    },

    /// A changed entity's as-of date does not advance past its current row.
    #[error(
        "out-of-order snapshot for `{business_key}`: as-of {as_of} does not advance past \
         effective date {effective_date} of current row {surrogate_key}"
    )]
    OutOfOrderSnapshot {
        business_key: BusinessKey,
        surrogate_key: SurrogateKey,
        effective_date: Date,
        as_of: Date,
    },

    /// The store rejected the changeset because of a concurrent write.
    #[error("merge conflict on `{business_key}` while applying {operation}: {detail}")]
    MergeConflict {
        business_key: BusinessKey,
        operation: String,
        detail: String,
    },

    /// The storage substrate could not serve the request.
    #[error("storage unavailable during {operation}")]
    StorageUnavailable {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// The dimension schema cannot drive normalization.
    #[error("invalid dimension schema: {0}")]
    InvalidSchema(String),
}

impl ReconcileError {
    /// Business key the error refers to, if any
    pub fn business_key(&self) -> Option<&BusinessKey> {
        match self {
            ReconcileError::MalformedRecord { fault, .. } => fault.business_key.as_ref(),
            ReconcileError::DuplicateKeyInBatch { business_key, .. }
            | ReconcileError::OutOfOrderSnapshot { business_key, .. }
            | ReconcileError::MergeConflict { business_key, .. } => Some(business_key),
            ReconcileError::InvariantViolation { business_key, .. } => business_key.as_ref(),
            ReconcileError::StorageUnavailable { .. } | ReconcileError::InvalidSchema(_) => None,
        }
    }

    /// Whether a scheduler may retry the whole run from a fresh diff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::MergeConflict { .. } | ReconcileError::StorageUnavailable { .. }
        )
    }
}

fn key_suffix(business_key: &Option<BusinessKey>) -> String {
    business_key
        .as_ref()
        .map(|key| format!(" for `{}`", key))
        .unwrap_or_default()
}

fn fault_key_suffix(fault: &RecordFault) -> String {
    key_suffix(&fault.business_key)
}

/// Errors reported by a dimension store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The changeset's preconditions no longer hold against stored state.
    #[error("conflict on `{business_key}` ({operation}): {detail}")]
    Conflict {
        business_key: BusinessKey,
        operation: &'static str,
        detail: String,
    },

    /// Transient substrate fault.
    #[error("storage unavailable: {0:#}")]
    Unavailable(#[source] anyhow::Error),

    /// Stored data could not be decoded.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Translate into the run-level taxonomy.
    pub fn into_reconcile(self, operation: &str) -> ReconcileError {
        match self {
            StoreError::Conflict {
                business_key,
                operation: store_operation,
                detail,
            } => ReconcileError::MergeConflict {
                business_key,
                operation: store_operation.to_string(),
                detail,
            },
            StoreError::Unavailable(source) => ReconcileError::StorageUnavailable {
                operation: operation.to_string(),
                source,
            },
            StoreError::Corrupt(detail) => ReconcileError::InvariantViolation {
                business_key: None,
                detail: format!("{operation}: {detail}"),
            },
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Unavailable(err.into())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
