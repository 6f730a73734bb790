//! # scd2_rs
//!
//! A Slowly Changing Dimension Type 2 reconciliation engine.
//!
//! Each run compares a full snapshot of entity attributes against the current
//! rows of a historical dimension and emits an atomic changeset that closes the
//! validity of superseded rows and inserts new current rows. Every business key
//! keeps a gap-free, non-overlapping sequence of `[effective, end)` intervals
//! with exactly one open-ended current row.

pub mod changeset;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod persistence;
pub mod schema;
pub mod store;
pub mod temporal;
pub mod validate;

// Re-export main types for convenience
pub use changeset::{Changeset, ChangesetBuilder, CloseOp, InsertOp};
pub use config::{EngineConfig, MalformedPolicy, Scd2Config, StoreConfig};
pub use diff::{diff, ChangeKind, Classification, DiffCounts, DiffResult};
pub use engine::{ReconcilePlan, RunReport, Scd2Engine};
pub use error::{ReconcileError, RecordFault, StoreError};
pub use fingerprint::{fingerprint, fingerprint_record, Fingerprint};
pub use model::{
    AttrValue, Attribute, BusinessKey, DimensionRow, EntityAttributeRecord, RunId, SurrogateKey,
};
pub use normalize::{parse_snapshot, Normalizer, RawRecord};
pub use persistence::{PersistentDimensionStore, PersistentOpenOptions};
pub use schema::DimensionSchema;
pub use store::{ApplyResult, DimensionStore, MemoryDimensionStore};
pub use temporal::Validity;
pub use validate::{validate, validate_rows, StoreSummary, Violation};
