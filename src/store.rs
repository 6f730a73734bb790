//! # Store Module
//!
//! The historical store boundary. A [`DimensionStore`] serves the current rows of
//! a dimension at a single point in time and applies a [`Changeset`] as one
//! atomic unit of work, re-checking the changeset's preconditions against stored
//! state inside that unit of work.

use crate::changeset::Changeset;
use crate::error::StoreError;
use crate::model::{BusinessKey, DimensionRow, SurrogateKey};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

/// Outcome of a successfully applied changeset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub closed: usize,
    pub inserted: usize,
}

/// Storage substrate for one dimension.
pub trait DimensionStore {
    /// Rows whose current flag is set, read at one consistent point in time.
    fn read_current_rows(&self) -> Result<Vec<DimensionRow>, StoreError>;

    /// Apply every close and insert of the changeset, or none of them.
    ///
    /// Fails with [`StoreError::Conflict`] if any precondition no longer holds.
    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<ApplyResult, StoreError>;

    /// Full history, ordered by business key then effective date.
    fn all_rows(&self) -> Result<Vec<DimensionRow>, StoreError>;

    /// All versions of one entity, oldest first.
    fn history(&self, business_key: &BusinessKey) -> Result<Vec<DimensionRow>, StoreError> {
        Ok(self
            .all_rows()?
            .into_iter()
            .filter(|row| &row.business_key == business_key)
            .collect())
    }

    fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.all_rows()?.len())
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.row_count()? == 0)
    }
}

/// Rows to write once a changeset has passed its precondition checks.
#[derive(Debug, Default)]
pub(crate) struct PreparedWrites {
    /// Rows being closed, already carrying their end date
    pub closed: Vec<DimensionRow>,
    pub inserted: Vec<DimensionRow>,
}

fn conflict(business_key: &BusinessKey, operation: &'static str, detail: String) -> StoreError {
    StoreError::Conflict {
        business_key: business_key.clone(),
        operation,
        detail,
    }
}

/// Check a changeset against stored state and compute the rows it writes.
///
/// `row_of` looks up a stored row by surrogate key and `current_of` the
/// surrogate key of the current row of a business key.
pub(crate) fn prepare_writes<R, C>(
    changeset: &Changeset,
    mut row_of: R,
    mut current_of: C,
) -> Result<PreparedWrites, StoreError>
where
    R: FnMut(&SurrogateKey) -> Result<Option<DimensionRow>, StoreError>,
    C: FnMut(&BusinessKey) -> Result<Option<SurrogateKey>, StoreError>,
{
    let mut writes = PreparedWrites::default();
    let mut closing: HashSet<SurrogateKey> = HashSet::with_capacity(changeset.closes.len());

    for close in &changeset.closes {
        if !closing.insert(close.surrogate_key) {
            return Err(conflict(
                &close.business_key,
                "close",
                format!("row {} is closed twice", close.surrogate_key),
            ));
        }
        let Some(mut row) = row_of(&close.surrogate_key)? else {
            return Err(conflict(
                &close.business_key,
                "close",
                format!("row {} does not exist", close.surrogate_key),
            ));
        };
        if row.business_key != close.business_key {
            return Err(conflict(
                &close.business_key,
                "close",
                format!(
                    "row {} belongs to `{}`",
                    close.surrogate_key, row.business_key
                ),
            ));
        }
        if !row.is_current || row.end_date.is_some() {
            return Err(conflict(
                &close.business_key,
                "close",
                format!("row {} is no longer current", close.surrogate_key),
            ));
        }
        if row.effective_date != close.effective_date {
            return Err(conflict(
                &close.business_key,
                "close",
                format!(
                    "row {} is effective from {}, expected {}",
                    close.surrogate_key, row.effective_date, close.effective_date
                ),
            ));
        }
        if close.end_date <= row.effective_date {
            return Err(conflict(
                &close.business_key,
                "close",
                format!(
                    "end date {} does not follow effective date {}",
                    close.end_date, row.effective_date
                ),
            ));
        }
        row.end_date = Some(close.end_date);
        row.is_current = false;
        writes.closed.push(row);
    }

    let mut minted: HashSet<SurrogateKey> = HashSet::with_capacity(changeset.inserts.len());
    let mut inserted_keys: HashSet<&BusinessKey> = HashSet::with_capacity(changeset.inserts.len());
    for insert in &changeset.inserts {
        let row = &insert.row;
        let key = &row.business_key;
        if !row.is_current || row.end_date.is_some() {
            return Err(conflict(
                key,
                "insert",
                format!("row {} is not an open current row", row.surrogate_key),
            ));
        }
        if !minted.insert(row.surrogate_key) || row_of(&row.surrogate_key)?.is_some() {
            return Err(conflict(
                key,
                "insert",
                format!("surrogate key {} is already in use", row.surrogate_key),
            ));
        }
        if !inserted_keys.insert(key) {
            return Err(conflict(
                key,
                "insert",
                "more than one current row inserted".to_string(),
            ));
        }
        if let Some(existing) = current_of(key)? {
            if !closing.contains(&existing) {
                return Err(conflict(
                    key,
                    "insert",
                    format!("current row {} is not closed by this changeset", existing),
                ));
            }
        }
        writes.inserted.push(row.clone());
    }

    Ok(writes)
}

fn history_order(rows: &mut [DimensionRow]) {
    rows.sort_by(|a, b| {
        a.business_key
            .cmp(&b.business_key)
            .then(a.effective_date.cmp(&b.effective_date))
            .then(a.surrogate_key.cmp(&b.surrogate_key))
    });
}

/// Hash-map backed store for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryDimensionStore {
    rows: HashMap<SurrogateKey, DimensionRow>,
    current: HashMap<BusinessKey, SurrogateKey>,
}

impl MemoryDimensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing rows, as-is.
    pub fn from_rows(rows: impl IntoIterator<Item = DimensionRow>) -> Self {
        let mut store = Self::new();
        for row in rows {
            if row.is_current {
                store
                    .current
                    .insert(row.business_key.clone(), row.surrogate_key);
            }
            store.rows.insert(row.surrogate_key, row);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

impl DimensionStore for MemoryDimensionStore {
    fn read_current_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        let mut rows: Vec<DimensionRow> = self
            .rows
            .values()
            .filter(|row| row.is_current)
            .cloned()
            .collect();
        history_order(&mut rows);
        Ok(rows)
    }

    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<ApplyResult, StoreError> {
        let writes = prepare_writes(
            changeset,
            |surrogate_key| Ok(self.rows.get(surrogate_key).cloned()),
            |business_key| Ok(self.current.get(business_key).copied()),
        )?;

        let result = ApplyResult {
            closed: writes.closed.len(),
            inserted: writes.inserted.len(),
        };
        for row in writes.closed {
            self.current.remove(&row.business_key);
            self.rows.insert(row.surrogate_key, row);
        }
        for row in writes.inserted {
            self.current
                .insert(row.business_key.clone(), row.surrogate_key);
            self.rows.insert(row.surrogate_key, row);
        }
        Ok(result)
    }

    fn all_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        let mut rows: Vec<DimensionRow> = self.rows.values().cloned().collect();
        history_order(&mut rows);
        Ok(rows)
    }

    fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{CloseOp, InsertOp};
    use crate::fingerprint::fingerprint_record;
    use crate::model::{AttrValue, Attribute, EntityAttributeRecord, RunId};
    use std::collections::BTreeMap;
    use time::macros::date;
    use time::{Date, OffsetDateTime};

    fn row(key: &str, blitz: i64, effective: Date, run: RunId, seq: u64) -> DimensionRow {
        let record = EntityAttributeRecord {
            business_key: BusinessKey::from(key),
            identity: BTreeMap::new(),
            tracked: vec![Attribute::new("rating_blitz", AttrValue::Int(blitz))],
            derived: vec![],
            as_of: effective,
            ingested_at: OffsetDateTime::UNIX_EPOCH,
        };
        let fingerprint = fingerprint_record(&record);
        DimensionRow::current_from(SurrogateKey::new(run, seq), record, fingerprint)
    }

    fn close_of(row: &DimensionRow, end_date: Date) -> CloseOp {
        CloseOp {
            surrogate_key: row.surrogate_key,
            business_key: row.business_key.clone(),
            effective_date: row.effective_date,
            end_date,
        }
    }

    #[test]
    fn test_apply_close_and_insert() {
        let seed_run = RunId::new();
        let original = row("alice_chess.com", 1500, date!(2024 - 01 - 01), seed_run, 0);
        let mut store = MemoryDimensionStore::from_rows(vec![original.clone()]);

        let run_id = RunId::new();
        let replacement = row("alice_chess.com", 1550, date!(2024 - 02 - 01), run_id, 0);
        let changeset = Changeset {
            run_id,
            closes: vec![close_of(&original, date!(2024 - 02 - 01))],
            inserts: vec![InsertOp {
                row: replacement.clone(),
            }],
        };
        let result = store.apply_changeset(&changeset).unwrap();
        assert_eq!(result, ApplyResult { closed: 1, inserted: 1 });

        let current = store.read_current_rows().unwrap();
        assert_eq!(current, vec![replacement]);
        let history = store
            .history(&BusinessKey::from("alice_chess.com"))
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].end_date, Some(date!(2024 - 02 - 01)));
        assert!(!history[0].is_current);
    }

    #[test]
    fn test_close_of_stale_row_conflicts_and_writes_nothing() {
        let run = RunId::new();
        let mut closed = row("alice_chess.com", 1500, date!(2024 - 01 - 01), run, 0);
        closed.is_current = false;
        closed.end_date = Some(date!(2024 - 02 - 01));
        let current = row("alice_chess.com", 1550, date!(2024 - 02 - 01), run, 1);
        let mut store = MemoryDimensionStore::from_rows(vec![closed.clone(), current]);
        let before = store.all_rows().unwrap();

        let stale = close_of(&closed, date!(2024 - 03 - 01));
        let other_run = RunId::new();
        let changeset = Changeset {
            run_id: other_run,
            closes: vec![stale],
            inserts: vec![InsertOp {
                row: row("alice_chess.com", 1600, date!(2024 - 03 - 01), other_run, 0),
            }],
        };
        let err = store.apply_changeset(&changeset).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { operation: "close", .. }));
        assert_eq!(store.all_rows().unwrap(), before);
    }

    #[test]
    fn test_insert_over_existing_current_conflicts() {
        let run = RunId::new();
        let current = row("alice_chess.com", 1500, date!(2024 - 01 - 01), run, 0);
        let mut store = MemoryDimensionStore::from_rows(vec![current]);

        let next_run = RunId::new();
        let changeset = Changeset {
            run_id: next_run,
            closes: vec![],
            inserts: vec![InsertOp {
                row: row("alice_chess.com", 1550, date!(2024 - 02 - 01), next_run, 0),
            }],
        };
        let err = store.apply_changeset(&changeset).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { operation: "insert", .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_surrogate_key_conflicts() {
        let run = RunId::new();
        let mut store = MemoryDimensionStore::new();
        let changeset = Changeset {
            run_id: run,
            closes: vec![],
            inserts: vec![
                InsertOp {
                    row: row("a_x", 1, date!(2024 - 01 - 01), run, 0),
                },
                InsertOp {
                    row: row("b_x", 2, date!(2024 - 01 - 01), run, 0),
                },
            ],
        };
        assert!(store.apply_changeset(&changeset).is_err());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_missing_close_target_conflicts() {
        let run = RunId::new();
        let ghost = row("ghost_x", 1, date!(2024 - 01 - 01), run, 7);
        let mut store = MemoryDimensionStore::new();
        let changeset = Changeset {
            run_id: run,
            closes: vec![close_of(&ghost, date!(2024 - 02 - 01))],
            inserts: vec![],
        };
        let err = store.apply_changeset(&changeset).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
