//! # Persistent Dimension Store
//!
//! RocksDB storage for dimension history. Rows are bincode-encoded in the
//! `rows` column family under their 24-byte surrogate key. The `current`
//! column family maps each business key to its current row, so a run reads
//! only current rows however long the history grows. The `metadata` column
//! family holds the storage manifest and the last applied run.

use crate::changeset::Changeset;
use crate::error::StoreError;
use crate::model::{BusinessKey, DimensionRow, RunId, SurrogateKey};
use crate::store::{prepare_writes, ApplyResult, DimensionStore};
use anyhow::{anyhow, Result};
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use std::path::Path;
use tracing::debug;

const CF_ROWS: &str = "rows";
const CF_CURRENT: &str = "current";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_LAST_RUN: &[u8] = b"last_run";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Bookkeeping written with every applied changeset.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LastRun {
    pub run_id: RunId,
    pub closed: usize,
    pub inserted: usize,
}

/// RocksDB-backed historical store.
///
/// Rows live in the `rows` column family keyed by surrogate key; the `current`
/// column family maps each business key to the surrogate key of its current row.
/// Every changeset is written as a single `WriteBatch`.
pub struct PersistentDimensionStore {
    db: DB,
    sync_writes: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub sync_writes: bool,
}

impl PersistentDimensionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;
        Ok(Self {
            db,
            sync_writes: options.sync_writes,
        })
    }

    /// The last changeset applied to this store, if any.
    pub fn last_run(&self) -> Result<Option<LastRun>, StoreError> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(metadata_cf, KEY_LAST_RUN)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Unavailable(anyhow!("missing column family {name}")))
    }

    fn load_row(&self, surrogate_key: &SurrogateKey) -> Result<Option<DimensionRow>, StoreError> {
        let rows_cf = self.cf(CF_ROWS)?;
        match self.db.get_cf(rows_cf, surrogate_key.to_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_current_key(
        &self,
        business_key: &BusinessKey,
    ) -> Result<Option<SurrogateKey>, StoreError> {
        let current_cf = self.cf(CF_CURRENT)?;
        match self.db.get_cf(current_cf, business_key.as_str().as_bytes())? {
            Some(bytes) => decode_surrogate_key(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve every `current` index entry to its row, at one snapshot of the
    /// database. Entries must point at an existing current row of the same key.
    fn scan_current_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        let rows_cf = self.cf(CF_ROWS)?;
        let current_cf = self.cf(CF_CURRENT)?;
        let snapshot = self.db.snapshot();
        let mut rows = Vec::new();
        for entry in snapshot.iterator_cf(current_cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let surrogate_key = decode_surrogate_key(&value)?;
            let business_key = String::from_utf8_lossy(&key);
            let bytes = snapshot
                .get_cf(rows_cf, surrogate_key.to_bytes())?
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "current index points `{}` at missing row {}",
                        business_key, surrogate_key
                    ))
                })?;
            let row = decode_row(&bytes)?;
            if !row.is_current || row.business_key.as_str() != business_key {
                return Err(StoreError::Corrupt(format!(
                    "current index points `{}` at row {} of `{}` (is_current={})",
                    business_key, surrogate_key, row.business_key, row.is_current
                )));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Decode every row, at one snapshot of the database.
    fn scan_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        let rows_cf = self.cf(CF_ROWS)?;
        let snapshot = self.db.snapshot();
        let mut rows = Vec::new();
        for entry in snapshot.iterator_cf(rows_cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let row = decode_row(&value)?;
            if row.surrogate_key.to_bytes()[..] != key[..] {
                return Err(StoreError::Corrupt(format!(
                    "row {} stored under a different key",
                    row.surrogate_key
                )));
            }
            rows.push(row);
        }
        rows.sort_by(|a, b| {
            a.business_key
                .cmp(&b.business_key)
                .then(a.effective_date.cmp(&b.effective_date))
                .then(a.surrogate_key.cmp(&b.surrogate_key))
        });
        Ok(rows)
    }
}

impl DimensionStore for PersistentDimensionStore {
    fn read_current_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        self.scan_current_rows()
    }

    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<ApplyResult, StoreError> {
        let writes = prepare_writes(
            changeset,
            |surrogate_key| self.load_row(surrogate_key),
            |business_key| self.load_current_key(business_key),
        )?;

        let rows_cf = self.cf(CF_ROWS)?;
        let current_cf = self.cf(CF_CURRENT)?;
        let metadata_cf = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for row in &writes.closed {
            batch.put_cf(rows_cf, row.surrogate_key.to_bytes(), bincode::serialize(row)?);
            batch.delete_cf(current_cf, row.business_key.as_str().as_bytes());
        }
        for row in &writes.inserted {
            batch.put_cf(rows_cf, row.surrogate_key.to_bytes(), bincode::serialize(row)?);
            batch.put_cf(
                current_cf,
                row.business_key.as_str().as_bytes(),
                row.surrogate_key.to_bytes(),
            );
        }
        let result = ApplyResult {
            closed: writes.closed.len(),
            inserted: writes.inserted.len(),
        };
        let last_run = LastRun {
            run_id: changeset.run_id,
            closed: result.closed,
            inserted: result.inserted,
        };
        batch.put_cf(metadata_cf, KEY_LAST_RUN, bincode::serialize(&last_run)?);

        let mut write_options = WriteOptions::default();
        write_options.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_options)?;
        debug!(
            run_id = %changeset.run_id,
            closed = result.closed,
            inserted = result.inserted,
            "Wrote changeset batch"
        );
        Ok(result)
    }

    fn all_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        self.scan_rows()
    }
}

impl Drop for PersistentDimensionStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn decode_row(bytes: &[u8]) -> Result<DimensionRow, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_surrogate_key(bytes: &[u8]) -> Result<SurrogateKey, StoreError> {
    SurrogateKey::from_bytes(bytes).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "current index entry has {} bytes, expected {}",
            bytes.len(),
            SurrogateKey::ENCODED_LEN
        ))
    })
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_ROWS, Options::default()),
        ColumnFamilyDescriptor::new(CF_CURRENT, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{CloseOp, InsertOp};
    use crate::fingerprint::fingerprint_record;
    use crate::model::{AttrValue, Attribute, EntityAttributeRecord};
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use time::macros::date;
    use time::{Date, OffsetDateTime};

    fn row(key: &str, blitz: i64, effective: Date, run: RunId, seq: u64) -> DimensionRow {
        let record = EntityAttributeRecord {
            business_key: BusinessKey::from(key),
            identity: BTreeMap::from([("platform".to_string(), "chess.com".to_string())]),
            tracked: vec![Attribute::new("rating_blitz", AttrValue::Int(blitz))],
            derived: vec![Attribute::new("win_rate", AttrValue::Float(50.0))],
            as_of: effective,
            ingested_at: OffsetDateTime::UNIX_EPOCH,
        };
        let fingerprint = fingerprint_record(&record);
        DimensionRow::current_from(SurrogateKey::new(run, seq), record, fingerprint)
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let run_id = RunId::new();
        let inserted = row("alice_chess.com", 1500, date!(2024 - 01 - 01), run_id, 0);
        let mut store = PersistentDimensionStore::open(path).unwrap();
        let changeset = Changeset {
            run_id,
            closes: vec![],
            inserts: vec![InsertOp {
                row: inserted.clone(),
            }],
        };
        store.apply_changeset(&changeset).unwrap();
        drop(store);

        let store = PersistentDimensionStore::open(path).unwrap();
        assert_eq!(store.read_current_rows().unwrap(), vec![inserted]);
        assert_eq!(
            store.last_run().unwrap(),
            Some(LastRun {
                run_id,
                closed: 0,
                inserted: 1
            })
        );
    }

    #[test]
    fn persistent_store_closes_atomically() {
        let dir = tempdir().unwrap();
        let first_run = RunId::new();
        let original = row("alice_chess.com", 1500, date!(2024 - 01 - 01), first_run, 0);
        let mut store = PersistentDimensionStore::open_with_options(
            dir.path(),
            PersistentOpenOptions {
                repair: false,
                sync_writes: true,
            },
        )
        .unwrap();
        store
            .apply_changeset(&Changeset {
                run_id: first_run,
                closes: vec![],
                inserts: vec![InsertOp {
                    row: original.clone(),
                }],
            })
            .unwrap();

        let second_run = RunId::new();
        let replacement = row("alice_chess.com", 1550, date!(2024 - 02 - 01), second_run, 0);
        let close = CloseOp {
            surrogate_key: original.surrogate_key,
            business_key: original.business_key.clone(),
            effective_date: original.effective_date,
            end_date: date!(2024 - 02 - 01),
        };
        let changeset = Changeset {
            run_id: second_run,
            closes: vec![close],
            inserts: vec![InsertOp {
                row: replacement.clone(),
            }],
        };
        store.apply_changeset(&changeset).unwrap();

        // Re-submitting the same changeset must conflict and leave the store as-is.
        let before = store.all_rows().unwrap();
        let err = store.apply_changeset(&changeset).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.all_rows().unwrap(), before);

        assert_eq!(before.len(), 2);
        assert_eq!(before[0].end_date, Some(date!(2024 - 02 - 01)));
        assert!(!before[0].is_current);
        assert_eq!(store.read_current_rows().unwrap(), vec![replacement]);
    }

    #[test]
    fn current_rows_come_from_the_index() {
        let dir = tempdir().unwrap();
        let mut store = PersistentDimensionStore::open(dir.path()).unwrap();

        let first_run = RunId::new();
        let alice = row("alice_chess.com", 1500, date!(2024 - 01 - 01), first_run, 0);
        let bob = row("bob_lichess", 1800, date!(2024 - 01 - 01), first_run, 1);
        store
            .apply_changeset(&Changeset {
                run_id: first_run,
                closes: vec![],
                inserts: vec![InsertOp { row: bob.clone() }, InsertOp { row: alice.clone() }],
            })
            .unwrap();

        let second_run = RunId::new();
        let rerated = row("alice_chess.com", 1550, date!(2024 - 02 - 01), second_run, 0);
        store
            .apply_changeset(&Changeset {
                run_id: second_run,
                closes: vec![CloseOp {
                    surrogate_key: alice.surrogate_key,
                    business_key: alice.business_key.clone(),
                    effective_date: alice.effective_date,
                    end_date: date!(2024 - 02 - 01),
                }],
                inserts: vec![InsertOp {
                    row: rerated.clone(),
                }],
            })
            .unwrap();

        // Ordered by business key, closed versions excluded.
        assert_eq!(store.read_current_rows().unwrap(), vec![rerated, bob]);
        assert_eq!(store.row_count().unwrap(), 3);
    }

    #[test]
    fn dangling_current_index_entry_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = PersistentDimensionStore::open(dir.path()).unwrap();
        let missing = SurrogateKey::new(RunId::new(), 7);
        let current_cf = store.cf(CF_CURRENT).unwrap();
        store
            .db
            .put_cf(current_cf, b"carol_chess.com", missing.to_bytes())
            .unwrap();

        let err = store.read_current_rows().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.to_string().contains("carol_chess.com"));
    }

    #[test]
    fn persistent_store_checkpoint_restores() {
        let dir = tempdir().unwrap();
        let checkpoint_dir = tempdir().unwrap();
        let checkpoint_path = checkpoint_dir.path().join("snapshot");

        let run_id = RunId::new();
        let mut store = PersistentDimensionStore::open(dir.path()).unwrap();
        store
            .apply_changeset(&Changeset {
                run_id,
                closes: vec![],
                inserts: vec![InsertOp {
                    row: row("bob_lichess", 1800, date!(2024 - 01 - 01), run_id, 0),
                }],
            })
            .unwrap();
        store.checkpoint(&checkpoint_path).unwrap();
        drop(store);

        let restored = PersistentDimensionStore::open(&checkpoint_path).unwrap();
        assert_eq!(restored.row_count().unwrap(), 1);
    }
}
