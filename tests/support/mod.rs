use scd2_rs::config::{EngineConfig, MalformedPolicy};
use scd2_rs::{
    ApplyResult, Changeset, DimensionRow, DimensionSchema, DimensionStore, MemoryDimensionStore,
    RawRecord, Scd2Engine, StoreError,
};
use serde_json::Value;

#[allow(dead_code)]
pub fn player(username: &str, platform: &str, date: &str, blitz: i64) -> RawRecord {
    RawRecord::new()
        .with("username", username)
        .with("platform", platform)
        .with("data_date", date)
        .with("rating_blitz", blitz)
        .with("rating_rapid", 1600)
        .with("rating_bullet", 1400)
        .with("rating_classical", Value::Null)
        .with("games_played", 200)
        .with("wins", 110)
        .with("losses", 80)
        .with("draws", 10)
}

#[allow(dead_code)]
pub fn player_engine() -> Scd2Engine {
    engine_with_policy(MalformedPolicy::FailFast)
}

#[allow(dead_code)]
pub fn engine_with_policy(policy: MalformedPolicy) -> Scd2Engine {
    Scd2Engine::new(
        DimensionSchema::player_rating(),
        EngineConfig {
            malformed_policy: policy,
            validate_after_merge: true,
        },
    )
    .expect("player rating schema")
}

/// What a [`FaultyStore`] does on the next apply.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Reads fail as if the substrate were down
    UnavailableOnRead,
    /// The apply call fails as if the substrate were down
    UnavailableOnApply,
    /// Another writer applies this changeset first
    ConcurrentWrite,
}

/// Memory store wrapper that injects substrate faults.
#[allow(dead_code)]
pub struct FaultyStore {
    pub inner: MemoryDimensionStore,
    pub fault: Fault,
    /// Changeset applied by the simulated concurrent writer
    pub interloper: Option<Changeset>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: MemoryDimensionStore) -> Self {
        Self {
            inner,
            fault: Fault::None,
            interloper: None,
        }
    }
}

impl DimensionStore for FaultyStore {
    fn read_current_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        if self.fault == Fault::UnavailableOnRead {
            return Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")));
        }
        self.inner.read_current_rows()
    }

    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<ApplyResult, StoreError> {
        match self.fault {
            Fault::UnavailableOnApply => {
                Err(StoreError::Unavailable(anyhow::anyhow!("write timed out")))
            }
            Fault::ConcurrentWrite => {
                if let Some(interloper) = self.interloper.take() {
                    self.inner.apply_changeset(&interloper)?;
                }
                self.inner.apply_changeset(changeset)
            }
            Fault::None | Fault::UnavailableOnRead => self.inner.apply_changeset(changeset),
        }
    }

    fn all_rows(&self) -> Result<Vec<DimensionRow>, StoreError> {
        self.inner.all_rows()
    }
}
