//! # Data Model
//!
//! Core data structures for dimension reconciliation: business keys, surrogate
//! keys, attribute values, normalized entity records and dimension rows.

use crate::fingerprint::Fingerprint;
use crate::temporal::Validity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Natural, source-derived identifier of an entity (e.g. `alice_chess.com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessKey(pub String);

impl BusinessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusinessKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Mint a fresh random run identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Engine-assigned identity of one dimension row version.
///
/// Encodes the minting run and a run-local sequence number. Uniqueness follows
/// from the run id being random and the sequence being monotonic within a run;
/// the ordering carries no meaning across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurrogateKey {
    /// The run that minted this key
    pub run_id: Uuid,
    /// Sequence number within the run
    pub seq: u64,
}

impl SurrogateKey {
    /// Encoded length of [`SurrogateKey::to_bytes`]
    pub const ENCODED_LEN: usize = 24;

    pub fn new(run_id: RunId, seq: u64) -> Self {
        Self {
            run_id: run_id.0,
            seq,
        }
    }

    /// Encode as bytes for storage: 16 uuid bytes followed by the big-endian sequence
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..16].copy_from_slice(self.run_id.as_bytes());
        bytes[16..].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let run_id = Uuid::from_slice(&bytes[..16]).ok()?;
        let seq = u64::from_be_bytes(bytes[16..].try_into().ok()?);
        Some(Self { run_id, seq })
    }
}

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SK{}.{}", self.run_id.simple(), self.seq)
    }
}

/// Run-scoped surrogate key source.
#[derive(Debug, Clone)]
pub struct SurrogateKeyGenerator {
    run_id: RunId,
    next: u64,
}

impl SurrogateKeyGenerator {
    pub fn new(run_id: RunId) -> Self {
        Self { run_id, next: 0 }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Mint the next key for this run
    pub fn next_key(&mut self) -> SurrogateKey {
        let key = SurrogateKey::new(self.run_id, self.next);
        self.next += 1;
        key
    }

    /// Number of keys minted so far
    pub fn minted(&self) -> u64 {
        self.next
    }
}

/// A typed attribute value. `Null` marks an absent value.
///
/// Must stay externally tagged: persisted rows are bincode-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Null,
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            AttrValue::Int(value) => Some(value as f64),
            AttrValue::Float(value) => Some(value),
            AttrValue::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            AttrValue::Int(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(value) => write!(f, "{}", value),
            AttrValue::Float(value) => write!(f, "{}", value),
            AttrValue::Null => f.write_str("null"),
        }
    }
}

/// A named attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a AttrValue> {
    attributes
        .iter()
        .find(|attribute| attribute.name == name)
        .map(|attribute| &attribute.value)
}

/// A normalized incoming snapshot record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAttributeRecord {
    pub business_key: BusinessKey,
    /// Identifying fields the business key was built from, by column name
    pub identity: BTreeMap<String, String>,
    /// Tracked attributes in schema order
    pub tracked: Vec<Attribute>,
    /// Attributes derived from the tracked set
    pub derived: Vec<Attribute>,
    /// Logical date of the snapshot
    pub as_of: Date,
    pub ingested_at: OffsetDateTime,
}

impl EntityAttributeRecord {
    /// Tracked values in schema order
    pub fn tracked_values(&self) -> impl Iterator<Item = &AttrValue> {
        self.tracked.iter().map(|attribute| &attribute.value)
    }

    /// Look up a tracked or derived attribute by name
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        find_attribute(&self.tracked, name).or_else(|| find_attribute(&self.derived, name))
    }
}

/// One version of an entity in the historical store.
///
/// Created only by an insert (current, open-ended) and mutated at most once by
/// a close, which sets `end_date` and clears `is_current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRow {
    pub surrogate_key: SurrogateKey,
    pub business_key: BusinessKey,
    pub identity: BTreeMap<String, String>,
    pub tracked: Vec<Attribute>,
    pub derived: Vec<Attribute>,
    pub fingerprint: Fingerprint,
    /// Inclusive start of validity
    pub effective_date: Date,
    /// Exclusive end of validity, unset while current
    pub end_date: Option<Date>,
    pub is_current: bool,
    /// Ingestion timestamp of the snapshot that produced this version
    pub ingested_at: OffsetDateTime,
}

impl DimensionRow {
    /// Build the current row for a freshly observed entity state
    pub fn current_from(
        surrogate_key: SurrogateKey,
        record: EntityAttributeRecord,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            surrogate_key,
            business_key: record.business_key,
            identity: record.identity,
            tracked: record.tracked,
            derived: record.derived,
            fingerprint,
            effective_date: record.as_of,
            end_date: None,
            is_current: true,
            ingested_at: record.ingested_at,
        }
    }

    pub fn validity(&self) -> Validity {
        Validity {
            effective: self.effective_date,
            end: self.end_date,
        }
    }

    /// Look up a tracked or derived attribute by name
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        find_attribute(&self.tracked, name).or_else(|| find_attribute(&self.derived, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surrogate_key_bytes() {
        let run = RunId::new();
        let key = SurrogateKey::new(run, 42);
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), SurrogateKey::ENCODED_LEN);
        assert_eq!(SurrogateKey::from_bytes(&bytes), Some(key));
        assert_eq!(SurrogateKey::from_bytes(&bytes[..20]), None);
    }

    #[test]
    fn test_generator_is_monotonic_and_unique() {
        let mut generator = SurrogateKeyGenerator::new(RunId::new());
        let first = generator.next_key();
        let second = generator.next_key();
        assert_ne!(first, second);
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(generator.minted(), 2);

        let mut other_run = SurrogateKeyGenerator::new(RunId::new());
        assert_ne!(other_run.next_key(), first);
    }

    #[test]
    fn test_attr_value_accessors() {
        assert_eq!(AttrValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(AttrValue::Float(0.5).as_i64(), None);
        assert!(AttrValue::Null.is_null());
        assert_eq!(AttrValue::Null.to_string(), "null");
    }

    #[test]
    fn test_attr_value_json_shape() {
        let json = serde_json::to_string(&vec![AttrValue::Int(1500), AttrValue::Null]).unwrap();
        assert_eq!(json, r#"[{"int":1500},"null"]"#);

        let bytes = bincode::serialize(&AttrValue::Float(52.5)).unwrap();
        let decoded: AttrValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, AttrValue::Float(52.5));
    }
}
