//! # Snapshot Normalizer
//!
//! Maps raw snapshot records onto the canonical [`EntityAttributeRecord`] shape
//! described by a [`DimensionSchema`]: builds the business key, coerces tracked
//! attributes to their declared types, computes derived attributes and parses
//! the as-of date. Normalization is a pure mapping; the ingestion timestamp is
//! supplied by the caller once per run.

use crate::config::MalformedPolicy;
use crate::error::{ReconcileError, RecordFault};
use crate::model::{AttrValue, Attribute, BusinessKey, EntityAttributeRecord};
use crate::schema::{AttrType, DerivedRule, DimensionSchema, KEY_ESCAPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, warn};

static NULL_VALUE: Value = Value::Null;

/// One raw record as delivered by the upstream snapshot source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field setter
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Parse a snapshot file body: either a JSON array of objects or JSON lines.
pub fn parse_snapshot(text: &str) -> Result<Vec<RawRecord>, serde_json::Error> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<RawRecord>(line))
        .collect()
}

/// A raw record dropped under [`MalformedPolicy::Skip`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Position in the incoming snapshot
    pub index: usize,
    pub fault: RecordFault,
}

/// Result of normalizing a whole snapshot.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<EntityAttributeRecord>,
    /// Snapshot position of each entry in `records`
    pub indices: Vec<usize>,
    pub skipped: Vec<SkippedRecord>,
}

/// Schema-driven record normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    schema: &'a DimensionSchema,
    ingested_at: OffsetDateTime,
}

impl<'a> Normalizer<'a> {
    pub fn new(schema: &'a DimensionSchema, ingested_at: OffsetDateTime) -> Self {
        Self {
            schema,
            ingested_at,
        }
    }

    /// Normalize a single raw record.
    pub fn normalize(&self, raw: &RawRecord) -> Result<EntityAttributeRecord, RecordFault> {
        let (business_key, identity) = self.business_key(raw)?;

        let as_of = parse_as_of(raw.get(&self.schema.as_of_field))
            .map_err(|problem| {
                RecordFault::new(&self.schema.as_of_field, problem).with_key(&business_key)
            })?;

        let mut tracked = Vec::with_capacity(self.schema.tracked.len());
        for attr in &self.schema.tracked {
            let raw_value = raw.get(attr.source_field()).unwrap_or(&NULL_VALUE);
            let value = match attr.ty {
                AttrType::Integer => coerce_integer(raw_value),
                AttrType::Float => coerce_float(raw_value),
            }
            .map_err(|problem| {
                RecordFault::new(attr.source_field(), problem).with_key(&business_key)
            })?;
            tracked.push(Attribute::new(&attr.name, value));
        }

        let derived = self
            .schema
            .derived
            .iter()
            .map(|attr| Attribute::new(&attr.name, self.derive(&attr.rule, &tracked)))
            .collect();

        Ok(EntityAttributeRecord {
            business_key,
            identity,
            tracked,
            derived,
            as_of,
            ingested_at: self.ingested_at,
        })
    }

    /// Normalize a whole snapshot under the given malformed-record policy.
    pub fn normalize_batch(
        &self,
        raws: &[RawRecord],
        policy: MalformedPolicy,
    ) -> Result<NormalizedBatch, ReconcileError> {
        let mut batch = NormalizedBatch {
            records: Vec::with_capacity(raws.len()),
            indices: Vec::with_capacity(raws.len()),
            skipped: Vec::new(),
        };

        for (index, raw) in raws.iter().enumerate() {
            match self.normalize(raw) {
                Ok(record) => {
                    batch.records.push(record);
                    batch.indices.push(index);
                }
                Err(fault) => match policy {
                    MalformedPolicy::FailFast => {
                        return Err(ReconcileError::MalformedRecord { index, fault });
                    }
                    MalformedPolicy::Skip => {
                        warn!(index, field = %fault.field, problem = %fault.problem, "Skipping malformed record");
                        batch.skipped.push(SkippedRecord { index, fault });
                    }
                },
            }
        }

        debug!(
            normalized = batch.records.len(),
            skipped = batch.skipped.len(),
            "Normalized snapshot"
        );
        Ok(batch)
    }

    fn business_key(
        &self,
        raw: &RawRecord,
    ) -> Result<(BusinessKey, BTreeMap<String, String>), RecordFault> {
        let separator = self.schema.key_separator.as_str();
        let composite = self.schema.key_fields.len() > 1;
        let mut parts = Vec::with_capacity(self.schema.key_fields.len());
        let mut identity = BTreeMap::new();
        for field in &self.schema.key_fields {
            let part = key_part(raw.get(&field.source))
                .map_err(|problem| RecordFault::new(&field.source, problem))?;
            parts.push(if composite {
                escape_key_part(&part, separator)
            } else {
                part.clone()
            });
            identity.insert(field.column().to_string(), part);
        }
        let key = BusinessKey(parts.join(separator));
        Ok((key, identity))
    }

    fn derive(&self, rule: &DerivedRule, tracked: &[Attribute]) -> AttrValue {
        let value_of = |name: &str| {
            self.schema
                .tracked_index(name)
                .map(|index| tracked[index].value)
                .unwrap_or(AttrValue::Null)
        };

        match rule {
            DerivedRule::Ratio {
                numerator,
                denominator,
                scale,
            } => {
                let denominator = value_of(denominator.as_str()).as_f64().unwrap_or(0.0);
                if denominator <= 0.0 {
                    return AttrValue::Float(0.0);
                }
                match value_of(numerator.as_str()).as_f64() {
                    Some(numerator) => AttrValue::Float(numerator * scale / denominator),
                    None => AttrValue::Null,
                }
            }
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string {:?}", s),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
    }
}

fn key_part(value: Option<&Value>) -> Result<String, String> {
    match value {
        None | Some(Value::Null) => Err("required identifying field is missing".to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err("required identifying field is empty".to_string())
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(format!(
            "identifying field must be a string, found {}",
            describe(other)
        )),
    }
}

/// Prefix every escape or separator character in `part` with [`KEY_ESCAPE`].
fn escape_key_part(part: &str, separator: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        if ch == KEY_ESCAPE || separator.contains(ch) {
            escaped.push(KEY_ESCAPE);
        }
        escaped.push(ch);
    }
    escaped
}

fn parse_as_of(value: Option<&Value>) -> Result<Date, String> {
    let format = format_description!("[year]-[month]-[day]");
    match value {
        None | Some(Value::Null) => Err("as-of date is missing".to_string()),
        Some(Value::String(s)) => Date::parse(s.trim(), &format)
            .map_err(|err| format!("expected a YYYY-MM-DD date, found {:?} ({})", s, err)),
        Some(other) => Err(format!(
            "expected a YYYY-MM-DD date, found {}",
            describe(other)
        )),
    }
}

fn coerce_integer(value: &Value) -> Result<AttrValue, String> {
    match value {
        Value::Null => Ok(AttrValue::Null),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                return Ok(AttrValue::Int(int));
            }
            match n.as_f64() {
                Some(float)
                    if float.fract() == 0.0
                        && float >= i64::MIN as f64
                        && float < i64::MAX as f64 =>
                {
                    Ok(AttrValue::Int(float as i64))
                }
                _ => Err(format!("expected an integer, found {}", describe(value))),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(AttrValue::Int)
            .map_err(|_| format!("expected an integer, found {}", describe(value))),
        other => Err(format!("expected an integer, found {}", describe(other))),
    }
}

fn coerce_float(value: &Value) -> Result<AttrValue, String> {
    let parsed = match value {
        Value::Null => return Ok(AttrValue::Null),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        // -0.0 compares equal to 0.0 and must fingerprint the same
        Some(float) if float == 0.0 => Ok(AttrValue::Float(0.0)),
        Some(float) if float.is_finite() => Ok(AttrValue::Float(float)),
        _ => Err(format!("expected a number, found {}", describe(value))),
    }
}
