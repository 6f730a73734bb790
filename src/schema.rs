//! # Dimension Schema
//!
//! Declarative description of how raw snapshot records map onto a dimension:
//! which fields build the business key, which attributes are tracked for change
//! detection (and in which order), which attributes are derived, and where the
//! snapshot's logical date lives.
//!
//! Schemas are plain serde structures so they can be loaded from a JSON file,
//! e.g.
//!
//! ```json
//! {
//!   "name": "dim_player_rating",
//!   "key_fields": [{ "source": "username", "alias": "player_username" }, { "source": "platform" }],
//!   "as_of_field": "data_date",
//!   "tracked": [{ "name": "rating_blitz", "type": "integer" }],
//!   "derived": [{ "name": "win_rate", "rule": "ratio", "numerator": "wins",
//!                 "denominator": "games_played", "scale": 100.0 }]
//! }
//! ```

use crate::config::defaults::{DEFAULT_DIMENSION_NAME, DEFAULT_KEY_SEPARATOR};
use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An identifying field contributing to the business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    /// Field name in the raw record
    pub source: String,
    /// Column name on dimension rows (defaults to `source`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl KeyField {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            alias: None,
        }
    }

    pub fn aliased(source: &str, alias: &str) -> Self {
        Self {
            source: source.to_string(),
            alias: Some(alias.to_string()),
        }
    }

    pub fn column(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.source)
    }
}

/// Declared numeric type of a tracked attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    Integer,
    Float,
}

/// A tracked attribute. Changes to any tracked value produce a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAttribute {
    /// Column name on dimension rows
    pub name: String,
    /// Field name in the raw record (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub ty: AttrType,
}

impl TrackedAttribute {
    pub fn integer(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            ty: AttrType::Integer,
        }
    }

    pub fn float(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            ty: AttrType::Float,
        }
    }

    pub fn source_field(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Rule computing a derived attribute from tracked attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DerivedRule {
    /// `numerator * scale / denominator`; `0.0` unless the denominator is positive,
    /// absent if the numerator is absent.
    Ratio {
        numerator: String,
        denominator: String,
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

fn default_scale() -> f64 {
    1.0
}

/// An attribute computed from tracked attributes. Never fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAttribute {
    pub name: String,
    #[serde(flatten)]
    pub rule: DerivedRule,
}

/// Escapes the escape character itself and any separator character occurring
/// inside a key part, so distinct identities never join to the same key.
pub const KEY_ESCAPE: char = '\\';

fn default_key_separator() -> String {
    DEFAULT_KEY_SEPARATOR.to_string()
}

/// Full mapping from raw records to dimension rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSchema {
    pub name: String,
    pub key_fields: Vec<KeyField>,
    #[serde(default = "default_key_separator")]
    pub key_separator: String,
    pub as_of_field: String,
    pub tracked: Vec<TrackedAttribute>,
    #[serde(default)]
    pub derived: Vec<DerivedAttribute>,
}

impl DimensionSchema {
    /// Player ratings from chess.com and lichess snapshots.
    pub fn player_rating() -> Self {
        Self {
            name: DEFAULT_DIMENSION_NAME.to_string(),
            key_fields: vec![
                KeyField::aliased("username", "player_username"),
                KeyField::new("platform"),
            ],
            key_separator: default_key_separator(),
            as_of_field: "data_date".to_string(),
            tracked: [
                "rating_blitz",
                "rating_rapid",
                "rating_bullet",
                "rating_classical",
                "games_played",
                "wins",
                "losses",
                "draws",
            ]
            .into_iter()
            .map(TrackedAttribute::integer)
            .collect(),
            derived: vec![DerivedAttribute {
                name: "win_rate".to_string(),
                rule: DerivedRule::Ratio {
                    numerator: "wins".to_string(),
                    denominator: "games_played".to_string(),
                    scale: 100.0,
                },
            }],
        }
    }

    /// Parse and validate a schema from JSON text.
    pub fn from_json(raw: &str) -> Result<Self, ReconcileError> {
        let schema: DimensionSchema = serde_json::from_str(raw)
            .map_err(|err| ReconcileError::InvalidSchema(err.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check that the schema can drive normalization.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |message: String| Err(ReconcileError::InvalidSchema(message));

        if self.key_fields.is_empty() {
            return invalid(format!("schema `{}` declares no key fields", self.name));
        }
        if self.tracked.is_empty() {
            return invalid(format!("schema `{}` declares no tracked attributes", self.name));
        }
        if self.key_fields.len() > 1 {
            if self.key_separator.is_empty() {
                return invalid(format!(
                    "schema `{}` joins {} key fields with an empty separator",
                    self.name,
                    self.key_fields.len()
                ));
            }
            if self.key_separator.contains(KEY_ESCAPE) {
                return invalid(format!(
                    "schema `{}` key separator {:?} contains the escape character",
                    self.name, self.key_separator
                ));
            }
        }
        if self.as_of_field.is_empty() {
            return invalid(format!("schema `{}` has an empty as-of field", self.name));
        }

        let mut columns = HashSet::new();
        let names = self
            .key_fields
            .iter()
            .map(KeyField::column)
            .chain(self.tracked.iter().map(|attr| attr.name.as_str()))
            .chain(self.derived.iter().map(|attr| attr.name.as_str()));
        for name in names {
            if !columns.insert(name) {
                return invalid(format!("column `{}` is declared more than once", name));
            }
        }

        for derived in &self.derived {
            match &derived.rule {
                DerivedRule::Ratio {
                    numerator,
                    denominator,
                    scale,
                } => {
                    for input in [numerator, denominator] {
                        if self.tracked_index(input).is_none() {
                            return invalid(format!(
                                "derived attribute `{}` reads `{}`, which is not tracked",
                                derived.name, input
                            ));
                        }
                    }
                    if !scale.is_finite() {
                        return invalid(format!(
                            "derived attribute `{}` has a non-finite scale",
                            derived.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Position of a tracked attribute in fingerprint order
    pub fn tracked_index(&self, name: &str) -> Option<usize> {
        self.tracked.iter().position(|attr| attr.name == name)
    }
}

impl Default for DimensionSchema {
    fn default() -> Self {
        Self::player_rating()
    }
}
