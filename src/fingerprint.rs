//! # Fingerprinting
//!
//! Content digests over the tracked attribute set of an entity. Two records with
//! identical tracked values in the same order always share a fingerprint; derived
//! attributes and the business key never contribute.
//!
//! ## Canonical encoding
//!
//! ```text
//! SHA-256( v1 "|" v2 "|" ... "|" vn )
//! ```
//!
//! Integers render as decimal text, floats as their shortest round-trip decimal
//! text, and absent values as `\N`, which no numeric value renders as.

use crate::model::{AttrValue, EntityAttributeRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;

/// Placeholder written for absent tracked values.
pub const NULL_PLACEHOLDER: &str = "\\N";

/// Separator between encoded tracked values.
pub const FIELD_DELIMITER: char = '|';

/// SHA-256 digest of a tracked attribute tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Render tracked values into the delimiter-joined text that gets hashed.
pub fn canonical_text<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a AttrValue>,
{
    let mut text = String::new();
    for (index, value) in values.into_iter().enumerate() {
        if index > 0 {
            text.push(FIELD_DELIMITER);
        }
        match value {
            AttrValue::Int(value) => {
                let _ = write!(text, "{}", value);
            }
            AttrValue::Float(value) => {
                // 0.0 and -0.0 are the same value
                let value = if *value == 0.0 { 0.0 } else { *value };
                let _ = write!(text, "{}", value);
            }
            AttrValue::Null => text.push_str(NULL_PLACEHOLDER),
        }
    }
    text
}

/// Fingerprint an ordered sequence of tracked values.
pub fn fingerprint<'a, I>(values: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a AttrValue>,
{
    let digest = Sha256::digest(canonical_text(values).as_bytes());
    Fingerprint(digest.into())
}

/// Fingerprint the tracked attributes of a normalized record.
pub fn fingerprint_record(record: &EntityAttributeRecord) -> Fingerprint {
    fingerprint(record.tracked_values())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_text() {
        let values = [AttrValue::Int(1500), AttrValue::Null, AttrValue::Float(52.5)];
        assert_eq!(canonical_text(&values), "1500|\\N|52.5");
        assert_eq!(canonical_text(&[] as &[AttrValue]), "");
    }

    #[test]
    fn test_known_digest() {
        // sha256("1500|1600")
        let values = [AttrValue::Int(1500), AttrValue::Int(1600)];
        let expected = Sha256::digest(b"1500|1600");
        assert_eq!(fingerprint(&values).as_bytes()[..], expected[..]);
    }

    #[test]
    fn test_null_and_zero_do_not_collide() {
        let zero = fingerprint(&[AttrValue::Int(0), AttrValue::Int(1)]);
        let null = fingerprint(&[AttrValue::Null, AttrValue::Int(1)]);
        assert_ne!(zero, null);
    }

    #[test]
    fn test_float_rendering() {
        assert_eq!(canonical_text(&[AttrValue::Float(-0.0)]), "0");
        assert_eq!(
            fingerprint(&[AttrValue::Float(-0.0)]),
            fingerprint(&[AttrValue::Float(0.0)])
        );
        assert_eq!(canonical_text(&[AttrValue::Float(0.1)]), "0.1");
        assert_ne!(
            fingerprint(&[AttrValue::Float(0.1)]),
            fingerprint(&[AttrValue::Float(0.1 + 1e-12)])
        );
    }

    #[test]
    fn test_order_sensitive() {
        let forward = fingerprint(&[AttrValue::Int(1), AttrValue::Int(2)]);
        let reversed = fingerprint(&[AttrValue::Int(2), AttrValue::Int(1)]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_hex_display() {
        let digest = fingerprint(&[AttrValue::Int(1)]);
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest.to_string(), hex);
    }
}
