//! Core type definitions shared across spacemix.
//!
//! All types are serializable so they can cross the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Identifier of a record, unique within an index.
///
/// The id is the value of the schema's identifier field, so it is supplied by
/// the application rather than generated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Create a record id from anything string-like.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A typed field value after schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Free text.
    Str(String),
    /// Whole number.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// One or more category labels.
    Categories(Vec<String>),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// Image reference (path, URL or inline payload).
    Blob(String),
}

impl FieldValue {
    /// Short name of the value kind, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Categories(_) => "categories",
            Self::Timestamp(_) => "timestamp",
            Self::Blob(_) => "blob",
        }
    }

    /// Whether the value is [`FieldValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value (integers widen, timestamps become unix seconds).
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Timestamp(t) => Some(t.timestamp() as f64),
            _ => None,
        }
    }

    /// Payload representation used by the store and by filters.
    ///
    /// Timestamps become unix seconds so range predicates compare numerically.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Str(s) | Self::Blob(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Categories(c) => Value::Array(c.iter().cloned().map(Value::String).collect()),
            Self::Timestamp(t) => Value::from(t.timestamp()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

// ---------------------------------------------------------------------------
// Space mode
// ---------------------------------------------------------------------------

/// How an ordered (numeric / recency) space compares values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpaceMode {
    /// Closer values score higher.
    #[default]
    Similarity,
    /// Smaller values score higher.
    Minimize,
    /// Larger values score higher.
    Maximize,
}

impl fmt::Display for SpaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Similarity => write!(f, "similarity"),
            Self::Minimize => write!(f, "minimize"),
            Self::Maximize => write!(f, "maximize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_display_and_ordering() {
        let a = RecordId::from("a");
        let b = RecordId::new("b");
        assert!(a < b);
        assert_eq!(b.to_string(), "b");
    }

    #[test]
    fn timestamp_payload_is_unix_seconds() {
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        assert_eq!(FieldValue::Timestamp(t).to_json(), serde_json::json!(1_700_000_000));
    }

    #[test]
    fn categories_payload_is_array() {
        let v = FieldValue::Categories(vec!["red".into(), "blue".into()]);
        assert_eq!(v.to_json(), serde_json::json!(["red", "blue"]));
    }

    #[test]
    fn non_finite_float_payload_is_null() {
        assert!(FieldValue::Float(f64::NAN).to_json().is_null());
    }
}
