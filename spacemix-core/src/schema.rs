//! Typed record declarations.
//!
//! A [`Schema`] names a record type and its fields. Exactly one field is the
//! identifier. Records arrive as JSON objects and are validated into a
//! [`ParsedRecord`] before any space sees them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::types::{FieldValue, RecordId};

/// Payload key holding the schema name of a stored record.
pub const SCHEMA_KEY: &str = "__schema";

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Record identifier (string or integer in the input).
    Id,
    /// Free text.
    String,
    /// Whole number.
    Integer,
    /// Floating-point number (integers are accepted and widened).
    Float,
    /// One label or a list of labels.
    Categorical,
    /// Unix seconds or RFC 3339 string.
    Timestamp,
    /// Image reference.
    Blob,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Id => "id",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Categorical => "categorical",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
        };
        f.write_str(s)
    }
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
}

/// Typed reference to a field of a particular schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Owning schema.
    pub schema: String,
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A named, typed record declaration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    name: String,
    id_field: String,
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Start declaring a schema.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Schema name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the identifier field.
    #[must_use]
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// All declared fields, identifier included, in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field by name.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownField`] if the schema has no such field.
    pub fn field(&self, name: &str) -> Result<FieldRef, SchemaError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| FieldRef {
                schema: self.name.clone(),
                name: f.name.clone(),
                field_type: f.field_type,
            })
            .ok_or_else(|| SchemaError::UnknownField {
                schema: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Validate a JSON object against this schema.
    ///
    /// # Errors
    ///
    /// Rejects non-objects, unknown fields, a missing or empty identifier and
    /// values whose type does not match the declaration.
    pub fn parse(&self, input: &Value) -> Result<ParsedRecord, SchemaError> {
        let Some(obj) = input.as_object() else {
            return Err(SchemaError::NotAnObject {
                schema: self.name.clone(),
            });
        };

        if let Some(unknown) = obj.keys().find(|k| !self.fields.iter().any(|f| &f.name == *k)) {
            return Err(SchemaError::UnknownField {
                schema: self.name.clone(),
                field: unknown.clone(),
            });
        }

        let id = self.record_id(input)?;

        let mut values = BTreeMap::new();
        for def in self.fields.iter().filter(|f| f.field_type != FieldType::Id) {
            let value = match obj.get(&def.name) {
                None | Some(Value::Null) => FieldValue::Null,
                Some(raw) => coerce(def, raw)?,
            };
            values.insert(def.name.clone(), value);
        }

        Ok(ParsedRecord {
            schema: self.name.clone(),
            id,
            values,
        })
    }

    /// Identifier of a raw record, without validating its other fields.
    ///
    /// # Errors
    ///
    /// Rejects non-objects and a missing, empty or non-scalar identifier.
    pub fn record_id(&self, input: &Value) -> Result<RecordId, SchemaError> {
        let Some(obj) = input.as_object() else {
            return Err(SchemaError::NotAnObject {
                schema: self.name.clone(),
            });
        };
        match obj.get(&self.id_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(RecordId(s.clone())),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(RecordId(n.to_string())),
            Some(Value::Null | Value::String(_)) | None => Err(SchemaError::MissingId {
                schema: self.name.clone(),
            }),
            Some(other) => Err(SchemaError::TypeMismatch {
                field: self.id_field.clone(),
                expected: FieldType::Id.to_string(),
                actual: json_kind(other).to_string(),
            }),
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce(def: &FieldDef, raw: &Value) -> Result<FieldValue, SchemaError> {
    let mismatch = || SchemaError::TypeMismatch {
        field: def.name.clone(),
        expected: def.field_type.to_string(),
        actual: json_kind(raw).to_string(),
    };

    match def.field_type {
        FieldType::String => raw.as_str().map(|s| FieldValue::Str(s.to_string())).ok_or_else(mismatch),
        FieldType::Blob => raw.as_str().map(|s| FieldValue::Blob(s.to_string())).ok_or_else(mismatch),
        FieldType::Integer => raw.as_i64().map(FieldValue::Int).ok_or_else(mismatch),
        FieldType::Float => raw
            .as_f64()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float)
            .ok_or_else(mismatch),
        FieldType::Categorical => match raw {
            Value::String(s) => Ok(FieldValue::Categories(vec![s.clone()])),
            Value::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(FieldValue::Categories)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        FieldType::Timestamp => parse_timestamp(raw).map(FieldValue::Timestamp).ok_or_else(mismatch),
        FieldType::Id => Err(mismatch()),
    }
}

/// Parse unix seconds (integer or float) or an RFC 3339 string.
#[must_use]
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                let f = n.as_f64()?;
                if !f.is_finite() {
                    return None;
                }
                let secs = f.floor();
                let nanos = ((f - secs) * 1e9) as u32;
                DateTime::from_timestamp(secs as i64, nanos)
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Incremental [`Schema`] declaration.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    /// Declare the identifier field.
    #[must_use]
    pub fn id(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Id)
    }

    /// Declare a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
        });
        self
    }

    /// Finish the declaration.
    ///
    /// # Errors
    ///
    /// Fails on duplicate field names, a second identifier, no identifier, or
    /// a field that shadows the reserved schema payload key.
    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut seen = HashSet::new();
        let mut id_field: Option<String> = None;

        for def in &self.fields {
            if !seen.insert(def.name.as_str()) || def.name == SCHEMA_KEY {
                return Err(SchemaError::DuplicateField {
                    schema: self.name.clone(),
                    field: def.name.clone(),
                });
            }
            if def.field_type == FieldType::Id {
                if id_field.is_some() {
                    return Err(SchemaError::DuplicateIdField {
                        schema: self.name.clone(),
                        field: def.name.clone(),
                    });
                }
                id_field = Some(def.name.clone());
            }
        }

        let id_field = id_field.ok_or_else(|| SchemaError::MissingIdField {
            schema: self.name.clone(),
        })?;

        Ok(Schema {
            name: self.name,
            id_field,
            fields: self.fields,
        })
    }
}

/// A record that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Schema the record belongs to.
    pub schema: String,
    /// Record identifier.
    pub id: RecordId,
    /// Non-identifier field values; absent fields are [`FieldValue::Null`].
    pub values: BTreeMap<String, FieldValue>,
}

impl ParsedRecord {
    /// Value of a field, [`FieldValue::Null`] when absent.
    #[must_use]
    pub fn value(&self, field: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.values.get(field).unwrap_or(&NULL)
    }

    /// Store payload: every non-blob field plus the reserved schema key.
    #[must_use]
    pub fn payload(&self, id_field: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(SCHEMA_KEY.to_string(), Value::String(self.schema.clone()));
        map.insert(id_field.to_string(), Value::String(self.id.0.clone()));
        for (name, value) in &self.values {
            if !matches!(value, FieldValue::Blob(_)) {
                map.insert(name.clone(), value.to_json());
            }
        }
        map
    }
}
