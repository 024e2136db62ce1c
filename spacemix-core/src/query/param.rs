//! Query parameters: placeholders, bindable slots and caller-supplied values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParamError;
use crate::schema::{parse_timestamp, FieldType};
use crate::space::{Space, SpaceKind};

/// A named placeholder resolved when the query runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Unique name within the query.
    pub name: String,
    /// Human-readable description, forwarded to natural-language extraction.
    #[serde(default)]
    pub description: Option<String>,
    /// Value used when nothing else binds the param. `Null` on a `similar`
    /// clause means "skip the clause".
    #[serde(default)]
    pub default: Option<Value>,
    /// Inclusive numeric range.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
}

impl Param {
    /// Param without description, default or range.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            default: None,
            range: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restrict numeric values to `[min, max]`.
    #[must_use]
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }
}

/// Either a value fixed in the template or a [`Param`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bindable<T> {
    /// Value fixed at declaration.
    Fixed(T),
    /// Value supplied at execution.
    Param(Param),
}

impl<T> Bindable<T> {
    /// The param, if this slot is one.
    #[must_use]
    pub fn as_param(&self) -> Option<&Param> {
        match self {
            Self::Fixed(_) => None,
            Self::Param(p) => Some(p),
        }
    }
}

impl From<f64> for Bindable<f64> {
    fn from(v: f64) -> Self {
        Self::Fixed(v)
    }
}

impl From<Param> for Bindable<f64> {
    fn from(p: Param) -> Self {
        Self::Param(p)
    }
}

impl From<&str> for Bindable<String> {
    fn from(v: &str) -> Self {
        Self::Fixed(v.to_string())
    }
}

impl From<String> for Bindable<String> {
    fn from(v: String) -> Self {
        Self::Fixed(v)
    }
}

impl From<Param> for Bindable<String> {
    fn from(p: Param) -> Self {
        Self::Param(p)
    }
}

impl From<Value> for Bindable<Value> {
    fn from(v: Value) -> Self {
        Self::Fixed(v)
    }
}

impl From<&str> for Bindable<Value> {
    fn from(v: &str) -> Self {
        Self::Fixed(Value::from(v))
    }
}

impl From<String> for Bindable<Value> {
    fn from(v: String) -> Self {
        Self::Fixed(Value::from(v))
    }
}

impl From<f64> for Bindable<Value> {
    fn from(v: f64) -> Self {
        Self::Fixed(Value::from(v))
    }
}

impl From<i64> for Bindable<Value> {
    fn from(v: i64) -> Self {
        Self::Fixed(Value::from(v))
    }
}

impl From<bool> for Bindable<Value> {
    fn from(v: bool) -> Self {
        Self::Fixed(Value::from(v))
    }
}

impl From<Param> for Bindable<Value> {
    fn from(p: Param) -> Self {
        Self::Param(p)
    }
}

/// Expected value type of a param, inferred from where it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Floating-point number.
    Float,
    /// Whole number.
    Integer,
    /// Text.
    String,
    /// RFC 3339 string or unix seconds.
    Timestamp,
    /// One label or a list of labels.
    Categories,
    /// Any JSON value.
    Any,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::Categories => "categories",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

impl ParamType {
    /// Input type of a `similar` clause on `space`.
    #[must_use]
    pub fn for_space(space: &Space) -> Self {
        match space.kind() {
            SpaceKind::Text | SpaceKind::Image => Self::String,
            SpaceKind::Number { .. } => Self::Float,
            SpaceKind::Recency { .. } => Self::Timestamp,
            SpaceKind::Categorical { .. } => Self::Categories,
            SpaceKind::Custom { .. } => Self::Any,
        }
    }

    /// Operand type of a filter on a field of `field_type`.
    #[must_use]
    pub fn for_field(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Id | FieldType::String | FieldType::Blob => Self::String,
            FieldType::Integer => Self::Integer,
            FieldType::Float => Self::Float,
            FieldType::Timestamp => Self::Timestamp,
            FieldType::Categorical => Self::Categories,
        }
    }

    /// Check `value` against this type, converting lenient forms (numeric
    /// strings, integral floats). `Null` passes through.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::InvalidType`] for values of another type.
    pub fn coerce(self, param: &str, value: Value) -> Result<Value, ParamError> {
        let invalid = |v: &Value| ParamError::InvalidType {
            param: param.to_string(),
            expected: self.to_string(),
            actual: json_kind(v).to_string(),
        };
        if value.is_null() {
            return Ok(value);
        }
        match self {
            Self::Any => Ok(value),
            Self::Float => {
                if value.is_number() {
                    return Ok(value);
                }
                value
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .filter(|f| f.is_finite())
                    .map(Value::from)
                    .ok_or_else(|| invalid(&value))
            }
            Self::Integer => {
                let as_int = match &value {
                    Value::Number(n) => n
                        .as_i64()
                        .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                as_int.map(Value::from).ok_or_else(|| invalid(&value))
            }
            Self::String => match value {
                Value::String(_) => Ok(value),
                other => Err(invalid(&other)),
            },
            Self::Timestamp => {
                if parse_timestamp(&value).is_some() {
                    Ok(value)
                } else {
                    Err(invalid(&value))
                }
            }
            Self::Categories => {
                let labels = value.is_string()
                    || value.as_array().is_some_and(|a| a.iter().all(Value::is_string));
                if labels {
                    Ok(value)
                } else {
                    Err(invalid(&value))
                }
            }
        }
    }
}

/// Short JSON type name for error messages.
pub(crate) fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check a numeric value against a param's declared range.
pub(crate) fn check_range(param: &Param, value: &Value) -> Result<(), ParamError> {
    let (Some((min, max)), Some(v)) = (param.range, value.as_f64()) else {
        return Ok(());
    };
    if v < min || v > max {
        return Err(ParamError::OutOfRange {
            param: param.name.clone(),
            value: v,
            min,
            max,
        });
    }
    Ok(())
}

/// Caller-supplied param values, by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams(BTreeMap<String, Value>);

impl QueryParams {
    /// No values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Names with values.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<Map<String, Value>> for QueryParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn float_coercion() {
        let t = ParamType::Float;
        assert_eq!(t.coerce("w", json!(0.5)).expect("ok"), json!(0.5));
        assert_eq!(t.coerce("w", json!("2.5")).expect("ok"), json!(2.5));
        assert_eq!(t.coerce("w", Value::Null).expect("ok"), Value::Null);
        assert!(matches!(t.coerce("w", json!("lots")), Err(ParamError::InvalidType { .. })));
        assert!(t.coerce("w", json!(true)).is_err());
    }

    #[test]
    fn integer_coercion() {
        let t = ParamType::Integer;
        assert_eq!(t.coerce("n", json!(3.0)).expect("ok"), json!(3));
        assert_eq!(t.coerce("n", json!("7")).expect("ok"), json!(7));
        assert!(t.coerce("n", json!(2.5)).is_err());
    }

    #[test]
    fn structured_types() {
        assert!(ParamType::Timestamp.coerce("t", json!("2024-01-01T00:00:00Z")).is_ok());
        assert!(ParamType::Timestamp.coerce("t", json!(1_700_000_000)).is_ok());
        assert!(ParamType::Timestamp.coerce("t", json!("yesterday")).is_err());
        assert!(ParamType::Categories.coerce("c", json!(["a", "b"])).is_ok());
        assert!(ParamType::Categories.coerce("c", json!([1])).is_err());
        assert!(ParamType::String.coerce("s", json!(5)).is_err());
        assert!(ParamType::Any.coerce("a", json!({"x": 1})).is_ok());
    }

    #[test]
    fn range_check() {
        let p = Param::new("w").range(0.0, 1.0);
        assert!(check_range(&p, &json!(0.5)).is_ok());
        assert!(matches!(check_range(&p, &json!(1.5)), Err(ParamError::OutOfRange { .. })));
        assert!(check_range(&Param::new("free"), &json!(99)).is_ok());
    }

    #[test]
    fn query_params_builder() {
        let params = QueryParams::new().with("w", 0.3).with("q", "shoes");
        assert_eq!(params.get("w"), Some(&json!(0.3)));
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["q", "w"]);
    }
}
