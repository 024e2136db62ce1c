//! Hard filters over stored payloads.
//!
//! A [`Predicate`] is generic over its operand type so the same shape serves
//! query templates (operands may be unbound params) and resolved searches
//! (operands are concrete JSON values).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Exact / range predicate over non-embedded fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate<V = Value> {
    /// Field equals value (numbers compare numerically).
    Eq {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field differs from value; absent fields match.
    Ne {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field > value.
    Gt {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field >= value.
    Ge {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field < value.
    Lt {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field <= value.
    Le {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// Field equals one of the values.
    In {
        /// Payload field.
        field: String,
        /// Operands.
        values: Vec<V>,
    },
    /// String field contains the substring, or array field contains the element.
    Contains {
        /// Payload field.
        field: String,
        /// Operand.
        value: V,
    },
    /// All sub-predicates hold.
    And {
        /// Sub-predicates.
        all: Vec<Predicate<V>>,
    },
    /// At least one sub-predicate holds.
    Or {
        /// Sub-predicates.
        any: Vec<Predicate<V>>,
    },
    /// The sub-predicate does not hold.
    Not {
        /// Sub-predicate.
        not: Box<Predicate<V>>,
    },
}

impl<V> Predicate<V> {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Eq { field: field.into(), value: value.into() }
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Ne { field: field.into(), value: value.into() }
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Gt { field: field.into(), value: value.into() }
    }

    /// `field >= value`.
    pub fn ge(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Ge { field: field.into(), value: value.into() }
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Lt { field: field.into(), value: value.into() }
    }

    /// `field <= value`.
    pub fn le(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Le { field: field.into(), value: value.into() }
    }

    /// `field ∈ values`.
    pub fn is_in<I, T>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<V>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `value ⊂ field`.
    pub fn contains(field: impl Into<String>, value: impl Into<V>) -> Self {
        Self::Contains { field: field.into(), value: value.into() }
    }

    /// Conjunction.
    #[must_use]
    pub fn and(all: Vec<Self>) -> Self {
        Self::And { all }
    }

    /// Disjunction.
    #[must_use]
    pub fn or(any: Vec<Self>) -> Self {
        Self::Or { any }
    }

    /// Negation.
    #[must_use]
    pub fn not(inner: Self) -> Self {
        Self::Not { not: Box::new(inner) }
    }

    /// Every payload field the predicate reads.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Eq { field, .. }
            | Self::Ne { field, .. }
            | Self::Gt { field, .. }
            | Self::Ge { field, .. }
            | Self::Lt { field, .. }
            | Self::Le { field, .. }
            | Self::In { field, .. }
            | Self::Contains { field, .. } => out.push(field),
            Self::And { all: ps } | Self::Or { any: ps } => {
                ps.iter().for_each(|p| p.collect_fields(out));
            }
            Self::Not { not } => not.collect_fields(out),
        }
    }

    /// Every operand, depth first.
    pub fn operands(&self) -> Vec<(&str, &V)> {
        let mut out = Vec::new();
        self.collect_operands(&mut out);
        out
    }

    fn collect_operands<'a>(&'a self, out: &mut Vec<(&'a str, &'a V)>) {
        match self {
            Self::Eq { field, value }
            | Self::Ne { field, value }
            | Self::Gt { field, value }
            | Self::Ge { field, value }
            | Self::Lt { field, value }
            | Self::Le { field, value }
            | Self::Contains { field, value } => out.push((field.as_str(), value)),
            Self::In { field, values } => out.extend(values.iter().map(|v| (field.as_str(), v))),
            Self::And { all: ps } | Self::Or { any: ps } => {
                ps.iter().for_each(|p| p.collect_operands(out));
            }
            Self::Not { not } => not.collect_operands(out),
        }
    }

    /// Map every operand, keeping the predicate shape.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map<W, E, F>(&self, f: &mut F) -> Result<Predicate<W>, E>
    where
        F: FnMut(&str, &V) -> Result<W, E>,
    {
        Ok(match self {
            Self::Eq { field, value } => Predicate::Eq { field: field.clone(), value: f(field, value)? },
            Self::Ne { field, value } => Predicate::Ne { field: field.clone(), value: f(field, value)? },
            Self::Gt { field, value } => Predicate::Gt { field: field.clone(), value: f(field, value)? },
            Self::Ge { field, value } => Predicate::Ge { field: field.clone(), value: f(field, value)? },
            Self::Lt { field, value } => Predicate::Lt { field: field.clone(), value: f(field, value)? },
            Self::Le { field, value } => Predicate::Le { field: field.clone(), value: f(field, value)? },
            Self::Contains { field, value } => {
                Predicate::Contains { field: field.clone(), value: f(field, value)? }
            }
            Self::In { field, values } => Predicate::In {
                field: field.clone(),
                values: values.iter().map(|v| f(field, v)).collect::<Result<_, _>>()?,
            },
            Self::And { all } => Predicate::And {
                all: all.iter().map(|p| p.try_map(f)).collect::<Result<_, _>>()?,
            },
            Self::Or { any } => Predicate::Or {
                any: any.iter().map(|p| p.try_map(f)).collect::<Result<_, _>>()?,
            },
            Self::Not { not } => Predicate::Not { not: Box::new(not.try_map(f)?) },
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Predicate<Value> {
    /// Evaluate against a payload. Absent or null fields fail every test
    /// except `Ne` and `Not`.
    #[must_use]
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};

        let get = |field: &str| payload.get(field).filter(|v| !v.is_null());
        let cmp = |field: &str, value: &Value| get(field).and_then(|v| compare(v, value));

        match self {
            Self::Eq { field, value } => get(field).is_some_and(|v| values_equal(v, value)),
            Self::Ne { field, value } => !get(field).is_some_and(|v| values_equal(v, value)),
            Self::Gt { field, value } => cmp(field, value) == Some(Greater),
            Self::Ge { field, value } => matches!(cmp(field, value), Some(Greater | Equal)),
            Self::Lt { field, value } => cmp(field, value) == Some(Less),
            Self::Le { field, value } => matches!(cmp(field, value), Some(Less | Equal)),
            Self::In { field, values } => {
                get(field).is_some_and(|v| values.iter().any(|x| values_equal(v, x)))
            }
            Self::Contains { field, value } => match (get(field), value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
            Self::And { all } => all.iter().all(|p| p.matches(payload)),
            Self::Or { any } => any.iter().any(|p| p.matches(payload)),
            Self::Not { not } => !not.matches(payload),
        }
    }
}
