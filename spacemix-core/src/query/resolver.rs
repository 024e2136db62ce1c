//! Parameter binding and query-vector construction.
//!
//! Each param is bound by the first source that has a value:
//!
//! 1. the caller's [`QueryParams`];
//! 2. a [`ParamExtractor`] reading the natural-language query;
//! 3. the param's declared default.
//!
//! Anything still unbound is a [`ParamError::Unresolved`]. Resolution never
//! touches the store or any record lock.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::param::{check_range, json_kind, Bindable, QueryParams};
use super::result::SpaceWeight;
use super::template::{ParamSpec, QueryTemplate};
use crate::config::QueryConfig;
use crate::error::{EncodingError, ParamError, Result, SchemaError};
use crate::filter::Predicate;
use crate::index::Index;
use crate::metrics::EngineCounters;
use crate::schema::{parse_timestamp, SCHEMA_KEY};
use crate::space::{Space, SpaceKind};
use crate::telemetry::PiiPolicy;
use crate::types::FieldValue;
use crate::vector;

/// Failure reported by a [`ParamExtractor`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    /// The output could not be parsed into a name → value mapping.
    #[error("Malformed extractor output: {0}")]
    Malformed(String),

    /// The backing service could not be reached.
    #[error("Extractor unavailable: {0}")]
    Unavailable(String),
}

/// Turns free text into values for declared params.
#[async_trait]
pub trait ParamExtractor: Send + Sync {
    /// Map `text` onto `params`. Missing or `null` entries mean "no value".
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] when the output is unusable or the
    /// service is down.
    async fn extract(&self, text: &str, params: &[ParamSpec]) -> std::result::Result<Map<String, Value>, ExtractionError>;
}

/// A fully bound query, ready for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    /// Query vector; inner product with a stored vector is the score.
    pub query_vector: Vec<f32>,
    /// Hard filter, always scoped to the template's schema.
    pub filter: Predicate,
    /// Result size.
    pub limit: usize,
    /// Effective per-space weights, in composition order.
    pub space_weights: Vec<SpaceWeight>,
    /// Value bound to every param.
    pub params: BTreeMap<String, Value>,
    /// Natural-language text, when one was bound.
    pub natural_query: Option<String>,
}

/// Binds templates against one index.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    index: &'a Index,
    config: &'a QueryConfig,
    counters: Option<&'a EngineCounters>,
    pii: PiiPolicy,
}

impl<'a> Resolver<'a> {
    /// Resolver over `index` with the limits of `config`.
    #[must_use]
    pub fn new(index: &'a Index, config: &'a QueryConfig) -> Self {
        Self {
            index,
            config,
            counters: None,
            pii: PiiPolicy::default(),
        }
    }

    /// Count natural-language attempts and failures.
    #[must_use]
    pub fn with_counters(mut self, counters: &'a EngineCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Log natural-language text according to `pii`.
    #[must_use]
    pub fn with_pii(mut self, pii: PiiPolicy) -> Self {
        self.pii = pii;
        self
    }

    /// Bind every param and build the search request.
    ///
    /// # Errors
    ///
    /// Returns a [`ParamError`] naming the param that could not be bound, a
    /// [`SchemaError`] if the template belongs to another index, or an
    /// [`EncodingError`] if a bound value cannot be encoded.
    #[instrument(name = "spacemix::resolve", skip_all, fields(index = %template.index, schema = %template.schema))]
    pub async fn resolve(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
        extractor: Option<&dyn ParamExtractor>,
    ) -> Result<ResolvedQuery> {
        let bound = self.bind(template, params, extractor).await?;
        self.build(template, bound)
    }

    async fn bind(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
        extractor: Option<&dyn ParamExtractor>,
    ) -> Result<BTreeMap<String, Value>> {
        if template.index != self.index.name() {
            return Err(SchemaError::SchemaNotIndexed {
                schema: template.schema.clone(),
                index: self.index.name().to_string(),
            }
            .into());
        }
        if let Some(unknown) = params.names().find(|n| template.param(n).is_none()) {
            return Err(ParamError::UnknownParam(unknown.to_string()).into());
        }

        let mut bound = BTreeMap::new();
        for spec in &template.params {
            if let Some(value) = params.get(spec.name()) {
                bound.insert(spec.name().to_string(), validate(spec, value.clone())?);
            }
        }

        let text_param = template.natural_query().and_then(Bindable::as_param).map(|p| p.name.clone());
        let text = match template.natural_query() {
            None => None,
            Some(Bindable::Fixed(text)) => Some(text.clone()),
            Some(Bindable::Param(p)) => {
                let value = match bound.get(&p.name) {
                    Some(v) => v.clone(),
                    None => validate_default(template, &p.name)?.unwrap_or(Value::Null),
                };
                let text = value.as_str().map(str::to_string);
                bound.insert(p.name.clone(), value);
                text
            }
        };

        let pending: Vec<ParamSpec> = template
            .params
            .iter()
            .filter(|s| !bound.contains_key(s.name()) && Some(s.name()) != text_param.as_deref())
            .cloned()
            .collect();

        if let (false, Some(text), Some(extractor)) = (pending.is_empty(), text.as_deref(), extractor) {
            self.extract(text, &pending, extractor, &mut bound).await?;
        }

        for spec in &template.params {
            if bound.contains_key(spec.name()) {
                continue;
            }
            match validate_default(template, spec.name())? {
                Some(value) => {
                    bound.insert(spec.name().to_string(), value);
                }
                None => {
                    return Err(ParamError::Unresolved {
                        param: spec.name().to_string(),
                        usage: spec.usage.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(bound)
    }

    async fn extract(
        &self,
        text: &str,
        pending: &[ParamSpec],
        extractor: &dyn ParamExtractor,
        bound: &mut BTreeMap<String, Value>,
    ) -> Result<()> {
        if let Some(c) = self.counters {
            EngineCounters::incr(&c.nl_resolutions);
        }
        info!(text = %self.pii.show(text), params = pending.len(), "Extracting params from natural language");

        let timeout_ms = self.config.natural_query_timeout_ms;
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), extractor.extract(text, pending)).await;
        let failure = match outcome {
            Ok(Ok(values)) => {
                for spec in pending {
                    match values.get(spec.name()) {
                        None | Some(Value::Null) => {}
                        Some(value) => {
                            debug!(param = spec.name(), value = %self.pii.show(value), "Extracted param");
                            bound.insert(spec.name().to_string(), validate(spec, value.clone())?);
                        }
                    }
                }
                return Ok(());
            }
            Ok(Err(e)) => ParamError::NaturalLanguage {
                params: pending.iter().map(ParamSpec::name).collect::<Vec<_>>().join(", "),
                reason: e.to_string(),
            },
            Err(_) => ParamError::Timeout(timeout_ms),
        };

        if let Some(c) = self.counters {
            EngineCounters::incr(&c.nl_failures);
        }
        if pending.iter().all(|s| s.param.default.is_some()) {
            warn!(error = %failure, "Natural-language extraction failed, falling back to defaults");
            Ok(())
        } else {
            Err(failure.into())
        }
    }

    fn build(&self, template: &QueryTemplate, params: BTreeMap<String, Value>) -> Result<ResolvedQuery> {
        let value_of = |b: &Bindable<Value>| match b {
            Bindable::Fixed(v) => v.clone(),
            Bindable::Param(p) => params.get(&p.name).cloned().unwrap_or(Value::Null),
        };
        let number_of = |b: &Bindable<f64>| -> std::result::Result<f64, ParamError> {
            match b {
                Bindable::Fixed(v) => Ok(*v),
                Bindable::Param(p) => {
                    let v = params.get(&p.name).unwrap_or(&Value::Null);
                    v.as_f64().filter(|f| f.is_finite()).ok_or_else(|| ParamError::InvalidType {
                        param: p.name.clone(),
                        expected: "float".to_string(),
                        actual: json_kind(v).to_string(),
                    })
                }
            }
        };

        let mut weights: Vec<f64> = self.index.spaces().iter().map(|s| s.default_weight).collect();
        for clause in &template.weights {
            if let Some(p) = self.index.position(&clause.space) {
                weights[p] = number_of(&clause.weight)?;
            }
        }

        let mut units: Vec<Option<Vec<f32>>> = vec![None; weights.len()];
        for clause in &template.similar {
            let value = value_of(&clause.value);
            if value.is_null() {
                continue;
            }
            let Some(p) = self.index.position(&clause.space) else {
                continue;
            };
            let space = &self.index.spaces()[p].space;
            let encoded = space.encode_query(&query_value(space, &value)?)?;
            let mix = number_of(&clause.weight)?;
            let acc = units[p].get_or_insert_with(|| vec![0.0; space.dimensions()]);
            vector::add_scaled(acc, &encoded, mix as f32);
        }

        let parts: Vec<(f64, Vec<f32>)> = self
            .index
            .spaces()
            .iter()
            .zip(weights.iter().zip(units))
            .map(|(s, (&w, unit))| {
                let u = match unit {
                    Some(mut acc) => {
                        vector::normalize_in_place(&mut acc);
                        acc
                    }
                    None => s.space.preference_vector().unwrap_or_else(|| vec![0.0; s.space.dimensions()]),
                };
                (w, u)
            })
            .collect();
        let query_vector = self.index.compose_query(&parts);

        let scope = Predicate::eq(SCHEMA_KEY, Value::String(template.schema.clone()));
        let filter = match &template.filter {
            None => scope,
            Some(f) => {
                let resolved = f.try_map(&mut |field, operand| {
                    Ok::<_, ParamError>(filter_operand(template, field, value_of(operand)))
                })?;
                Predicate::and(vec![scope, resolved])
            }
        };

        let limit = self.limit(template, &params)?;
        let space_weights = self
            .index
            .spaces()
            .iter()
            .zip(&weights)
            .map(|(s, &weight)| SpaceWeight {
                space: s.space.name().to_string(),
                weight,
            })
            .collect();
        let natural_query = match template.natural_query() {
            Some(Bindable::Fixed(text)) => Some(text.clone()),
            Some(Bindable::Param(p)) => params.get(&p.name).and_then(Value::as_str).map(str::to_string),
            None => None,
        };

        Ok(ResolvedQuery {
            query_vector,
            filter,
            limit,
            space_weights,
            params,
            natural_query,
        })
    }

    fn limit(&self, template: &QueryTemplate, params: &BTreeMap<String, Value>) -> std::result::Result<usize, ParamError> {
        let max = self.config.max_limit;
        let requested = match &template.limit {
            None => return Ok(self.config.default_limit),
            Some(Bindable::Fixed(n)) => *n,
            Some(Bindable::Param(p)) => {
                let v = params.get(&p.name).unwrap_or(&Value::Null);
                v.as_i64().ok_or_else(|| ParamError::InvalidType {
                    param: p.name.clone(),
                    expected: "integer".to_string(),
                    actual: json_kind(v).to_string(),
                })?
            }
        };
        usize::try_from(requested)
            .ok()
            .filter(|n| (1..=max).contains(n))
            .ok_or(ParamError::InvalidLimit { limit: requested, max })
    }
}

fn validate(spec: &ParamSpec, value: Value) -> std::result::Result<Value, ParamError> {
    let value = spec.param_type.coerce(spec.name(), value)?;
    check_range(&spec.param, &value)?;
    Ok(value)
}

fn validate_default(template: &QueryTemplate, name: &str) -> std::result::Result<Option<Value>, ParamError> {
    let Some(spec) = template.param(name) else {
        return Ok(None);
    };
    spec.param.default.clone().map(|v| validate(spec, v)).transpose()
}

/// Timestamp operands compare against unix seconds in the payload.
fn filter_operand(template: &QueryTemplate, field: &str, value: Value) -> Value {
    if template.timestamp_fields.iter().any(|f| f == field) {
        if let Some(t) = parse_timestamp(&value) {
            return Value::from(t.timestamp());
        }
    }
    value
}

/// Convert a bound JSON value into the input type of `space`.
fn query_value(space: &Space, value: &Value) -> std::result::Result<FieldValue, EncodingError> {
    let unsupported = || EncodingError::UnsupportedValue {
        encoder: space.model_name().to_string(),
        value_kind: json_kind(value).to_string(),
    };
    let labels = |v: &Value| -> Option<Vec<String>> {
        match v {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => items.iter().map(|i| i.as_str().map(str::to_string)).collect(),
            _ => None,
        }
    };
    match space.kind() {
        SpaceKind::Text | SpaceKind::Image => value.as_str().map(FieldValue::from).ok_or_else(unsupported),
        SpaceKind::Number { .. } => value.as_f64().map(FieldValue::Float).ok_or_else(unsupported),
        SpaceKind::Recency { .. } => parse_timestamp(value).map(FieldValue::Timestamp).ok_or_else(unsupported),
        SpaceKind::Categorical { .. } => labels(value).map(FieldValue::Categories).ok_or_else(unsupported),
        SpaceKind::Custom { .. } => match value {
            Value::String(s) => Ok(FieldValue::Str(s.clone())),
            Value::Number(n) => Ok(n.as_i64().map_or_else(|| FieldValue::Float(n.as_f64().unwrap_or(0.0)), FieldValue::Int)),
            Value::Array(_) => labels(value).map(FieldValue::Categories).ok_or_else(unsupported),
            _ => Err(unsupported()),
        },
    }
}
