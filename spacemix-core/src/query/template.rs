//! Immutable query templates and their builder.
//!
//! A template is declared once against an index and a schema and resolved
//! per request. Every [`Param`] it mentions gets an expected type from the
//! place it is used; using one name with two incompatible types is a
//! declaration error.

use serde::Serialize;
use serde_json::Value;

use super::param::{Bindable, Param, ParamType};
use crate::error::{ParamError, Result, SchemaError, SpaceConfigError};
use crate::filter::Predicate;
use crate::index::Index;
use crate::schema::{FieldType, Schema, SCHEMA_KEY};

/// A param together with its inferred type and first use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    /// The declared param.
    pub param: Param,
    /// Expected type.
    pub param_type: ParamType,
    /// Where the param is first used, e.g. `weight of space 'rating'`.
    pub usage: String,
    /// What the bound space encodes and how its weight reads, if any.
    pub hint: Option<String>,
}

impl ParamSpec {
    /// Param name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.param.name
    }
}

/// `similar(space, value, weight)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarClause {
    /// Target space.
    pub space: String,
    /// Value to be similar to.
    pub value: Bindable<Value>,
    /// Relative weight among clauses of the same space.
    pub weight: Bindable<f64>,
}

/// `weight(space, weight)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightClause {
    /// Target space.
    pub space: String,
    /// Space weight for this query.
    pub weight: Bindable<f64>,
}

/// Entry point for declaring queries.
#[derive(Debug, Clone, Copy)]
pub struct Query;

impl Query {
    /// Start a query over records of `schema` in `index`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::SchemaNotIndexed`] if no space of the index
    /// binds the schema.
    pub fn find<'a>(index: &'a Index, schema: &'a Schema) -> std::result::Result<QueryBuilder<'a>, SchemaError> {
        index.ensure_covers(schema.name())?;
        Ok(QueryBuilder {
            index,
            schema,
            similar: Vec::new(),
            weights: Vec::new(),
            filters: Vec::new(),
            limit: None,
            natural_query: None,
        })
    }
}

/// Chained query declaration, validated by [`QueryBuilder::build`].
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    index: &'a Index,
    schema: &'a Schema,
    similar: Vec<SimilarClause>,
    weights: Vec<WeightClause>,
    filters: Vec<Predicate<Bindable<Value>>>,
    limit: Option<Bindable<i64>>,
    natural_query: Option<Bindable<String>>,
}

impl<'a> QueryBuilder<'a> {
    /// Rank by similarity to `value` in `space`. Several clauses on one space
    /// are mixed by their `weight`; a negative weight pushes away.
    #[must_use]
    pub fn similar(
        mut self,
        space: impl Into<String>,
        value: impl Into<Bindable<Value>>,
        weight: impl Into<Bindable<f64>>,
    ) -> Self {
        self.similar.push(SimilarClause {
            space: space.into(),
            value: value.into(),
            weight: weight.into(),
        });
        self
    }

    /// Override the default weight of `space`.
    #[must_use]
    pub fn weight(mut self, space: impl Into<String>, weight: impl Into<Bindable<f64>>) -> Self {
        self.weights.push(WeightClause {
            space: space.into(),
            weight: weight.into(),
        });
        self
    }

    /// Add a hard filter. Multiple filters are conjoined.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate<Bindable<Value>>) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Return at most `n` records.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(Bindable::Fixed(i64::try_from(n).unwrap_or(i64::MAX)));
        self
    }

    /// Take the result limit from a param.
    #[must_use]
    pub fn limit_param(mut self, param: Param) -> Self {
        self.limit = Some(Bindable::Param(param));
        self
    }

    /// Free text from which unbound params may be extracted.
    #[must_use]
    pub fn with_natural_query(mut self, text: impl Into<Bindable<String>>) -> Self {
        self.natural_query = Some(text.into());
        self
    }

    /// Validate and freeze the declaration.
    ///
    /// # Errors
    ///
    /// Fails on unknown spaces, a space weighted twice, unknown or
    /// non-filterable filter fields, and params used with conflicting types.
    pub fn build(self) -> Result<QueryTemplate> {
        let mut specs = ParamSpecs::default();

        for clause in &self.similar {
            let space = &self.index.space(&clause.space)?.space;
            if let Some(p) = clause.value.as_param() {
                specs.add(
                    p,
                    ParamType::for_space(space),
                    format!("similar value for space '{}'", clause.space),
                    Some(space.annotation()),
                )?;
            }
            if let Some(p) = clause.weight.as_param() {
                specs.add(
                    p,
                    ParamType::Float,
                    format!("clause weight for space '{}'", clause.space),
                    Some(space.annotation()),
                )?;
            }
        }

        for (i, clause) in self.weights.iter().enumerate() {
            let space = &self.index.space(&clause.space)?.space;
            if self.weights[..i].iter().any(|w| w.space == clause.space) {
                return Err(SpaceConfigError::InvalidParameter {
                    space: clause.space.clone(),
                    reason: "weight declared twice in one query".to_string(),
                }
                .into());
            }
            if let Some(p) = clause.weight.as_param() {
                specs.add(
                    p,
                    ParamType::Float,
                    format!("weight of space '{}'", clause.space),
                    Some(space.annotation()),
                )?;
            }
        }

        let mut timestamp_fields = Vec::new();
        for predicate in &self.filters {
            for (field, operand) in predicate.operands() {
                let field_type = self.filter_field_type(field)?;
                if field_type == FieldType::Timestamp && !timestamp_fields.iter().any(|f| f == field) {
                    timestamp_fields.push(field.to_string());
                }
                if let Some(p) = operand.as_param() {
                    specs.add(p, ParamType::for_field(field_type), format!("filter on '{field}'"), None)?;
                }
            }
            for field in predicate.fields() {
                self.filter_field_type(field)?;
            }
        }

        if let Some(Bindable::Param(p)) = &self.limit {
            specs.add(p, ParamType::Integer, "result limit".to_string(), None)?;
        }
        if let Some(Bindable::Param(p)) = &self.natural_query {
            specs.add(p, ParamType::String, "natural-language query".to_string(), None)?;
        }

        let mut filters = self.filters;
        let filter = match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Predicate::and(filters)),
        };

        Ok(QueryTemplate {
            index: self.index.name().to_string(),
            schema: self.schema.name().to_string(),
            similar: self.similar,
            weights: self.weights,
            filter,
            timestamp_fields,
            limit: self.limit,
            natural_query: self.natural_query,
            params: specs.0,
        })
    }

    fn filter_field_type(&self, field: &str) -> std::result::Result<FieldType, SchemaError> {
        if field == SCHEMA_KEY {
            return Ok(FieldType::String);
        }
        let field_ref = self.schema.field(field)?;
        if field_ref.field_type == FieldType::Id || self.index.is_filterable(self.schema.name(), field) {
            Ok(field_ref.field_type)
        } else {
            Err(SchemaError::NotFilterable {
                field: field.to_string(),
                index: self.index.name().to_string(),
            })
        }
    }
}

#[derive(Default)]
struct ParamSpecs(Vec<ParamSpec>);

impl ParamSpecs {
    fn add(
        &mut self,
        param: &Param,
        param_type: ParamType,
        usage: String,
        hint: Option<String>,
    ) -> std::result::Result<(), ParamError> {
        if let Some(existing) = self.0.iter().find(|s| s.param.name == param.name) {
            if existing.param_type != param_type {
                return Err(ParamError::ConflictingUse {
                    param: param.name.clone(),
                    first: existing.param_type.to_string(),
                    second: param_type.to_string(),
                });
            }
            return Ok(());
        }
        self.0.push(ParamSpec {
            param: param.clone(),
            param_type,
            usage,
            hint,
        });
        Ok(())
    }
}

/// A validated query, resolved per request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTemplate {
    pub(crate) index: String,
    pub(crate) schema: String,
    pub(crate) similar: Vec<SimilarClause>,
    pub(crate) weights: Vec<WeightClause>,
    pub(crate) filter: Option<Predicate<Bindable<Value>>>,
    pub(crate) timestamp_fields: Vec<String>,
    pub(crate) limit: Option<Bindable<i64>>,
    pub(crate) natural_query: Option<Bindable<String>>,
    pub(crate) params: Vec<ParamSpec>,
}

impl QueryTemplate {
    /// Index the template was declared against.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Schema whose records the query returns.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Declared params in order of first use.
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Spec of the param called `name`.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|s| s.param.name == name)
    }

    /// `similar` clauses.
    #[must_use]
    pub fn similar_clauses(&self) -> &[SimilarClause] {
        &self.similar
    }

    /// Natural-language query slot.
    #[must_use]
    pub fn natural_query(&self) -> Option<&Bindable<String>> {
        self.natural_query.as_ref()
    }
}
