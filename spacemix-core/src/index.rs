//! Weighted composite vector construction.
//!
//! Stored vectors are the concatenation of each space's *unweighted* unit (or
//! zero) sub-vector. Weights only ever touch the query side: the query
//! sub-vector for space `i` is `s(q_i) · u_i` with `s(q) = sign(q)·√|q|`, and
//! the score is the inner product
//!
//! ```text
//! score = Σ_i s(q_i) · (v_i · u_i)
//! ```
//!
//! so changing query weights never requires rewriting stored data.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EncodingError, SchemaError, SpaceConfigError};
use crate::schema::{FieldRef, ParsedRecord};
use crate::space::Space;
use crate::vector;

/// How an event type mutates records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Event type this effect handles (e.g. `"purchase"`).
    pub event_type: String,
    /// Spaces mutated by events of this type.
    pub spaces: Vec<String>,
    /// Scale applied to every event weight of this type.
    pub multiplier: f64,
}

impl Effect {
    /// Effect of `event_type` on `spaces` with multiplier 1.
    #[must_use]
    pub fn new<S: AsRef<str>>(event_type: impl Into<String>, spaces: &[S]) -> Self {
        Self {
            event_type: event_type.into(),
            spaces: spaces.iter().map(|s| s.as_ref().to_string()).collect(),
            multiplier: 1.0,
        }
    }

    /// Set the weight multiplier.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

/// A space placed in an index.
#[derive(Debug, Clone)]
pub struct IndexedSpace {
    /// The space.
    pub space: Space,
    /// Default query weight, used when a query does not mention the space.
    pub default_weight: f64,
    /// Start of the space's slice in the composite vector.
    pub offset: usize,
}

impl IndexedSpace {
    /// Range of the composite vector owned by this space.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.space.dimensions()
    }
}

/// Per-space entry of an [`IndexLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceLayout {
    /// Space name.
    pub name: String,
    /// Sub-vector dimension.
    pub dimensions: usize,
    /// Encoder model name.
    pub model: String,
}

/// The shape of stored vectors. A store refuses vectors of another layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLayout {
    /// Index name.
    pub name: String,
    /// Spaces in composition order.
    pub spaces: Vec<SpaceLayout>,
}

impl IndexLayout {
    /// Total composite dimension.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.spaces.iter().map(|s| s.dimensions).sum()
    }

    /// Compact textual fingerprint, e.g. `desc:hashed-text:256|rating:number:2`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.spaces
            .iter()
            .map(|s| format!("{}:{}:{}", s.name, s.model, s.dimensions))
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Score contribution of one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceScore {
    /// Space name.
    pub space: String,
    /// `s(q_i) · (v_i · u_i)`.
    pub score: f32,
}

/// Ordered set of spaces with default weights. Immutable once built.
#[derive(Debug, Clone)]
pub struct Index {
    name: String,
    spaces: Vec<IndexedSpace>,
    schemas: BTreeSet<String>,
    filterable: Vec<FieldRef>,
    effects: HashMap<String, Effect>,
    dimensions: usize,
}

impl Index {
    /// Start declaring an index.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> IndexBuilder {
        IndexBuilder {
            name: name.into(),
            spaces: Vec::new(),
            filterable: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spaces in composition order.
    #[must_use]
    pub fn spaces(&self) -> &[IndexedSpace] {
        &self.spaces
    }

    /// Position of a space in composition order.
    #[must_use]
    pub fn position(&self, space: &str) -> Option<usize> {
        self.spaces.iter().position(|s| s.space.name() == space)
    }

    /// Look up a space by name.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceConfigError::UnknownSpace`] if the index has no such space.
    pub fn space(&self, name: &str) -> Result<&IndexedSpace, SpaceConfigError> {
        self.position(name)
            .map(|i| &self.spaces[i])
            .ok_or_else(|| SpaceConfigError::UnknownSpace {
                index: self.name.clone(),
                space: name.to_string(),
            })
    }

    /// Composite vector dimension.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Dimension of each space, in composition order.
    #[must_use]
    pub fn space_dimensions(&self) -> Vec<usize> {
        self.spaces.iter().map(|s| s.space.dimensions()).collect()
    }

    /// Schemas with at least one bound field.
    pub fn schemas(&self) -> impl Iterator<Item = &str> {
        self.schemas.iter().map(String::as_str)
    }

    /// Whether records of `schema` can be ingested.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::SchemaNotIndexed`] otherwise.
    pub fn ensure_covers(&self, schema: &str) -> Result<(), SchemaError> {
        if self.schemas.contains(schema) {
            Ok(())
        } else {
            Err(SchemaError::SchemaNotIndexed {
                schema: schema.to_string(),
                index: self.name.clone(),
            })
        }
    }

    /// Fields usable in hard filters.
    #[must_use]
    pub fn filterable(&self) -> &[FieldRef] {
        &self.filterable
    }

    /// Whether `field` of `schema` may appear in a filter.
    #[must_use]
    pub fn is_filterable(&self, schema: &str, field: &str) -> bool {
        self.filterable.iter().any(|f| f.schema == schema && f.name == field)
    }

    /// Declared effect for an event type.
    #[must_use]
    pub fn effect(&self, event_type: &str) -> Option<&Effect> {
        self.effects.get(event_type)
    }

    /// Stored-vector layout.
    #[must_use]
    pub fn layout(&self) -> IndexLayout {
        IndexLayout {
            name: self.name.clone(),
            spaces: self
                .spaces
                .iter()
                .map(|s| SpaceLayout {
                    name: s.space.name().to_string(),
                    dimensions: s.space.dimensions(),
                    model: s.space.model_name().to_string(),
                })
                .collect(),
        }
    }

    /// Unit (or zero) sub-vectors of a record, one per space.
    ///
    /// # Errors
    ///
    /// Propagates the first encoder failure.
    pub fn encode_subvectors(&self, record: &ParsedRecord) -> Result<Vec<Vec<f32>>, EncodingError> {
        self.spaces.iter().map(|s| s.space.encode_record(record)).collect()
    }

    /// Concatenate per-space sub-vectors into a stored vector.
    #[must_use]
    pub fn concat(&self, subvectors: &[Vec<f32>]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        for v in subvectors {
            out.extend_from_slice(v);
        }
        out
    }

    /// Stored vector of a record.
    ///
    /// # Errors
    ///
    /// Propagates the first encoder failure.
    pub fn compose(&self, record: &ParsedRecord) -> Result<Vec<f32>, EncodingError> {
        Ok(self.concat(&self.encode_subvectors(record)?))
    }

    /// Build a query vector from per-space `(weight, unit query sub-vector)`
    /// pairs given in composition order.
    #[must_use]
    pub fn compose_query(&self, parts: &[(f64, Vec<f32>)]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        for (s, (weight, unit)) in self.spaces.iter().zip(parts) {
            let scale = vector::signed_sqrt(*weight) as f32;
            if unit.len() == s.space.dimensions() {
                out.extend(unit.iter().map(|x| x * scale));
            } else {
                out.extend(std::iter::repeat(0.0).take(s.space.dimensions()));
            }
        }
        out
    }

    /// Put an LRU cache of `capacity` entries in front of every encoder.
    #[must_use]
    pub fn with_encoder_cache(mut self, capacity: usize) -> Self {
        self.spaces = self
            .spaces
            .into_iter()
            .map(|s| IndexedSpace {
                space: s.space.cached(capacity),
                ..s
            })
            .collect();
        self
    }

    /// Slice of `v` belonging to the space at `position`.
    #[must_use]
    pub fn slice<'a>(&self, v: &'a [f32], position: usize) -> &'a [f32] {
        self.spaces
            .get(position)
            .and_then(|s| v.get(s.range()))
            .unwrap_or(&[])
    }

    /// Per-space contribution to the score of `stored` against `query`.
    #[must_use]
    pub fn explain(&self, stored: &[f32], query: &[f32]) -> Vec<SpaceScore> {
        self.spaces
            .iter()
            .map(|s| SpaceScore {
                space: s.space.name().to_string(),
                score: stored
                    .get(s.range())
                    .zip(query.get(s.range()))
                    .map_or(0.0, |(a, b)| vector::dot(a, b)),
            })
            .collect()
    }
}

/// Incremental [`Index`] declaration.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    name: String,
    spaces: Vec<(Space, f64)>,
    filterable: Vec<FieldRef>,
    effects: Vec<Effect>,
}

impl IndexBuilder {
    /// Append a space with its default query weight.
    #[must_use]
    pub fn space(mut self, space: Space, default_weight: f64) -> Self {
        self.spaces.push((space, default_weight));
        self
    }

    /// Allow `field` in hard filters.
    #[must_use]
    pub fn filterable(mut self, field: FieldRef) -> Self {
        self.filterable.push(field);
        self
    }

    /// Declare how an event type mutates records.
    #[must_use]
    pub fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Finish the declaration.
    ///
    /// # Errors
    ///
    /// Fails on an empty index, duplicate space names, non-positive default
    /// weights, filter fields of uncovered schemas, and effects naming unknown
    /// spaces or carrying an invalid multiplier.
    pub fn build(self) -> Result<Index, SpaceConfigError> {
        if self.spaces.is_empty() {
            return Err(SpaceConfigError::EmptyIndex { index: self.name });
        }

        let mut names = HashSet::new();
        let mut spaces = Vec::with_capacity(self.spaces.len());
        let mut schemas = BTreeSet::new();
        let mut offset = 0;
        for (space, weight) in self.spaces {
            if !names.insert(space.name().to_string()) {
                return Err(SpaceConfigError::DuplicateSpace {
                    index: self.name,
                    space: space.name().to_string(),
                });
            }
            if !weight.is_finite() || weight <= 0.0 {
                return Err(SpaceConfigError::InvalidWeight {
                    space: space.name().to_string(),
                    weight,
                });
            }
            for b in space.bindings() {
                schemas.insert(b.field.schema.clone());
            }
            let dims = space.dimensions();
            spaces.push(IndexedSpace {
                space,
                default_weight: weight,
                offset,
            });
            offset += dims;
        }

        for f in &self.filterable {
            if !schemas.contains(&f.schema) {
                return Err(SpaceConfigError::InvalidParameter {
                    space: self.name.clone(),
                    reason: format!("filterable field {f} belongs to a schema the index does not cover"),
                });
            }
        }

        let mut effects = HashMap::new();
        for e in self.effects {
            if e.spaces.is_empty() || !e.multiplier.is_finite() || e.multiplier <= 0.0 {
                return Err(SpaceConfigError::InvalidParameter {
                    space: self.name.clone(),
                    reason: format!(
                        "effect '{}' needs at least one space and a positive multiplier",
                        e.event_type
                    ),
                });
            }
            if let Some(unknown) = e.spaces.iter().find(|s| !names.contains(*s)) {
                return Err(SpaceConfigError::UnknownSpace {
                    index: self.name.clone(),
                    space: unknown.clone(),
                });
            }
            if effects.contains_key(&e.event_type) {
                return Err(SpaceConfigError::InvalidParameter {
                    space: self.name.clone(),
                    reason: format!("effect '{}' declared twice", e.event_type),
                });
            }
            effects.insert(e.event_type.clone(), e);
        }

        Ok(Index {
            name: self.name,
            spaces,
            schemas,
            filterable: self.filterable,
            effects,
            dimensions: offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{HashedTextEncoder, NumberEncoder};
    use crate::schema::{FieldType, Schema};
    use crate::types::SpaceMode;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::builder("product")
            .id("id")
            .field("description", FieldType::String)
            .field("rating", FieldType::Float)
            .field("brand", FieldType::String)
            .build()
            .expect("valid schema")
    }

    fn spaces(s: &Schema) -> (Space, Space) {
        let desc = Space::text(
            "desc",
            &[s.field("description").expect("f")],
            Arc::new(HashedTextEncoder::new(16)),
        )
        .expect("valid");
        let rating = Space::number(
            "rating",
            &[s.field("rating").expect("f")],
            NumberEncoder::new(1.0, 5.0, SpaceMode::Maximize),
        )
        .expect("valid");
        (desc, rating)
    }

    fn index() -> Index {
        let s = schema();
        let (desc, rating) = spaces(&s);
        Index::builder("products")
            .space(desc, 1.0)
            .space(rating, 1.0)
            .filterable(s.field("brand").expect("f"))
            .effect(Effect::new("like", &["desc"]))
            .build()
            .expect("valid index")
    }

    #[test]
    fn offsets_and_dimensions() {
        let idx = index();
        assert_eq!(idx.dimensions(), 18);
        assert_eq!(idx.spaces()[1].offset, 16);
        assert_eq!(idx.layout().fingerprint(), "desc:hashed-text:16|rating:number:2");
        assert_eq!(idx.layout().dimensions(), 18);
    }

    #[test]
    fn rejects_bad_declarations() {
        let s = schema();
        assert!(matches!(Index::builder("e").build(), Err(SpaceConfigError::EmptyIndex { .. })));

        let (desc, _) = spaces(&s);
        let err = Index::builder("w").space(desc, 0.0).build();
        assert!(matches!(err, Err(SpaceConfigError::InvalidWeight { .. })));

        let (desc, _) = spaces(&s);
        let err = Index::builder("d").space(desc.clone(), 1.0).space(desc, 1.0).build();
        assert!(matches!(err, Err(SpaceConfigError::DuplicateSpace { .. })));

        let (desc, _) = spaces(&s);
        let err = Index::builder("x")
            .space(desc, 1.0)
            .effect(Effect::new("like", &["nope"]))
            .build();
        assert!(matches!(err, Err(SpaceConfigError::UnknownSpace { .. })));
    }

    #[test]
    fn filterable_must_be_covered() {
        let s = schema();
        let other = Schema::builder("user")
            .id("id")
            .field("age", FieldType::Integer)
            .build()
            .expect("valid schema");
        let (desc, _) = spaces(&s);
        let err = Index::builder("x")
            .space(desc, 1.0)
            .filterable(other.field("age").expect("f"))
            .build();
        assert!(matches!(err, Err(SpaceConfigError::InvalidParameter { .. })));
    }

    #[test]
    fn stored_subvectors_are_unweighted_units() {
        let idx = index();
        let rec = schema()
            .parse(&json!({ "id": "1", "description": "toothbrush", "rating": 4 }))
            .expect("valid");
        let v = idx.compose(&rec).expect("compose");
        for pos in 0..idx.spaces().len() {
            let norm = vector::l2_norm(idx.slice(&v, pos));
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn query_score_scales_with_root_of_weight() {
        let idx = index();
        let rec = schema()
            .parse(&json!({ "id": "1", "description": "toothbrush", "rating": 4 }))
            .expect("valid");
        let stored = idx.compose(&rec).expect("compose");
        let subs = idx.encode_subvectors(&rec).expect("encode");

        let q1 = idx.compose_query(&[(1.0, subs[0].clone()), (1.0, subs[1].clone())]);
        let q4 = idx.compose_query(&[(1.0, subs[0].clone()), (4.0, subs[1].clone())]);
        let e1 = idx.explain(&stored, &q1);
        let e4 = idx.explain(&stored, &q4);
        assert!((e4[1].score - 2.0 * e1[1].score).abs() < 1e-5);
        assert!((e4[0].score - e1[0].score).abs() < 1e-6);
    }

    #[test]
    fn negative_weight_flips_contribution() {
        let idx = index();
        let rec = schema().parse(&json!({ "id": "1", "rating": 5 })).expect("valid");
        let stored = idx.compose(&rec).expect("compose");
        let pref = vec![0.0, 1.0];
        let q = idx.compose_query(&[(0.0, vec![0.0; 16]), (-1.0, pref)]);
        let e = idx.explain(&stored, &q);
        assert!(e[1].score < 0.0);
    }

    #[test]
    fn filterable_lookup() {
        let idx = index();
        assert!(idx.is_filterable("product", "brand"));
        assert!(!idx.is_filterable("product", "rating"));
        assert!(idx.effect("like").is_some());
        assert!(idx.ensure_covers("product").is_ok());
        assert!(idx.ensure_covers("user").is_err());
    }
}
