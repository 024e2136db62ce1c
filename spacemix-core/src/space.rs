//! Spaces: one encoder bound to schema fields.
//!
//! A space binds at most one field per schema, so a single space can cover
//! `user.preference` and `product.description` and place both in the same
//! vector space. Records of a schema the space does not bind contribute a
//! zero sub-vector.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::encoder::{
    preference_for, CachedEncoder, CategoricalEncoder, Encoder, NumberEncoder, RecencyEncoder,
};
use crate::error::{EncodingError, SpaceConfigError};
use crate::schema::{FieldRef, FieldType, ParsedRecord};
use crate::types::{FieldValue, SpaceMode};
use crate::vector;

/// What a space encodes.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceKind {
    /// Free text through a text encoder.
    Text,
    /// Bounded scalar.
    Number {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Comparison mode.
        mode: SpaceMode,
        /// Log-scaled normalization.
        log_scale: bool,
    },
    /// Timestamp recency over a fixed window.
    Recency {
        /// Window length.
        period: Duration,
        /// Fixed anchor.
        anchor: DateTime<Utc>,
    },
    /// Category labels.
    Categorical {
        /// Declared categories.
        categories: Vec<String>,
    },
    /// Image blobs, optionally with a text description.
    Image,
    /// Caller-supplied encoder.
    Custom {
        /// Comparison mode.
        mode: SpaceMode,
    },
}

/// An image field with an optional description in the same schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageField {
    /// Blob field.
    pub blob: FieldRef,
    /// Description field.
    pub description: Option<FieldRef>,
}

impl ImageField {
    /// Image without description.
    #[must_use]
    pub fn new(blob: FieldRef) -> Self {
        Self {
            blob,
            description: None,
        }
    }

    /// Attach a description field.
    #[must_use]
    pub fn described_by(mut self, description: FieldRef) -> Self {
        self.description = Some(description);
        self
    }
}

/// A space's binding to one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Main field.
    pub field: FieldRef,
    /// Secondary description field (image spaces only).
    pub description: Option<FieldRef>,
}

/// One encoder binding. Immutable once declared.
#[derive(Clone)]
pub struct Space {
    name: String,
    kind: SpaceKind,
    encoder: Arc<dyn Encoder>,
    bindings: Vec<Binding>,
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model", &self.encoder.model_name())
            .field("dimensions", &self.encoder.dimensions())
            .field("bindings", &self.bindings)
            .finish()
    }
}

fn bind(
    space: &str,
    fields: &[FieldRef],
    allowed: &[FieldType],
) -> Result<Vec<Binding>, SpaceConfigError> {
    if fields.is_empty() {
        return Err(SpaceConfigError::NoFields {
            space: space.to_string(),
        });
    }
    let mut schemas = HashSet::new();
    let mut out = Vec::with_capacity(fields.len());
    for f in fields {
        if !allowed.contains(&f.field_type) {
            return Err(SpaceConfigError::FieldType {
                space: space.to_string(),
                field: f.to_string(),
                field_type: f.field_type.to_string(),
            });
        }
        if !schemas.insert(f.schema.as_str()) {
            return Err(SpaceConfigError::DuplicateSchema {
                space: space.to_string(),
                schema: f.schema.clone(),
            });
        }
        out.push(Binding {
            field: f.clone(),
            description: None,
        });
    }
    Ok(out)
}

impl Space {
    /// Text similarity space.
    ///
    /// # Errors
    ///
    /// Fails if no fields are given, a field is not string/categorical, or two
    /// fields share a schema.
    pub fn text(
        name: impl Into<String>,
        fields: &[FieldRef],
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        let bindings = bind(&name, fields, &[FieldType::String, FieldType::Categorical])?;
        Ok(Self {
            name,
            kind: SpaceKind::Text,
            encoder,
            bindings,
        })
    }

    /// Bounded numeric space.
    ///
    /// # Errors
    ///
    /// Fails if `min >= max`, either bound is not finite, or a field is not
    /// numeric.
    pub fn number(
        name: impl Into<String>,
        fields: &[FieldRef],
        encoder: NumberEncoder,
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        let (min, max) = (encoder.min(), encoder.max());
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(SpaceConfigError::InvalidRange { space: name, min, max });
        }
        let bindings = bind(&name, fields, &[FieldType::Integer, FieldType::Float])?;
        Ok(Self {
            kind: SpaceKind::Number {
                min,
                max,
                mode: encoder.mode(),
                log_scale: encoder.is_log_scale(),
            },
            name,
            encoder: Arc::new(encoder),
            bindings,
        })
    }

    /// Recency space over `period` ending at the fixed `anchor`.
    ///
    /// # Errors
    ///
    /// Fails if `period` is not positive or a field is not a timestamp.
    pub fn recency(
        name: impl Into<String>,
        fields: &[FieldRef],
        period: Duration,
        anchor: DateTime<Utc>,
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        if period <= Duration::zero() {
            return Err(SpaceConfigError::InvalidParameter {
                space: name,
                reason: "recency period must be positive".to_string(),
            });
        }
        let bindings = bind(&name, fields, &[FieldType::Timestamp])?;
        Ok(Self {
            name,
            kind: SpaceKind::Recency { period, anchor },
            encoder: Arc::new(RecencyEncoder::new(anchor, period)),
            bindings,
        })
    }

    /// Categorical similarity space.
    ///
    /// # Errors
    ///
    /// Fails if no categories are declared or a field is not categorical/string.
    pub fn categorical<S: AsRef<str>>(
        name: impl Into<String>,
        fields: &[FieldRef],
        categories: &[S],
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        if categories.is_empty() {
            return Err(SpaceConfigError::InvalidParameter {
                space: name,
                reason: "at least one category is required".to_string(),
            });
        }
        let bindings = bind(&name, fields, &[FieldType::Categorical, FieldType::String])?;
        let encoder = CategoricalEncoder::new(categories);
        Ok(Self {
            name,
            kind: SpaceKind::Categorical {
                categories: encoder.categories().to_vec(),
            },
            encoder: Arc::new(encoder),
            bindings,
        })
    }

    /// Image space. The encoder must accept blob and text values in a shared
    /// space; an image's sub-vector is the normalized sum of its blob and
    /// description embeddings.
    ///
    /// # Errors
    ///
    /// Fails if a description lives in another schema than its image, field
    /// types are wrong, or two images share a schema.
    pub fn image(
        name: impl Into<String>,
        images: &[ImageField],
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        let blobs: Vec<FieldRef> = images.iter().map(|i| i.blob.clone()).collect();
        let mut bindings = bind(&name, &blobs, &[FieldType::Blob])?;
        for (binding, image) in bindings.iter_mut().zip(images) {
            if let Some(desc) = &image.description {
                if desc.schema != image.blob.schema {
                    return Err(SpaceConfigError::SchemaMismatch { space: name });
                }
                if desc.field_type != FieldType::String {
                    return Err(SpaceConfigError::FieldType {
                        space: name,
                        field: desc.to_string(),
                        field_type: desc.field_type.to_string(),
                    });
                }
                binding.description = Some(desc.clone());
            }
        }
        Ok(Self {
            name,
            kind: SpaceKind::Image,
            encoder,
            bindings,
        })
    }

    /// Space with a caller-supplied encoder over any non-identifier fields.
    ///
    /// # Errors
    ///
    /// Fails if no fields are given, a field is the identifier, or two fields
    /// share a schema.
    pub fn custom(
        name: impl Into<String>,
        fields: &[FieldRef],
        encoder: Arc<dyn Encoder>,
        mode: SpaceMode,
    ) -> Result<Self, SpaceConfigError> {
        let name = name.into();
        let bindings = bind(
            &name,
            fields,
            &[
                FieldType::String,
                FieldType::Integer,
                FieldType::Float,
                FieldType::Categorical,
                FieldType::Timestamp,
                FieldType::Blob,
            ],
        )?;
        Ok(Self {
            name,
            kind: SpaceKind::Custom { mode },
            encoder,
            bindings,
        })
    }

    /// Put an LRU cache of `capacity` entries in front of the encoder.
    /// A capacity of zero leaves the space unchanged.
    #[must_use]
    pub fn cached(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.encoder = Arc::new(CachedEncoder::new(self.encoder, capacity));
        }
        self
    }

    /// Space name, unique within an index.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the space encodes.
    #[must_use]
    pub fn kind(&self) -> &SpaceKind {
        &self.kind
    }

    /// Comparison mode.
    #[must_use]
    pub fn mode(&self) -> SpaceMode {
        match &self.kind {
            SpaceKind::Number { mode, .. } | SpaceKind::Custom { mode } => *mode,
            SpaceKind::Recency { .. } => SpaceMode::Maximize,
            _ => SpaceMode::Similarity,
        }
    }

    /// Output dimension of the sub-vector.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.encoder.dimensions()
    }

    /// Encoder model name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.encoder.model_name()
    }

    /// Per-schema bindings.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// The binding for `schema`, if any.
    #[must_use]
    pub fn binding_for(&self, schema: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.field.schema == schema)
    }

    /// Whether the space binds a field of `schema`.
    #[must_use]
    pub fn covers(&self, schema: &str) -> bool {
        self.binding_for(schema).is_some()
    }

    /// Preference direction for ordered spaces; `None` in similarity mode or
    /// for custom encoders.
    #[must_use]
    pub fn preference_vector(&self) -> Option<Vec<f32>> {
        match &self.kind {
            SpaceKind::Number { mode, .. } => preference_for(*mode),
            SpaceKind::Recency { .. } => preference_for(SpaceMode::Maximize),
            _ => None,
        }
    }

    fn checked(&self, raw: Vec<f32>) -> Result<Vec<f32>, EncodingError> {
        let expected = self.encoder.dimensions();
        if raw.len() != expected {
            return Err(EncodingError::Dimension {
                encoder: self.encoder.model_name().to_string(),
                expected,
                actual: raw.len(),
            });
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(EncodingError::Model {
                encoder: self.encoder.model_name().to_string(),
                reason: "non-finite component".to_string(),
            });
        }
        let mut out = raw;
        vector::normalize_in_place(&mut out);
        Ok(out)
    }

    /// Unit (or zero) sub-vector of a record.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if the encoder rejects the value or
    /// produces the wrong dimension.
    pub fn encode_record(&self, record: &ParsedRecord) -> Result<Vec<f32>, EncodingError> {
        let Some(binding) = self.binding_for(&record.schema) else {
            return Ok(vec![0.0; self.dimensions()]);
        };
        let main = record.value(&binding.field.name);
        let mut acc = if main.is_null() {
            vec![0.0; self.dimensions()]
        } else {
            self.checked(self.encoder.encode(main)?)?
        };
        if let Some(desc) = &binding.description {
            let text = record.value(&desc.name);
            if !text.is_null() {
                let d = self.checked(self.encoder.encode(text)?)?;
                vector::add_scaled(&mut acc, &d, 1.0);
            }
        }
        vector::normalize_in_place(&mut acc);
        Ok(acc)
    }

    /// Unit (or zero) sub-vector of a query value.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if the encoder rejects the value.
    pub fn encode_query(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        if value.is_null() {
            return Ok(vec![0.0; self.dimensions()]);
        }
        self.checked(self.encoder.encode(value)?)
    }

    fn field_names(&self) -> String {
        self.bindings
            .iter()
            .flat_map(|b| std::iter::once(&b.field).chain(b.description.as_ref()))
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Plain-language description of what the space encodes and how its
    /// weight is interpreted, for natural-language parameter extraction.
    #[must_use]
    pub fn annotation(&self) -> String {
        let fields = self.field_names();
        let model = self.model_name();
        match &self.kind {
            SpaceKind::Text => format!(
                "The space encodes text using {model} embeddings. Affected fields: {fields}. \
                 Negative weight would mean favoring records whose text is semantically dissimilar \
                 to the one present in the similar clause for this space. Zero weight means \
                 insensitivity, positive weights mean favoring similar text. Larger positive \
                 weights increase the effect on similarity compared to other spaces. \
                 Accepts str type input for a corresponding similar clause."
            ),
            SpaceKind::Number { min, max, mode, log_scale } => {
                let scale = if *log_scale { "logarithmic" } else { "linear" };
                let direction = match mode {
                    SpaceMode::Maximize => {
                        "Positive weights favor higher values, negative weights favor lower values."
                    }
                    SpaceMode::Minimize => {
                        "Positive weights favor lower values, negative weights favor higher values."
                    }
                    SpaceMode::Similarity => {
                        "Positive weights favor values close to the one in the similar clause, \
                         negative weights favor distant values."
                    }
                };
                format!(
                    "The space encodes numbers between {min} and {max} on a {scale} scale in \
                     {mode} mode. Affected fields: {fields}. {direction} Zero weight means \
                     insensitivity. Larger weights increase the effect compared to other spaces. \
                     Accepts float type input for a corresponding similar clause."
                )
            }
            SpaceKind::Recency { period, .. } => format!(
                "The space encodes how recent a record is within a window of {} days. \
                 Affected fields: {fields}. Positive weights favor newer records, negative \
                 weights favor older records, zero weight means insensitivity to age.",
                period.num_days()
            ),
            SpaceKind::Categorical { categories } => format!(
                "The space encodes category membership over [{}]; anything else is 'other'. \
                 Affected fields: {fields}. Positive weights favor records sharing the \
                 categories in the similar clause, negative weights favor records that do not. \
                 Zero weight means insensitivity. Accepts a category or list of categories.",
                categories.join(", ")
            ),
            SpaceKind::Image => format!(
                "The space encodes images using {model} embeddings. Affected fields: {fields}. \
                 Negative weight would mean favoring images with descriptions that are \
                 semantically dissimilar to the one present in the similar clause for this space. \
                 Zero weight means insensitivity, positive weights mean favoring images with \
                 similar descriptions. Larger positive weights increase the effect on similarity \
                 compared to other spaces. Accepts str type input describing an image."
            ),
            SpaceKind::Custom { mode } => format!(
                "The space encodes {fields} using {model} in {mode} mode. Positive weights favor \
                 records similar to the similar clause input, negative weights favor dissimilar \
                 records, zero weight means insensitivity."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::HashedTextEncoder;
    use crate::schema::Schema;
    use crate::vector::l2_norm;
    use serde_json::json;

    fn product() -> Schema {
        Schema::builder("product")
            .id("id")
            .field("description", FieldType::String)
            .field("rating", FieldType::Float)
            .field("image", FieldType::Blob)
            .build()
            .expect("valid schema")
    }

    fn user() -> Schema {
        Schema::builder("user")
            .id("id")
            .field("preference", FieldType::String)
            .field("caption", FieldType::String)
            .build()
            .expect("valid schema")
    }

    fn text_encoder() -> Arc<dyn Encoder> {
        Arc::new(HashedTextEncoder::new(32).with_blob_support())
    }

    #[test]
    fn text_space_spans_schemas() {
        let (p, u) = (product(), user());
        let space = Space::text(
            "desc",
            &[p.field("description").expect("f"), u.field("preference").expect("f")],
            text_encoder(),
        )
        .expect("valid space");
        assert!(space.covers("product"));
        assert!(space.covers("user"));
        assert_eq!(space.dimensions(), 32);
    }

    #[test]
    fn rejects_two_fields_of_one_schema() {
        let u = user();
        let err = Space::text(
            "t",
            &[u.field("preference").expect("f"), u.field("caption").expect("f")],
            text_encoder(),
        );
        assert!(matches!(err, Err(SpaceConfigError::DuplicateSchema { .. })));
    }

    #[test]
    fn rejects_wrong_field_type_and_empty_fields() {
        let p = product();
        let err = Space::text("t", &[p.field("rating").expect("f")], text_encoder());
        assert!(matches!(err, Err(SpaceConfigError::FieldType { .. })));
        let err = Space::text("t", &[], text_encoder());
        assert!(matches!(err, Err(SpaceConfigError::NoFields { .. })));
    }

    #[test]
    fn number_space_rejects_inverted_range() {
        let p = product();
        let err = Space::number(
            "rating",
            &[p.field("rating").expect("f")],
            NumberEncoder::new(5.0, 1.0, SpaceMode::Maximize),
        );
        assert!(matches!(err, Err(SpaceConfigError::InvalidRange { .. })));
        let err = Space::number(
            "rating",
            &[p.field("rating").expect("f")],
            NumberEncoder::new(1.0, 1.0, SpaceMode::Maximize),
        );
        assert!(matches!(err, Err(SpaceConfigError::InvalidRange { .. })));
    }

    #[test]
    fn unbound_schema_and_null_values_encode_to_zero() {
        let (p, u) = (product(), user());
        let space = Space::text("desc", &[p.field("description").expect("f")], text_encoder())
            .expect("valid space");
        let rec = u.parse(&json!({ "id": "u1", "preference": "hi" })).expect("valid");
        assert!(vector::is_zero(&space.encode_record(&rec).expect("encode")));
        let rec = p.parse(&json!({ "id": "p1" })).expect("valid");
        assert!(vector::is_zero(&space.encode_record(&rec).expect("encode")));
    }

    #[test]
    fn record_vectors_are_unit_length() {
        let p = product();
        let space = Space::text("desc", &[p.field("description").expect("f")], text_encoder())
            .expect("valid space");
        let rec = p
            .parse(&json!({ "id": "p1", "description": "budget toothbrush" }))
            .expect("valid");
        let v = space.encode_record(&rec).expect("encode");
        assert!((l2_norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn image_description_must_share_schema() {
        let (p, u) = (product(), user());
        let img = ImageField::new(p.field("image").expect("f"))
            .described_by(u.field("caption").expect("f"));
        let err = Space::image("img", &[img], text_encoder());
        assert!(matches!(err, Err(SpaceConfigError::SchemaMismatch { .. })));
    }

    #[test]
    fn image_blends_blob_and_description() {
        let p = product();
        let img = ImageField::new(p.field("image").expect("f"))
            .described_by(p.field("description").expect("f"));
        let space = Space::image("img", &[img], text_encoder()).expect("valid space");
        let only_blob = p.parse(&json!({ "id": "a", "image": "cat.png" })).expect("valid");
        let both = p
            .parse(&json!({ "id": "b", "image": "cat.png", "description": "a sleeping cat" }))
            .expect("valid");
        let v1 = space.encode_record(&only_blob).expect("encode");
        let v2 = space.encode_record(&both).expect("encode");
        assert_ne!(v1, v2);
        assert!((l2_norm(&v2) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        struct Liar;
        impl Encoder for Liar {
            fn encode(&self, _: &FieldValue) -> Result<Vec<f32>, EncodingError> {
                Ok(vec![1.0; 3])
            }
            fn dimensions(&self) -> usize {
                4
            }
            fn model_name(&self) -> &str {
                "liar"
            }
        }
        let p = product();
        let space = Space::custom(
            "c",
            &[p.field("description").expect("f")],
            Arc::new(Liar),
            SpaceMode::Similarity,
        )
        .expect("valid space");
        let rec = p.parse(&json!({ "id": "p", "description": "x" })).expect("valid");
        assert!(matches!(space.encode_record(&rec), Err(EncodingError::Dimension { .. })));
    }

    #[test]
    fn recency_space_prefers_newer() {
        let anchor = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let s = Schema::builder("post")
            .id("id")
            .field("at", FieldType::Timestamp)
            .build()
            .expect("valid schema");
        let space = Space::recency("fresh", &[s.field("at").expect("f")], Duration::days(30), anchor)
            .expect("valid space");
        assert_eq!(space.mode(), SpaceMode::Maximize);
        assert!(space.preference_vector().is_some());
        assert!(Space::recency("bad", &[s.field("at").expect("f")], Duration::zero(), anchor).is_err());
    }

    #[test]
    fn annotations_describe_weights() {
        let p = product();
        let space = Space::number(
            "rating",
            &[p.field("rating").expect("f")],
            NumberEncoder::new(1.0, 5.0, SpaceMode::Maximize),
        )
        .expect("valid space");
        let a = space.annotation();
        assert!(a.contains("product.rating"));
        assert!(a.contains("favor higher values"));
    }

    #[test]
    fn cached_space_keeps_dimensions() {
        let p = product();
        let space = Space::text("desc", &[p.field("description").expect("f")], text_encoder())
            .expect("valid space")
            .cached(8);
        assert_eq!(space.dimensions(), 32);
        assert_eq!(space.model_name(), "hashed-text");
    }
}
