//! Encoder abstraction layer.
//!
//! An [`Encoder`] turns a typed field value into a fixed-dimension vector.
//! Spaces own one encoder each and only depend on this trait plus the
//! declared output dimension.
//!
//! The text model used in production is the ONNX `all-MiniLM-L6-v2`
//! (behind the `onnx` feature). [`HashedTextEncoder`] is a deterministic,
//! model-free stand-in for tests and small deployments.

use std::collections::HashMap;
use std::f64::consts::FRAC_PI_2;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::EncodingError;
use crate::types::{FieldValue, SpaceMode};
use crate::vector;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Map a typed value to a vector of `dimensions()` floats.
///
/// Implementations must be `Send + Sync`; spaces are shared across ingestion
/// threads and async query tasks.
pub trait Encoder: Send + Sync {
    /// Encode a single value.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::UnsupportedValue`] for value kinds the encoder
    /// does not accept, or [`EncodingError::Model`] if the model fails.
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError>;

    /// Encode a batch of values.
    ///
    /// Default implementation calls `encode` in a loop.
    ///
    /// # Errors
    ///
    /// Returns an error if any value in the batch fails.
    fn encode_batch(&self, values: &[FieldValue]) -> Result<Vec<Vec<f32>>, EncodingError> {
        values.iter().map(|v| self.encode(v)).collect()
    }

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Human-readable model name (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
}

impl<E: Encoder + ?Sized> Encoder for Arc<E> {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        (**self).encode(value)
    }

    fn encode_batch(&self, values: &[FieldValue]) -> Result<Vec<Vec<f32>>, EncodingError> {
        (**self).encode_batch(values)
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

fn unsupported(encoder: &str, value: &FieldValue) -> EncodingError {
    EncodingError::UnsupportedValue {
        encoder: encoder.to_string(),
        value_kind: value.kind().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Hashed text encoder
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Deterministic feature-hashing text encoder.
///
/// Each lowercase word contributes weight 1.0 and each character trigram of
/// the padded word contributes 0.5 to a signed hash bucket. Trigrams let
/// inflections ("toothbrush" / "toothbrushes") share most of their mass.
#[derive(Debug, Clone)]
pub struct HashedTextEncoder {
    dims: usize,
    accept_blobs: bool,
}

impl HashedTextEncoder {
    /// Create an encoder with `dimensions` buckets (at least 1).
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dims: dimensions.max(1),
            accept_blobs: false,
        }
    }

    /// Also accept blob references, hashing the reference text.
    ///
    /// Gives image spaces a shared text/blob space in tests.
    #[must_use]
    pub fn with_blob_support(mut self) -> Self {
        self.accept_blobs = true;
        self
    }

    fn add_feature(&self, out: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign * weight;
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0_f32; self.dims];
        let lowered = text.to_lowercase();
        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut out, word, 1.0);
            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for tri in padded.windows(3) {
                let gram: String = tri.iter().collect();
                self.add_feature(&mut out, &gram, 0.5);
            }
        }
        vector::normalize_in_place(&mut out);
        out
    }
}

impl Default for HashedTextEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Encoder for HashedTextEncoder {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        match value {
            FieldValue::Str(s) => Ok(self.embed_text(s)),
            FieldValue::Categories(c) => Ok(self.embed_text(&c.join(" "))),
            FieldValue::Blob(b) if self.accept_blobs => Ok(self.embed_text(b)),
            FieldValue::Null => Ok(vec![0.0; self.dims]),
            other => Err(unsupported(self.model_name(), other)),
        }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "hashed-text"
    }
}

// ---------------------------------------------------------------------------
// Number encoder
// ---------------------------------------------------------------------------

/// Angular 2-d encoding of a bounded scalar.
///
/// The normalized scalar `x ∈ [0, 1]` maps to `[cos(xπ/2), sin(xπ/2)]`, so the
/// cosine against the MAXIMIZE preference `[0, 1]` is `sin(xπ/2)`, strictly
/// increasing in `x`, and against the MINIMIZE preference `[1, 0]` it is
/// `cos(xπ/2)`, strictly decreasing. Out-of-range values clamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberEncoder {
    min: f64,
    max: f64,
    mode: SpaceMode,
    log_scale: bool,
}

impl NumberEncoder {
    /// Create an encoder over `[min, max]`. Range validity is checked by the
    /// owning space.
    #[must_use]
    pub fn new(min: f64, max: f64, mode: SpaceMode) -> Self {
        Self {
            min,
            max,
            mode,
            log_scale: false,
        }
    }

    /// Normalize on `ln(1 + v - min)` instead of linearly.
    #[must_use]
    pub fn log_scale(mut self) -> Self {
        self.log_scale = true;
        self
    }

    /// Lower bound.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Comparison mode.
    #[must_use]
    pub fn mode(&self) -> SpaceMode {
        self.mode
    }

    /// Whether log scaling is on.
    #[must_use]
    pub fn is_log_scale(&self) -> bool {
        self.log_scale
    }

    /// Clamp and normalize `v` to `[0, 1]`.
    #[must_use]
    pub fn normalize_scalar(&self, v: f64) -> f64 {
        let clamped = v.clamp(self.min, self.max);
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        if self.log_scale {
            (clamped - self.min).ln_1p() / span.ln_1p()
        } else {
            (clamped - self.min) / span
        }
    }

    /// The unit vector for a normalized scalar.
    #[must_use]
    pub fn angular(x: f64) -> Vec<f32> {
        let theta = x.clamp(0.0, 1.0) * FRAC_PI_2;
        vec![theta.cos() as f32, theta.sin() as f32]
    }

    /// Preference direction for ordered modes; `None` in similarity mode.
    #[must_use]
    pub fn preference_vector(&self) -> Option<Vec<f32>> {
        preference_for(self.mode)
    }
}

pub(crate) fn preference_for(mode: SpaceMode) -> Option<Vec<f32>> {
    match mode {
        SpaceMode::Maximize => Some(vec![0.0, 1.0]),
        SpaceMode::Minimize => Some(vec![1.0, 0.0]),
        SpaceMode::Similarity => None,
    }
}

impl Encoder for NumberEncoder {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        match value {
            FieldValue::Int(_) | FieldValue::Float(_) => {
                let v = value.as_f64().unwrap_or(self.min);
                if !v.is_finite() {
                    return Err(unsupported(self.model_name(), value));
                }
                Ok(Self::angular(self.normalize_scalar(v)))
            }
            FieldValue::Null => Ok(vec![0.0; 2]),
            other => Err(unsupported(self.model_name(), other)),
        }
    }

    fn dimensions(&self) -> usize {
        2
    }

    fn model_name(&self) -> &str {
        "number"
    }
}

// ---------------------------------------------------------------------------
// Recency encoder
// ---------------------------------------------------------------------------

/// Encodes how recent a timestamp is relative to a fixed anchor.
///
/// Timestamps map linearly onto `[0, 1]` over `[anchor - period, anchor]`
/// (clamped) and are then encoded like a MAXIMIZE number. The anchor never
/// moves, so stored vectors stay comparable for the life of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct RecencyEncoder {
    anchor: DateTime<Utc>,
    period: Duration,
}

impl RecencyEncoder {
    /// Create an encoder anchored at `anchor` covering `period`.
    #[must_use]
    pub fn new(anchor: DateTime<Utc>, period: Duration) -> Self {
        Self { anchor, period }
    }

    /// Fixed anchor time.
    #[must_use]
    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    /// Window length.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Recency score in `[0, 1]`; `1.0` at or after the anchor.
    #[must_use]
    pub fn recency(&self, t: DateTime<Utc>) -> f64 {
        let period = self.period.num_milliseconds() as f64;
        if period <= 0.0 {
            return if t >= self.anchor { 1.0 } else { 0.0 };
        }
        let age = (self.anchor - t).num_milliseconds() as f64;
        (1.0 - age / period).clamp(0.0, 1.0)
    }
}

impl Encoder for RecencyEncoder {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        match value {
            FieldValue::Timestamp(t) => Ok(NumberEncoder::angular(self.recency(*t))),
            FieldValue::Int(secs) => DateTime::from_timestamp(*secs, 0)
                .map(|t| NumberEncoder::angular(self.recency(t)))
                .ok_or_else(|| unsupported(self.model_name(), value)),
            FieldValue::Null => Ok(vec![0.0; 2]),
            other => Err(unsupported(self.model_name(), other)),
        }
    }

    fn dimensions(&self) -> usize {
        2
    }

    fn model_name(&self) -> &str {
        "recency"
    }
}

// ---------------------------------------------------------------------------
// Categorical encoder
// ---------------------------------------------------------------------------

/// Multi-hot encoding over a declared category list plus one "other" slot.
#[derive(Debug, Clone)]
pub struct CategoricalEncoder {
    categories: Vec<String>,
    slots: HashMap<String, usize>,
}

impl CategoricalEncoder {
    /// Create an encoder for `categories` (duplicates collapse).
    #[must_use]
    pub fn new<S: AsRef<str>>(categories: &[S]) -> Self {
        let mut slots = HashMap::new();
        let mut ordered = Vec::new();
        for c in categories {
            let c = c.as_ref().to_string();
            if !slots.contains_key(&c) {
                slots.insert(c.clone(), ordered.len());
                ordered.push(c);
            }
        }
        Self {
            categories: ordered,
            slots,
        }
    }

    /// Declared categories in slot order.
    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    fn slot(&self, label: &str) -> usize {
        self.slots.get(label).copied().unwrap_or(self.categories.len())
    }
}

impl Encoder for CategoricalEncoder {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        let mut out = vec![0.0_f32; self.dimensions()];
        match value {
            FieldValue::Str(s) => out[self.slot(s)] = 1.0,
            FieldValue::Categories(labels) => {
                for l in labels {
                    out[self.slot(l)] = 1.0;
                }
            }
            FieldValue::Null => {}
            other => return Err(unsupported(self.model_name(), other)),
        }
        vector::normalize_in_place(&mut out);
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.categories.len() + 1
    }

    fn model_name(&self) -> &str {
        "categorical"
    }
}

// ---------------------------------------------------------------------------
// LRU-cached wrapper
// ---------------------------------------------------------------------------

/// Caches the output of an expensive encoder, keyed by the serialized value.
pub struct CachedEncoder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Encoder> CachedEncoder<E> {
    /// Wrap `inner` with room for `capacity` entries (at least 1).
    #[must_use]
    pub fn new(inner: E, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<E: Encoder> Encoder for CachedEncoder<E> {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        let Ok(key) = serde_json::to_string(value) else {
            return self.inner.encode(value);
        };
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }
        let out = self.inner.encode(value)?;
        self.cache.lock().put(key, out.clone());
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

// ---------------------------------------------------------------------------
// ONNX provider
// ---------------------------------------------------------------------------

/// Sentence-embedding encoder backed by `fastembed` (`all-MiniLM-L6-v2`, 384-d).
#[cfg(feature = "onnx")]
pub struct OnnxTextEncoder {
    model: fastembed::TextEmbedding,
    dims: usize,
}

#[cfg(feature = "onnx")]
impl OnnxTextEncoder {
    /// Load the model, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::Model`] if the model cannot be loaded.
    pub fn new() -> Result<Self, EncodingError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
        let model = TextEmbedding::try_new(InitOptions::new(EmbeddingModel::AllMiniLML6V2))
            .map_err(|e| EncodingError::Model {
                encoder: "all-MiniLM-L6-v2".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { model, dims: 384 })
    }

    fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EncodingError> {
        self.model.embed(texts, None).map_err(|e| EncodingError::Model {
            encoder: self.model_name().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(feature = "onnx")]
impl Encoder for OnnxTextEncoder {
    fn encode(&self, value: &FieldValue) -> Result<Vec<f32>, EncodingError> {
        let text = match value {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Categories(c) => c.join(" "),
            FieldValue::Null => return Ok(vec![0.0; self.dims]),
            other => return Err(unsupported(self.model_name(), other)),
        };
        self.embed_texts(vec![text])?
            .pop()
            .ok_or_else(|| EncodingError::Model {
                encoder: self.model_name().to_string(),
                reason: "empty embedding batch".to_string(),
            })
    }

    fn encode_batch(&self, values: &[FieldValue]) -> Result<Vec<Vec<f32>>, EncodingError> {
        if values.iter().any(|v| !matches!(v, FieldValue::Str(_))) {
            return values.iter().map(|v| self.encode(v)).collect();
        }
        let texts = values
            .iter()
            .filter_map(|v| match v {
                FieldValue::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        self.embed_texts(texts)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
