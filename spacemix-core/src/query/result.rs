//! Query results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::index::SpaceScore;
use crate::types::RecordId;

/// Effective weight of one space in a resolved query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceWeight {
    /// Space name.
    pub space: String,
    /// Weight applied on the query side.
    pub weight: f64,
}

/// One ranked record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Record identifier.
    pub id: RecordId,
    /// Inner product with the query vector.
    pub score: f32,
    /// Stored payload.
    pub payload: Map<String, Value>,
    /// Per-space contributions; they sum to `score`.
    pub breakdown: Vec<SpaceScore>,
}

/// Ranked records plus everything needed to explain them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Records by descending score, ties by ascending id.
    pub entries: Vec<ResultEntry>,
    /// Value bound to every param.
    pub resolved_params: BTreeMap<String, Value>,
    /// Effective per-space weights.
    pub space_weights: Vec<SpaceWeight>,
}

impl QueryResult {
    /// Ranked ids.
    #[must_use]
    pub fn ids(&self) -> Vec<&RecordId> {
        self.entries.iter().map(|e| &e.id).collect()
    }

    /// Number of records returned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
