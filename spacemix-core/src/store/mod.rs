//! Vector store collaborator interface.
//!
//! The core only relies on read-your-writes for a single store handle and on
//! deterministic ordering: descending score, ties broken by ascending record
//! id. Two adapters ship with the crate: [`InMemoryVectorStore`] and the
//! durable [`SqliteVectorStore`].

mod memory;
mod sqlite;

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use std::cmp::Reverse;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreError};
use crate::event::EventKey;
use crate::filter::Predicate;
use crate::index::IndexLayout;
use crate::types::RecordId;
use crate::vector;

/// A stored record: composite vector plus filterable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPoint {
    /// Record identifier.
    pub id: RecordId,
    /// Composite vector.
    pub vector: Vec<f32>,
    /// Non-embedded fields, including the reserved schema key.
    pub payload: Map<String, Value>,
}

/// Adaptation state of a record, saved next to its point so event history
/// survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Schema the record belongs to.
    pub schema: String,
    /// Unweighted base sub-vectors, one per space.
    pub base: Vec<Vec<f32>>,
    /// Accumulated event influence per space.
    pub event_sum: Vec<Vec<f32>>,
    /// Accumulated decayed event weight per space.
    pub event_weight: Vec<f64>,
    /// Keys of the events already applied.
    pub applied: Vec<EventKey>,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    /// Record identifier.
    pub id: RecordId,
    /// Inner product with the query vector.
    pub score: f32,
    /// Stored vector, used for per-space score breakdowns.
    pub vector: Vec<f32>,
    /// Stored payload.
    pub payload: Map<String, Value>,
}

/// Backend-agnostic vector store.
pub trait VectorStore: Send + Sync {
    /// Register the index layout, or check it against the registered one.
    ///
    /// With `override_existing` a different layout replaces the old one and
    /// drops every stored vector.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SpaceConfigError::LayoutMismatch`] when the
    /// layouts differ and overriding is off, or a store error on I/O failure.
    fn ensure_index(&self, layout: &IndexLayout, override_existing: bool) -> Result<()>;

    /// Insert or replace a point. Idempotent for the same id and vector.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Dimension`] on a layout mismatch or a backend error.
    fn upsert(&self, point: StoredPoint) -> std::result::Result<(), StoreError>;

    /// Insert or replace a point together with the state that produced it.
    ///
    /// The default writes the point only; such stores lose event history on
    /// restart and reload records from their stored vectors.
    ///
    /// # Errors
    ///
    /// See [`VectorStore::upsert`].
    fn upsert_record(&self, point: StoredPoint, _snapshot: &RecordSnapshot) -> std::result::Result<(), StoreError> {
        self.upsert(point)
    }

    /// State saved by [`VectorStore::upsert_record`].
    ///
    /// # Errors
    ///
    /// Returns a backend error on I/O failure or corruption.
    fn load_snapshot(&self, _id: &RecordId) -> std::result::Result<Option<RecordSnapshot>, StoreError> {
        Ok(None)
    }

    /// Fetch a point.
    ///
    /// # Errors
    ///
    /// Returns a backend error on I/O failure or corruption.
    fn get(&self, id: &RecordId) -> std::result::Result<Option<StoredPoint>, StoreError>;

    /// Top-`limit` points by inner product among those matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a backend error on I/O failure or corruption.
    fn search(
        &self,
        query: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError>;

    /// Number of stored points.
    ///
    /// # Errors
    ///
    /// Returns a backend error on I/O failure.
    fn len(&self) -> std::result::Result<usize, StoreError>;

    /// Whether the store holds no points.
    ///
    /// # Errors
    ///
    /// Returns a backend error on I/O failure.
    fn is_empty(&self) -> std::result::Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Score `point` against `query` if it passes `filter`.
pub(crate) fn score_point(
    point: &StoredPoint,
    query: &[f32],
    filter: Option<&Predicate>,
) -> Option<ScoredPoint> {
    if filter.is_some_and(|f| !f.matches(&point.payload)) {
        return None;
    }
    Some(ScoredPoint {
        id: point.id.clone(),
        score: vector::dot(&point.vector, query),
        vector: point.vector.clone(),
        payload: point.payload.clone(),
    })
}

/// Sort by descending score then ascending id, and keep `limit` hits.
pub(crate) fn rank(mut hits: Vec<ScoredPoint>, limit: usize) -> Vec<ScoredPoint> {
    hits.sort_by(|a, b| {
        Reverse(OrderedFloat(a.score))
            .cmp(&Reverse(OrderedFloat(b.score)))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}

pub(crate) fn check_dimension(expected: Option<usize>, actual: usize) -> std::result::Result<(), StoreError> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::Dimension { expected, actual }),
        _ => Ok(()),
    }
}

/// Open the store selected by configuration.
///
/// # Errors
///
/// Returns a store error if the SQLite database cannot be opened.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory vector store");
            Ok(Arc::new(InMemoryVectorStore::new()))
        }
        StoreBackend::Sqlite => Ok(Arc::new(SqliteVectorStore::open(&config.path, config.wal_mode)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> ScoredPoint {
        ScoredPoint {
            id: RecordId::from(id),
            score,
            vector: Vec::new(),
            payload: Map::new(),
        }
    }

    #[test]
    fn rank_orders_by_score_then_id() {
        let ranked = rank(vec![hit("b", 0.5), hit("c", 0.9), hit("a", 0.5)], 10);
        let ids: Vec<_> = ranked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn rank_truncates() {
        let ranked = rank(vec![hit("a", 0.1), hit("b", 0.2), hit("c", 0.3)], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id.as_str(), "c");
    }

    #[test]
    fn dimension_check() {
        assert!(check_dimension(None, 3).is_ok());
        assert!(check_dimension(Some(3), 3).is_ok());
        assert!(matches!(check_dimension(Some(4), 3), Err(StoreError::Dimension { .. })));
    }

    #[test]
    fn factory_opens_memory_store() {
        let store = open_store(&StoreConfig::default()).expect("memory store");
        assert!(store.is_empty().expect("len"));
    }
}
