//! In-process vector store with exact search.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{check_dimension, rank, score_point, RecordSnapshot, ScoredPoint, StoredPoint, VectorStore};
use crate::error::{Result, SpaceConfigError, StoreError};
use crate::filter::Predicate;
use crate::index::IndexLayout;
use crate::types::RecordId;

/// Exact-scan store guarded by a reader/writer lock.
///
/// Searches take the read lock, so concurrent queries never block each other.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    layout: RwLock<Option<IndexLayout>>,
    points: RwLock<BTreeMap<RecordId, StoredPoint>>,
    snapshots: RwLock<BTreeMap<RecordId, RecordSnapshot>>,
}

impl InMemoryVectorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn dimensions(&self) -> Option<usize> {
        self.layout.read().as_ref().map(IndexLayout::dimensions)
    }
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_index(&self, layout: &IndexLayout, override_existing: bool) -> Result<()> {
        let mut current = self.layout.write();
        if let Some(existing) = current.as_ref() {
            if existing == layout {
                return Ok(());
            }
            if !override_existing {
                return Err(SpaceConfigError::LayoutMismatch {
                    index: layout.name.clone(),
                    stored: existing.fingerprint(),
                    declared: layout.fingerprint(),
                }
                .into());
            }
            warn!(
                index = %layout.name,
                stored = %existing.fingerprint(),
                declared = %layout.fingerprint(),
                "Index layout changed, dropping stored vectors"
            );
            self.points.write().clear();
            self.snapshots.write().clear();
        }
        *current = Some(layout.clone());
        Ok(())
    }

    fn upsert(&self, point: StoredPoint) -> std::result::Result<(), StoreError> {
        check_dimension(self.dimensions(), point.vector.len())?;
        self.points.write().insert(point.id.clone(), point);
        Ok(())
    }

    fn upsert_record(&self, point: StoredPoint, snapshot: &RecordSnapshot) -> std::result::Result<(), StoreError> {
        check_dimension(self.dimensions(), point.vector.len())?;
        let mut points = self.points.write();
        self.snapshots.write().insert(point.id.clone(), snapshot.clone());
        points.insert(point.id.clone(), point);
        Ok(())
    }

    fn get(&self, id: &RecordId) -> std::result::Result<Option<StoredPoint>, StoreError> {
        Ok(self.points.read().get(id).cloned())
    }

    fn load_snapshot(&self, id: &RecordId) -> std::result::Result<Option<RecordSnapshot>, StoreError> {
        Ok(self.snapshots.read().get(id).cloned())
    }

    fn search(
        &self,
        query: &[f32],
        filter: Option<&Predicate>,
        limit: usize,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
        check_dimension(self.dimensions(), query.len())?;
        let points = self.points.read();
        let hits: Vec<ScoredPoint> = points
            .values()
            .filter_map(|p| score_point(p, query, filter))
            .collect();
        debug!(scanned = points.len(), matched = hits.len(), "In-memory search");
        Ok(rank(hits, limit))
    }

    fn len(&self) -> std::result::Result<usize, StoreError> {
        Ok(self.points.read().len())
    }
}
