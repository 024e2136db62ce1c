//! Record arena.
//!
//! Every ingested record owns one slot addressed by [`RecordId`]. A slot holds
//! the record's unweighted base sub-vectors (one per index space), the
//! accumulated event influence per space, the store payload and the keys of
//! events already applied. Slots are individually locked, so updates to one
//! record never block readers or writers of another.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{SchemaError, StoreError};
use crate::event::EventKey;
use crate::schema::SCHEMA_KEY;
use crate::store::{RecordSnapshot, StoredPoint, VectorStore};
use crate::types::RecordId;
use crate::vector;

/// Mutable state of one record.
#[derive(Debug, Clone)]
pub struct RecordState {
    schema: String,
    base: Vec<Vec<f32>>,
    event_sum: Vec<Vec<f32>>,
    event_weight: Vec<f64>,
    payload: Map<String, Value>,
    applied: HashSet<EventKey>,
}

impl RecordState {
    pub(crate) fn vacant(schema: &str, dims: &[usize]) -> Self {
        Self {
            schema: schema.to_string(),
            base: Vec::new(),
            event_sum: dims.iter().map(|&d| vec![0.0; d]).collect(),
            event_weight: vec![0.0; dims.len()],
            payload: Map::new(),
            applied: HashSet::new(),
        }
    }

    /// Rebuild from a persisted snapshot. `None` if the snapshot does not fit
    /// the current space dimensions.
    pub(crate) fn restore(snapshot: RecordSnapshot, payload: Map<String, Value>, dims: &[usize]) -> Option<Self> {
        let fits = |vs: &[Vec<f32>]| vs.len() == dims.len() && vs.iter().zip(dims).all(|(v, &d)| v.len() == d);
        if !fits(&snapshot.base) || !fits(&snapshot.event_sum) || snapshot.event_weight.len() != dims.len() {
            return None;
        }
        Some(Self {
            schema: snapshot.schema,
            base: snapshot.base,
            event_sum: snapshot.event_sum,
            event_weight: snapshot.event_weight,
            payload,
            applied: snapshot.applied.into_iter().collect(),
        })
    }

    /// Rebuild from a stored point alone: its sub-vectors become the base and
    /// the event history starts empty.
    pub(crate) fn from_point(point: StoredPoint, dims: &[usize]) -> Option<Self> {
        if point.vector.len() != dims.iter().sum::<usize>() {
            return None;
        }
        let schema = point.payload.get(SCHEMA_KEY).and_then(Value::as_str).unwrap_or_default();
        let mut state = Self::vacant(schema, dims);
        let mut offset = 0;
        for &d in dims {
            state.base.push(point.vector[offset..offset + d].to_vec());
            offset += d;
        }
        state.payload = point.payload;
        Some(state)
    }

    /// Persistable form of everything but the payload.
    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            schema: self.schema.clone(),
            base: self.base.clone(),
            event_sum: self.event_sum.clone(),
            event_weight: self.event_weight.clone(),
            applied: self.applied.iter().cloned().collect(),
        }
    }

    /// Whether the record has been ingested at least once.
    #[must_use]
    pub fn is_ingested(&self) -> bool {
        !self.base.is_empty()
    }

    /// Schema the record belongs to.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Store payload.
    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Unweighted base sub-vector of the space at `position`.
    #[must_use]
    pub fn base(&self, position: usize) -> &[f32] {
        self.base.get(position).map_or(&[], Vec::as_slice)
    }

    /// Total decayed event weight absorbed by the space at `position`.
    #[must_use]
    pub fn event_weight(&self, position: usize) -> f64 {
        self.event_weight.get(position).copied().unwrap_or(0.0)
    }

    /// Number of distinct events applied to this record.
    #[must_use]
    pub fn events_applied(&self) -> usize {
        self.applied.len()
    }

    pub(crate) fn has_applied(&self, key: &EventKey) -> bool {
        self.applied.contains(key)
    }

    pub(crate) fn mark_applied(&mut self, key: EventKey) {
        self.applied.insert(key);
    }

    pub(crate) fn forget(&mut self, key: &EventKey) {
        self.applied.remove(key);
    }

    /// Bind the slot to `schema`. An ingested record keeps its schema for life.
    pub(crate) fn claim(&mut self, id: &RecordId, schema: &str) -> Result<(), SchemaError> {
        if self.is_ingested() && self.schema != schema {
            return Err(SchemaError::IdentityConflict {
                id: id.clone(),
                existing: self.schema.clone(),
                attempted: schema.to_string(),
            });
        }
        self.schema = schema.to_string();
        Ok(())
    }

    /// Replace base vectors and payload, keeping event history. Returns the
    /// previous pair for rollback.
    pub(crate) fn rebase(
        &mut self,
        base: Vec<Vec<f32>>,
        payload: Map<String, Value>,
    ) -> (Vec<Vec<f32>>, Map<String, Value>) {
        (
            std::mem::replace(&mut self.base, base),
            std::mem::replace(&mut self.payload, payload),
        )
    }

    pub(crate) fn restore_base(&mut self, previous: (Vec<Vec<f32>>, Map<String, Value>)) {
        self.base = previous.0;
        self.payload = previous.1;
    }

    /// Add `weight · influence` to the accumulator of `position`.
    pub(crate) fn absorb(&mut self, position: usize, influence: &[f32], weight: f64) {
        if let Some(sum) = self.event_sum.get_mut(position) {
            if sum.len() == influence.len() {
                vector::add_scaled(sum, influence, weight as f32);
            }
        }
        if let Some(w) = self.event_weight.get_mut(position) {
            *w += weight;
        }
    }

    pub(crate) fn snapshot_slots(&self, positions: &[usize]) -> Vec<(usize, Vec<f32>, f64)> {
        positions
            .iter()
            .filter_map(|&p| {
                let sum = self.event_sum.get(p)?;
                Some((p, sum.clone(), self.event_weight(p)))
            })
            .collect()
    }

    pub(crate) fn restore_slots(&mut self, saved: Vec<(usize, Vec<f32>, f64)>) {
        for (p, sum, weight) in saved {
            if let Some(slot) = self.event_sum.get_mut(p) {
                *slot = sum;
            }
            if let Some(w) = self.event_weight.get_mut(p) {
                *w = weight;
            }
        }
    }

    /// Stored sub-vector of the space at `position`:
    /// `normalize(base_weight · base + event_sum)`, or the base itself when no
    /// event has touched the space.
    #[must_use]
    pub fn subvector(&self, position: usize, base_weight: f64) -> Vec<f32> {
        let base = self.base(position);
        if self.event_weight(position) == 0.0 {
            return base.to_vec();
        }
        let mut out: Vec<f32> = base.iter().map(|x| x * base_weight as f32).collect();
        if let Some(sum) = self.event_sum.get(position) {
            if sum.len() == out.len() {
                vector::add_scaled(&mut out, sum, 1.0);
            }
        }
        vector::normalize_in_place(&mut out);
        out
    }

    /// Composite stored vector.
    #[must_use]
    pub fn composite(&self, base_weight: f64) -> Vec<f32> {
        (0..self.base.len())
            .flat_map(|p| self.subvector(p, base_weight))
            .collect()
    }

    pub(crate) fn point(&self, id: &RecordId, base_weight: f64) -> StoredPoint {
        StoredPoint {
            id: id.clone(),
            vector: self.composite(base_weight),
            payload: self.payload.clone(),
        }
    }
}

/// Concurrent map of record slots.
#[derive(Debug, Default)]
pub struct RecordArena {
    records: DashMap<RecordId, Arc<Mutex<RecordState>>>,
}

impl RecordArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `id`, created vacant if absent.
    pub(crate) fn slot(&self, id: &RecordId, schema: &str, dims: &[usize]) -> Arc<Mutex<RecordState>> {
        self.records
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RecordState::vacant(schema, dims))))
            .value()
            .clone()
    }

    /// Slot for `id`, rebuilt from `store` when this arena has not seen the
    /// record yet (for instance after a restart). `None` if neither holds it.
    ///
    /// The persisted snapshot is preferred; stores without one fall back to
    /// the stored vector with an empty event history.
    pub(crate) fn load(
        &self,
        id: &RecordId,
        store: &dyn VectorStore,
        dims: &[usize],
    ) -> Result<Option<Arc<Mutex<RecordState>>>, StoreError> {
        if let Some(slot) = self.get(id) {
            return Ok(Some(slot));
        }
        let Some(point) = store.get(id)? else {
            return Ok(None);
        };
        let restored = match store.load_snapshot(id)? {
            Some(snapshot) => RecordState::restore(snapshot, point.payload.clone(), dims),
            None => None,
        };
        let from_snapshot = restored.is_some();
        let Some(state) = restored.or_else(|| RecordState::from_point(point, dims)) else {
            warn!(record = %id, "Stored vector does not match the index layout");
            return Ok(None);
        };
        debug!(record = %id, from_snapshot, "Record loaded from store");
        Ok(Some(
            self.records
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(state)))
                .value()
                .clone(),
        ))
    }

    /// Existing slot for `id`. The map guard is released before returning.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Arc<Mutex<RecordState>>> {
        self.records.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` has been ingested.
    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some_and(|slot| slot.lock().is_ingested())
    }

    /// Number of slots, including vacant ones left by failed writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the arena has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingested() -> RecordState {
        let mut s = RecordState::vacant("product", &[2, 2]);
        s.rebase(vec![vec![1.0, 0.0], vec![0.0, 1.0]], Map::new());
        s
    }

    #[test]
    fn vacant_until_rebased() {
        let s = RecordState::vacant("product", &[2]);
        assert!(!s.is_ingested());
        assert!(ingested().is_ingested());
    }

    #[test]
    fn composite_without_events_is_base() {
        let s = ingested();
        assert_eq!(s.composite(1.0), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn absorb_blends_and_normalizes() {
        let mut s = ingested();
        s.absorb(0, &[0.0, 1.0], 1.0);
        let v = s.subvector(0, 1.0);
        let h = std::f32::consts::FRAC_1_SQRT_2;
        assert!((v[0] - h).abs() < 1e-6 && (v[1] - h).abs() < 1e-6);
        assert_eq!(s.subvector(1, 1.0), vec![0.0, 1.0]);
    }

    #[test]
    fn rollback_restores_slots() {
        let mut s = ingested();
        let saved = s.snapshot_slots(&[0]);
        s.absorb(0, &[0.0, 1.0], 2.0);
        s.restore_slots(saved);
        assert_eq!(s.event_weight(0), 0.0);
        assert_eq!(s.subvector(0, 1.0), vec![1.0, 0.0]);
    }

    #[test]
    fn schema_is_fixed_after_ingestion() {
        let id = RecordId::from("r1");
        let mut s = ingested();
        assert!(s.claim(&id, "product").is_ok());
        assert!(matches!(s.claim(&id, "user"), Err(SchemaError::IdentityConflict { .. })));

        let mut fresh = RecordState::vacant("product", &[2]);
        assert!(fresh.claim(&id, "user").is_ok());
        assert_eq!(fresh.schema(), "user");
    }

    #[test]
    fn arena_slots_are_shared() {
        let arena = RecordArena::new();
        let id = RecordId::from("a");
        let first = arena.slot(&id, "product", &[2]);
        first.lock().rebase(vec![vec![1.0, 0.0]], Map::new());
        let again = arena.slot(&id, "product", &[2]);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(arena.contains(&id));
        assert!(!arena.contains(&RecordId::from("b")));
        assert_eq!(arena.len(), 1);
    }
}
