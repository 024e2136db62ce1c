//! Event effect engine.
//!
//! An event `(source, target, type, weight, timestamp)` pulls the target's
//! sub-vectors in the spaces its effect declares toward the source's base
//! sub-vectors. Per (record, space) the arena keeps
//!
//! ```text
//! event_sum    = Σ w_e · source_base
//! event_weight = Σ w_e          with w_e = weight · multiplier · decay(t_e)
//! stored       = normalize(base_weight · base + event_sum)
//! ```
//!
//! Sums commute, so any application order yields the same vector. Influence
//! is always the source's *base* vector, never its event-adapted one, which
//! keeps cycles in the influence graph from feeding back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::EventsConfig;
use crate::decay::DecayModel;
use crate::error::{EventError, Result, SpacemixError};
use crate::index::Index;
use crate::record::RecordArena;
use crate::store::VectorStore;
use crate::types::RecordId;

/// A directed, weighted interaction between two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Record whose vector exerts influence.
    pub source: RecordId,
    /// Record whose vector is adapted.
    pub target: RecordId,
    /// Event type, matched against the index's declared effects.
    pub event_type: String,
    /// Non-negative strength.
    pub weight: f64,
    /// When the interaction happened.
    pub timestamp: DateTime<Utc>,
    /// Restrict the effect to a subset of its spaces.
    #[serde(default)]
    pub spaces: Option<Vec<String>>,
}

impl Event {
    /// Event of weight 1 over every space of its effect.
    #[must_use]
    pub fn new(
        source: impl Into<RecordId>,
        target: impl Into<RecordId>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            event_type: event_type.into(),
            weight: 1.0,
            timestamp,
            spaces: None,
        }
    }

    /// Set the weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Restrict to `spaces`.
    #[must_use]
    pub fn on_spaces<S: AsRef<str>>(mut self, spaces: &[S]) -> Self {
        self.spaces = Some(spaces.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    /// De-duplication key.
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey {
            source: self.source.clone(),
            target: self.target.clone(),
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// `(source, target, type, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Source record.
    pub source: RecordId,
    /// Target record.
    pub target: RecordId,
    /// Event type.
    pub event_type: String,
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
}

impl From<EventKey> for EventError {
    fn from(key: EventKey) -> Self {
        EventError::Duplicate {
            source_id: key.source,
            target: key.target,
            event_type: key.event_type,
            timestamp: key.timestamp.to_rfc3339(),
        }
    }
}

/// A rejected event in a batch.
#[derive(Debug)]
pub struct EventFailure {
    /// Position in the submitted batch.
    pub position: usize,
    /// Why it was rejected.
    pub error: SpacemixError,
}

/// Outcome of [`crate::engine::Engine::apply_events`].
#[derive(Debug, Default)]
pub struct EventReport {
    /// Events applied.
    pub applied: usize,
    /// Events rejected, in batch order.
    pub failures: Vec<EventFailure>,
}

impl EventReport {
    /// Whether every event was applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies events to the record arena and writes adapted vectors back.
#[derive(Debug, Clone, Copy)]
pub struct EventEffectEngine {
    decay: DecayModel,
    base_weight: f64,
}

impl EventEffectEngine {
    /// Engine with an explicit decay model.
    #[must_use]
    pub fn new(decay: DecayModel, base_weight: f64) -> Self {
        Self { decay, base_weight }
    }

    /// Engine from `[events]`; the decay reference defaults to `now`.
    #[must_use]
    pub fn from_config(config: &EventsConfig, now: DateTime<Utc>) -> Self {
        let reference = config.reference_time.unwrap_or(now);
        Self::new(DecayModel::new(reference, config.half_life()), config.base_weight)
    }

    /// Decay model.
    #[must_use]
    pub fn decay(&self) -> &DecayModel {
        &self.decay
    }

    /// Weight of the ingested vector in the blend.
    #[must_use]
    pub fn base_weight(&self) -> f64 {
        self.base_weight
    }

    /// Validate the event against the index and return the affected space
    /// positions and the decayed weight `w_e`.
    ///
    /// # Errors
    ///
    /// Rejects invalid weights, undeclared event types and spaces outside the
    /// effect.
    pub fn plan(&self, index: &Index, event: &Event) -> std::result::Result<(Vec<usize>, f64), EventError> {
        if !event.weight.is_finite() || event.weight < 0.0 {
            return Err(EventError::InvalidWeight(event.weight));
        }
        let effect = index
            .effect(&event.event_type)
            .ok_or_else(|| EventError::UnknownEventType(event.event_type.clone()))?;

        let requested = event.spaces.as_ref().unwrap_or(&effect.spaces);
        let mut positions = Vec::with_capacity(requested.len());
        for space in requested {
            let position = effect
                .spaces
                .contains(space)
                .then(|| index.position(space))
                .flatten()
                .ok_or_else(|| EventError::UnknownSpace {
                    event_type: event.event_type.clone(),
                    space: space.clone(),
                })?;
            if !positions.contains(&position) {
                positions.push(position);
            }
        }

        let weight = event.weight * effect.multiplier * self.decay.factor(event.timestamp);
        Ok((positions, weight))
    }

    /// Apply one event and write the target's adapted vector to the store.
    ///
    /// Records this process has not touched yet are loaded from the store
    /// first. The source is locked only long enough to copy its base
    /// sub-vectors; the target stays locked through the store write so
    /// concurrent updates to it cannot interleave. A failed write leaves the
    /// target unchanged.
    ///
    /// # Errors
    ///
    /// Returns an [`EventError`] for invalid or duplicate events and a store
    /// error if a read or the write fails.
    #[instrument(
        name = "spacemix::event",
        skip_all,
        fields(source = %event.source, target = %event.target, event_type = %event.event_type)
    )]
    pub fn apply(
        &self,
        index: &Index,
        arena: &RecordArena,
        store: &dyn VectorStore,
        event: &Event,
    ) -> Result<()> {
        let (positions, weight) = self.plan(index, event)?;

        let dims = index.space_dimensions();
        let unknown = |id: &RecordId| EventError::UnknownRecord(id.clone());
        let source = arena
            .load(&event.source, store, &dims)?
            .ok_or_else(|| unknown(&event.source))?;
        let target = arena
            .load(&event.target, store, &dims)?
            .ok_or_else(|| unknown(&event.target))?;

        let influences: Vec<(usize, Vec<f32>)> = {
            let source = source.lock();
            if !source.is_ingested() {
                return Err(unknown(&event.source).into());
            }
            positions.iter().map(|&p| (p, source.base(p).to_vec())).collect()
        };

        let mut state = target.lock();
        if !state.is_ingested() {
            return Err(unknown(&event.target).into());
        }
        let key = event.key();
        if state.has_applied(&key) {
            return Err(EventError::from(key).into());
        }

        let saved = state.snapshot_slots(&positions);
        for (position, influence) in &influences {
            state.absorb(*position, influence, weight);
        }
        state.mark_applied(key.clone());
        let point = state.point(&event.target, self.base_weight);
        if let Err(e) = store.upsert_record(point, &state.snapshot()) {
            state.restore_slots(saved);
            state.forget(&key);
            return Err(e.into());
        }
        debug!(weight, spaces = positions.len(), "Event applied");
        Ok(())
    }
}
