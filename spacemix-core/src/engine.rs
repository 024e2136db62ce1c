//! Application surface.
//!
//! [`Engine`] ties an [`Index`] to a [`VectorStore`]: batch ingestion, event
//! application and parameterised search. Definitions are immutable once the
//! engine is built; every mutable piece of state lives in the per-record
//! arena or in the store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::{QueryConfig, SpacemixConfig};
use crate::error::{Result, SpacemixError};
use crate::event::{Event, EventEffectEngine, EventFailure, EventReport};
use crate::index::Index;
use crate::metrics::EngineCounters;
use crate::query::{ParamExtractor, QueryParams, QueryResult, QueryTemplate, ResolvedQuery, Resolver, ResultEntry};
use crate::record::{RecordArena, RecordState};
use crate::schema::Schema;
use crate::store::{open_store, StoredPoint, VectorStore};
use crate::telemetry::PiiPolicy;
use crate::types::RecordId;

/// A record rejected during [`Engine::put`].
#[derive(Debug)]
pub struct IngestFailure {
    /// Position in the submitted batch.
    pub position: usize,
    /// Identifier, when the record got far enough to have one.
    pub id: Option<RecordId>,
    /// Why it was rejected.
    pub error: SpacemixError,
}

/// Outcome of [`Engine::put`].
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Records written to the store.
    pub ingested: usize,
    /// Records rejected, in batch order.
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    /// Whether every record was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Multi-space vector engine.
pub struct Engine {
    index: Arc<Index>,
    store: Arc<dyn VectorStore>,
    arena: RecordArena,
    effects: EventEffectEngine,
    query_config: QueryConfig,
    slow_query: Option<Duration>,
    pii: PiiPolicy,
    counters: EngineCounters,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("index", &self.index.name())
            .field("records", &self.arena.len())
            .field("effects", &self.effects)
            .field("query_config", &self.query_config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine over `index` backed by `store`.
    ///
    /// Registers the index layout with the store. Encoders are wrapped in an
    /// LRU cache when `[encoders] cache_capacity` is non-zero.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the store already holds vectors
    /// of a different layout and `[store] override_existing` is off.
    pub fn new(index: Index, store: Arc<dyn VectorStore>, config: &SpacemixConfig) -> Result<Self> {
        config.validate()?;
        let index = index.with_encoder_cache(config.encoders.cache_capacity);
        store.ensure_index(&index.layout(), config.store.override_existing)?;
        info!(
            index = index.name(),
            spaces = index.spaces().len(),
            dimensions = index.dimensions(),
            "Engine ready"
        );
        Ok(Self {
            index: Arc::new(index),
            store,
            arena: RecordArena::new(),
            effects: EventEffectEngine::from_config(&config.events, Utc::now()),
            query_config: config.query.clone(),
            slow_query: (config.telemetry.log_slow_queries_ms > 0)
                .then(|| Duration::from_millis(config.telemetry.log_slow_queries_ms)),
            pii: PiiPolicy::from_config(config),
            counters: EngineCounters::new(),
        })
    }

    /// Engine with the store selected by `[store]`.
    ///
    /// # Errors
    ///
    /// See [`Engine::new`]; also fails if the store cannot be opened.
    pub fn from_config(index: Index, config: &SpacemixConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store)?;
        Self::new(index, store, config)
    }

    /// The index.
    #[must_use]
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// The store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Event engine in use.
    #[must_use]
    pub fn effects(&self) -> &EventEffectEngine {
        &self.effects
    }

    /// Operation counters.
    #[must_use]
    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Ingest a batch of records of `schema`.
    ///
    /// Records are parsed, encoded and written in parallel. A record that
    /// fails is reported and skipped; the rest of the batch still lands.
    /// Re-putting an id replaces its base vectors and keeps its event history.
    /// Duplicate ids within a batch are applied in batch order, so the last
    /// valid one wins.
    ///
    /// # Errors
    ///
    /// Fails only when the index does not cover `schema`.
    #[instrument(name = "spacemix::put", skip_all, fields(schema = schema.name(), records = records.len()))]
    pub fn put(&self, schema: &Schema, records: &[Value]) -> Result<IngestReport> {
        self.index.ensure_covers(schema.name())?;
        let dims = self.index.space_dimensions();

        let mut failures: Vec<IngestFailure> = group_by_id(schema, records)
            .par_iter()
            .flat_map_iter(|positions| {
                positions
                    .iter()
                    .filter_map(|&position| {
                        let (id, error) = self.ingest_one(schema, &records[position], &dims).err()?;
                        warn!(position, error = %error, "Record rejected");
                        Some(IngestFailure { position, id, error })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        failures.sort_by_key(|f| f.position);

        let ingested = records.len() - failures.len();
        EngineCounters::add(&self.counters.records_ingested, ingested as u64);
        EngineCounters::add(&self.counters.ingest_failures, failures.len() as u64);
        info!(ingested, failed = failures.len(), "Batch ingested");
        Ok(IngestReport { ingested, failures })
    }

    fn ingest_one(
        &self,
        schema: &Schema,
        raw: &Value,
        dims: &[usize],
    ) -> std::result::Result<(), (Option<RecordId>, SpacemixError)> {
        let record = schema.parse(raw).map_err(|e| (schema.record_id(raw).ok(), e.into()))?;
        let id = &record.id;
        let fail = |e: SpacemixError| (Some(id.clone()), e);

        let base = self.index.encode_subvectors(&record).map_err(|e| fail(e.into()))?;
        let payload = record.payload(schema.id_field());

        let slot = self
            .arena
            .load(id, self.store.as_ref(), dims)
            .map_err(|e| fail(e.into()))?
            .unwrap_or_else(|| self.arena.slot(id, schema.name(), dims));
        let mut state = slot.lock();
        state.claim(id, schema.name()).map_err(|e| fail(e.into()))?;
        let previous = state.rebase(base, payload);
        let point = state.point(id, self.effects.base_weight());
        if let Err(e) = self.store.upsert_record(point, &state.snapshot()) {
            state.restore_base(previous);
            return Err(fail(e.into()));
        }
        debug!(id = %id, "Record stored");
        Ok(())
    }

    /// Stored point for `id`.
    ///
    /// # Errors
    ///
    /// Returns a store error on I/O failure.
    pub fn get(&self, id: &RecordId) -> Result<Option<StoredPoint>> {
        Ok(self.store.get(id)?)
    }

    /// Snapshot of the in-process state of `id`: base vectors, event
    /// accumulators and payload. Records not yet touched since a restart are
    /// absent until the next put or event loads them.
    #[must_use]
    pub fn record(&self, id: &RecordId) -> Option<RecordState> {
        let slot = self.arena.get(id)?;
        let state = slot.lock();
        state.is_ingested().then(|| state.clone())
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns an [`crate::error::EventError`] for unknown records, event
    /// types or spaces, invalid weights and duplicates, or a store error.
    pub fn apply_event(&self, event: &Event) -> Result<()> {
        match self.effects.apply(&self.index, &self.arena, self.store.as_ref(), event) {
            Ok(()) => {
                EngineCounters::incr(&self.counters.events_applied);
                Ok(())
            }
            Err(e) => {
                EngineCounters::incr(&self.counters.events_rejected);
                Err(e)
            }
        }
    }

    /// Apply a batch of events. Order does not affect the resulting vectors.
    #[instrument(name = "spacemix::events", skip_all, fields(events = events.len()))]
    pub fn apply_events(&self, events: &[Event]) -> EventReport {
        let failures: Vec<EventFailure> = events
            .par_iter()
            .enumerate()
            .filter_map(|(position, event)| {
                let error = self.apply_event(event).err()?;
                warn!(position, error = %error, "Event rejected");
                Some(EventFailure { position, error })
            })
            .collect();
        let applied = events.len() - failures.len();
        info!(applied, rejected = failures.len(), "Events applied");
        EventReport { applied, failures }
    }

    /// Bind a template's params without searching.
    ///
    /// # Errors
    ///
    /// See [`Resolver::resolve`].
    pub async fn resolve(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
        extractor: Option<&dyn ParamExtractor>,
    ) -> Result<ResolvedQuery> {
        Resolver::new(&self.index, &self.query_config)
            .with_counters(&self.counters)
            .with_pii(self.pii)
            .resolve(template, params, extractor)
            .await
    }

    /// Resolve `template` and return the ranked records with per-space score
    /// breakdowns.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ParamError`] when a param cannot be bound and
    /// a store error when the search fails.
    #[instrument(name = "spacemix::query", skip_all, fields(schema = template.schema()))]
    pub async fn query(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
        extractor: Option<&dyn ParamExtractor>,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let resolved = self.resolve(template, params, extractor).await?;
        let hits = self
            .store
            .search(&resolved.query_vector, Some(&resolved.filter), resolved.limit)?;

        let entries: Vec<ResultEntry> = hits
            .into_iter()
            .map(|hit| ResultEntry {
                breakdown: self.index.explain(&hit.vector, &resolved.query_vector),
                id: hit.id,
                score: hit.score,
                payload: hit.payload,
            })
            .collect();
        EngineCounters::incr(&self.counters.queries_executed);

        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if self.slow_query.is_some_and(|limit| elapsed >= limit) {
            warn!(elapsed_ms, results = entries.len(), "Slow query");
        } else {
            debug!(elapsed_ms, results = entries.len(), "Query executed");
        }

        Ok(QueryResult {
            entries,
            resolved_params: resolved.params,
            space_weights: resolved.space_weights,
        })
    }
}

/// Batch positions grouped by record id, in first-seen order. Records without
/// a usable id form singleton groups.
fn group_by_id(schema: &Schema, records: &[Value]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::with_capacity(records.len());
    let mut seen: HashMap<RecordId, usize> = HashMap::new();
    for (position, raw) in records.iter().enumerate() {
        match schema.record_id(raw) {
            Ok(id) => match seen.entry(id) {
                Entry::Occupied(group) => groups[*group.get()].push(position),
                Entry::Vacant(slot) => {
                    slot.insert(groups.len());
                    groups.push(vec![position]);
                }
            },
            Err(_) => groups.push(vec![position]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{HashedTextEncoder, NumberEncoder};
    use crate::error::{EventError, SchemaError, StoreError};
    use crate::filter::Predicate;
    use crate::index::{Effect, IndexLayout};
    use crate::query::{Param, Query};
    use crate::schema::FieldType;
    use crate::space::Space;
    use crate::store::{InMemoryVectorStore, ScoredPoint};
    use crate::types::SpaceMode;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn schema() -> Schema {
        Schema::builder("paper")
            .id("id")
            .field("title", FieldType::String)
            .field("citations", FieldType::Integer)
            .build()
            .expect("schema")
    }

    fn index(s: &Schema) -> Index {
        Index::builder("papers")
            .space(
                Space::text("title", &[s.field("title").expect("f")], Arc::new(HashedTextEncoder::new(32)))
                    .expect("space"),
                1.0,
            )
            .space(
                Space::number(
                    "citations",
                    &[s.field("citations").expect("f")],
                    NumberEncoder::new(0.0, 1000.0, SpaceMode::Maximize),
                )
                .expect("space"),
                1.0,
            )
            .effect(Effect::new("cites", &["title"]))
            .build()
            .expect("index")
    }

    fn engine() -> (Schema, Engine) {
        let s = schema();
        let e = Engine::new(index(&s), Arc::new(InMemoryVectorStore::new()), &SpacemixConfig::default())
            .expect("engine");
        (s, e)
    }

    #[test]
    fn put_isolates_bad_records() {
        let (s, e) = engine();
        let report = e
            .put(
                &s,
                &[
                    json!({ "id": "p1", "title": "vector search", "citations": 10 }),
                    json!({ "id": "p2", "title": "graph search", "citations": "many" }),
                    json!({ "title": "no id" }),
                    json!({ "id": "p3", "title": "sparse retrieval", "citations": 300 }),
                ],
            )
            .expect("covered");
        assert_eq!(report.ingested, 2);
        let positions: Vec<_> = report.failures.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(report.failures[0].id, Some(RecordId::from("p2")));
        assert!(report.failures[1].id.is_none());
        assert_eq!(e.counters().snapshot().records_ingested, 2);
        assert!(e.get(&RecordId::from("p1")).expect("get").is_some());
        assert!(e.get(&RecordId::from("p2")).expect("get").is_none());
    }

    #[test]
    fn repeated_ids_keep_the_last_version() {
        let (s, e) = engine();
        let batch: Vec<Value> = (0..64)
            .map(|i| json!({ "id": "a", "title": format!("v{i}"), "citations": i }))
            .collect();
        let report = e.put(&s, &batch).expect("covered");
        assert!(report.is_complete());
        let stored = e.get(&RecordId::from("a")).expect("get").expect("stored");
        assert_eq!(stored.payload["title"], json!("v63"));
        assert_eq!(e.record(&RecordId::from("a")).expect("ingested").payload()["title"], json!("v63"));
    }

    #[test]
    fn invalid_duplicate_does_not_clobber_valid_one() {
        let (s, e) = engine();
        let report = e
            .put(
                &s,
                &[
                    json!({ "id": "a", "title": "kept", "citations": 3 }),
                    json!({ "id": "b", "title": "other", "citations": 1 }),
                    json!({ "id": "a", "title": "broken", "citations": "lots" }),
                ],
            )
            .expect("covered");
        assert_eq!(report.ingested, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].position, 2);
        assert_eq!(report.failures[0].id, Some(RecordId::from("a")));
        let stored = e.get(&RecordId::from("a")).expect("get").expect("stored");
        assert_eq!(stored.payload["title"], json!("kept"));
    }

    #[test]
    fn uncovered_schema_is_rejected() {
        let (_, e) = engine();
        let other = Schema::builder("author").id("id").build().expect("schema");
        let err = e.put(&other, &[json!({ "id": "a1" })]).expect_err("not indexed");
        assert!(matches!(err, SpacemixError::SchemaValidation(SchemaError::SchemaNotIndexed { .. })));
    }

    #[test]
    fn reput_replaces_base() {
        let (s, e) = engine();
        e.put(&s, &[json!({ "id": "p1", "title": "old title", "citations": 1 })]).expect("put");
        let before = e.get(&RecordId::from("p1")).expect("get").expect("stored");
        e.put(&s, &[json!({ "id": "p1", "title": "new title", "citations": 1 })]).expect("put");
        let after = e.get(&RecordId::from("p1")).expect("get").expect("stored");
        assert_ne!(before.vector, after.vector);
        assert_eq!(after.payload["title"], json!("new title"));
    }

    #[test]
    fn events_through_engine() {
        let (s, e) = engine();
        e.put(
            &s,
            &[
                json!({ "id": "a", "title": "attention is all you need", "citations": 900 }),
                json!({ "id": "b", "title": "convolutional networks", "citations": 50 }),
            ],
        )
        .expect("put");
        let t = Utc::now();
        let report = e.apply_events(&[
            Event::new("a", "b", "cites", t),
            Event::new("a", "missing", "cites", t),
            Event::new("a", "b", "cites", t),
        ]);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failures.len(), 2);
        let state = e.record(&RecordId::from("b")).expect("ingested");
        assert!(state.event_weight(0) > 0.0);
        assert_eq!(state.event_weight(1), 0.0);
        let c = e.counters().snapshot();
        assert_eq!((c.events_applied, c.events_rejected), (1, 2));
    }

    #[test]
    fn new_engine_over_same_store_keeps_event_history() {
        let s = schema();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let first = Engine::new(index(&s), Arc::clone(&store), &SpacemixConfig::default()).expect("engine");
        first
            .put(
                &s,
                &[
                    json!({ "id": "a", "title": "attention is all you need", "citations": 900 }),
                    json!({ "id": "b", "title": "convolutional networks", "citations": 50 }),
                ],
            )
            .expect("put");
        let t = Utc::now();
        first.apply_event(&Event::new("a", "b", "cites", t)).expect("applied");
        let weight = first.record(&RecordId::from("b")).expect("ingested").event_weight(0);
        drop(first);

        let second = Engine::new(index(&s), store, &SpacemixConfig::default()).expect("engine");
        assert!(second.record(&RecordId::from("b")).is_none());
        let err = second.apply_event(&Event::new("a", "b", "cites", t)).expect_err("seen before");
        assert!(matches!(err, SpacemixError::EventValidation(EventError::Duplicate { .. })));

        second
            .put(&s, &[json!({ "id": "b", "title": "convolutional networks", "citations": 60 })])
            .expect("put");
        let state = second.record(&RecordId::from("b")).expect("ingested");
        assert_eq!(state.events_applied(), 1);
        assert!((state.event_weight(0) - weight).abs() < 1e-9);
        assert_eq!(state.payload()["citations"], json!(60));
    }

    #[tokio::test]
    async fn query_ranks_and_explains() {
        let (s, e) = engine();
        e.put(
            &s,
            &[
                json!({ "id": "p1", "title": "vector search engines", "citations": 10 }),
                json!({ "id": "p2", "title": "vector search engines", "citations": 900 }),
                json!({ "id": "p3", "title": "protein folding", "citations": 500 }),
            ],
        )
        .expect("put");
        let template = Query::find(e.index(), &s)
            .expect("covered")
            .similar("title", Param::new("q"), 1.0)
            .weight("citations", Param::new("cw").default(1.0))
            .filter(Predicate::ne("id", "p3"))
            .build()
            .expect("template");
        let result = e
            .query(&template, &QueryParams::new().with("q", "vector search engines"), None)
            .await
            .expect("query");
        assert_eq!(result.ids(), vec![&RecordId::from("p2"), &RecordId::from("p1")]);
        for entry in &result.entries {
            let total: f32 = entry.breakdown.iter().map(|b| b.score).sum();
            assert!((total - entry.score).abs() < 1e-4);
        }
        assert_eq!(result.resolved_params["cw"], json!(1.0));
        assert_eq!(e.counters().snapshot().queries_executed, 1);
    }

    struct FlakyStore {
        inner: InMemoryVectorStore,
        fail: AtomicBool,
    }

    impl VectorStore for FlakyStore {
        fn ensure_index(&self, layout: &IndexLayout, override_existing: bool) -> Result<()> {
            self.inner.ensure_index(layout, override_existing)
        }

        fn upsert(&self, point: StoredPoint) -> std::result::Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable {
                    operation: "upsert",
                    reason: "connection reset".into(),
                });
            }
            self.inner.upsert(point)
        }

        fn get(&self, id: &RecordId) -> std::result::Result<Option<StoredPoint>, StoreError> {
            self.inner.get(id)
        }

        fn search(
            &self,
            query: &[f32],
            filter: Option<&Predicate>,
            limit: usize,
        ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
            self.inner.search(query, filter, limit)
        }

        fn len(&self) -> std::result::Result<usize, StoreError> {
            self.inner.len()
        }
    }

    #[test]
    fn failed_write_rolls_back_and_is_retryable() {
        let s = schema();
        let store = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(),
            fail: AtomicBool::new(false),
        });
        let e = Engine::new(index(&s), store.clone(), &SpacemixConfig::default()).expect("engine");
        e.put(&s, &[json!({ "id": "p1", "title": "first", "citations": 1 })]).expect("put");

        store.fail.store(true, Ordering::SeqCst);
        let report = e
            .put(&s, &[json!({ "id": "p1", "title": "second", "citations": 1 })])
            .expect("covered");
        assert!(report.failures[0].error.is_retryable());
        let state = e.record(&RecordId::from("p1")).expect("still ingested");
        assert_eq!(state.payload()["title"], json!("first"));
    }

    #[test]
    fn store_without_snapshots_rebuilds_from_vectors() {
        let s = schema();
        let store = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(),
            fail: AtomicBool::new(false),
        });
        let first = Engine::new(index(&s), store.clone(), &SpacemixConfig::default()).expect("engine");
        first
            .put(
                &s,
                &[
                    json!({ "id": "a", "title": "attention is all you need", "citations": 900 }),
                    json!({ "id": "b", "title": "convolutional networks", "citations": 50 }),
                ],
            )
            .expect("put");
        let before = first.get(&RecordId::from("b")).expect("get").expect("stored");
        drop(first);

        let second = Engine::new(index(&s), store, &SpacemixConfig::default()).expect("engine");
        second
            .apply_event(&Event::new("a", "b", "cites", Utc::now()))
            .expect("records rebuilt from stored vectors");
        let state = second.record(&RecordId::from("b")).expect("loaded");
        assert_eq!(state.events_applied(), 1);
        assert!(state.event_weight(0) > 0.0);
        let after = second.get(&RecordId::from("b")).expect("get").expect("stored");
        assert_ne!(before.vector, after.vector);
    }
}
