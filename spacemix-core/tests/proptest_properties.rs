//! Property-based tests for composition, scalar encoding and event blending.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use spacemix_core::config::SpacemixConfig;
use spacemix_core::encoder::{Encoder, HashedTextEncoder, NumberEncoder};
use spacemix_core::store::InMemoryVectorStore;
use spacemix_core::vector;
use spacemix_core::{Effect, Engine, Event, FieldType, FieldValue, Index, RecordId, Schema, Space, SpaceMode};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn schema() -> Schema {
    Schema::builder("doc")
        .id("id")
        .field("title", FieldType::String)
        .field("body", FieldType::String)
        .field("score", FieldType::Float)
        .build()
        .expect("schema")
}

fn index(s: &Schema) -> Index {
    let enc = Arc::new(HashedTextEncoder::new(24));
    Index::builder("docs")
        .space(Space::text("title", &[s.field("title").expect("f")], enc.clone()).expect("space"), 1.0)
        .space(Space::text("body", &[s.field("body").expect("f")], enc).expect("space"), 1.0)
        .space(
            Space::number(
                "score",
                &[s.field("score").expect("f")],
                NumberEncoder::new(0.0, 10.0, SpaceMode::Maximize),
            )
            .expect("space"),
            1.0,
        )
        .effect(Effect::new("link", &["title"]))
        .effect(Effect::new("quote", &["title", "body"]).multiplier(0.5))
        .build()
        .expect("index")
}

const WORDS: &[&str] = &["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];

fn arb_text() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS), 1..5).prop_map(|w| w.join(" "))
}

fn arb_doc(id: usize) -> impl Strategy<Value = serde_json::Value> {
    (arb_text(), arb_text(), 0.0..10.0f64)
        .prop_map(move |(t, b, s)| json!({ "id": format!("d{id}"), "title": t, "body": b, "score": s }))
}

fn cos_to_preference(enc: &NumberEncoder, x: f64) -> f32 {
    let v = enc.encode(&FieldValue::Float(x)).expect("encode");
    let pref = enc.preference_vector().expect("ordered mode");
    vector::cosine_similarity(&v, &pref)
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn score_is_weighted_sum_of_space_similarities(
        stored in arb_doc(0),
        target in arb_doc(1),
        weights in prop::collection::vec(-5.0..5.0f64, 3),
    ) {
        let s = schema();
        let idx = index(&s);
        let stored = s.parse(&stored).expect("record");
        let target = s.parse(&target).expect("record");

        let stored_v = idx.compose(&stored).expect("compose");
        let units = idx.encode_subvectors(&target).expect("encode");
        let parts: Vec<(f64, Vec<f32>)> = weights.iter().copied().zip(units.iter().cloned()).collect();
        let query = idx.compose_query(&parts);

        let score = vector::dot(&stored_v, &query);
        let expected: f32 = (0..3)
            .map(|i| {
                vector::signed_sqrt(weights[i]) as f32
                    * vector::dot(idx.slice(&stored_v, i), &units[i])
            })
            .sum();
        prop_assert!((score - expected).abs() < 1e-4);

        let breakdown: f32 = idx.explain(&stored_v, &query).iter().map(|b| b.score).sum();
        prop_assert!((breakdown - score).abs() < 1e-4);
    }

    #[test]
    fn stored_subvectors_are_unit_or_zero(doc in arb_doc(0)) {
        let s = schema();
        let idx = index(&s);
        let v = idx.compose(&s.parse(&doc).expect("record")).expect("compose");
        for i in 0..idx.spaces().len() {
            let norm = vector::l2_norm(idx.slice(&v, i));
            prop_assert!(norm < 1e-6 || (norm - 1.0).abs() < 1e-5);
        }
    }
}

// ---------------------------------------------------------------------------
// Ordered scalar spaces
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn maximize_is_strictly_monotonic(a in 0.0..100.0f64, b in 0.0..100.0f64) {
        prop_assume!((a - b).abs() > 1.0);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let enc = NumberEncoder::new(0.0, 100.0, SpaceMode::Maximize);
        prop_assert!(cos_to_preference(&enc, hi) > cos_to_preference(&enc, lo));
    }

    #[test]
    fn minimize_mirrors_maximize(a in 0.0..100.0f64, b in 0.0..100.0f64) {
        prop_assume!((a - b).abs() > 1.0);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let enc = NumberEncoder::new(0.0, 100.0, SpaceMode::Minimize);
        prop_assert!(cos_to_preference(&enc, lo) > cos_to_preference(&enc, hi));
    }

    #[test]
    fn out_of_range_clamps(excess in 0.001..1e6f64) {
        let enc = NumberEncoder::new(0.0, 100.0, SpaceMode::Maximize);
        let above = enc.encode(&FieldValue::Float(100.0 + excess)).expect("encode");
        let top = enc.encode(&FieldValue::Float(100.0)).expect("encode");
        let below = enc.encode(&FieldValue::Float(-excess)).expect("encode");
        let bottom = enc.encode(&FieldValue::Float(0.0)).expect("encode");
        prop_assert_eq!(above, top);
        prop_assert_eq!(below, bottom);
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn arb_events() -> impl Strategy<Value = Vec<(usize, bool, f64, i64)>> {
    // (source index, quote?, weight, age in minutes)
    prop::collection::vec((1..4usize, any::<bool>(), 0.0..5.0f64, 0..100_000i64), 1..12)
}

fn run(docs: &[serde_json::Value], events: &[(usize, bool, f64, i64)], reverse: bool) -> (Vec<f32>, Vec<f32>) {
    let s = schema();
    let reference = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("date");
    let mut config = SpacemixConfig::default();
    config.events.reference_time = Some(reference);
    let engine = Engine::new(index(&s), Arc::new(InMemoryVectorStore::new()), &config).expect("engine");
    let before = {
        engine.put(&s, docs).expect("put");
        engine.get(&RecordId::from("d0")).expect("get").expect("stored").vector
    };

    let mut batch: Vec<Event> = events
        .iter()
        .enumerate()
        .map(|(i, &(src, quote, w, age))| {
            let ty = if quote { "quote" } else { "link" };
            let at = reference - Duration::minutes(age) - Duration::milliseconds(i as i64);
            Event::new(format!("d{src}"), "d0", ty, at).with_weight(w)
        })
        .collect();
    if reverse {
        batch.reverse();
    }
    for e in &batch {
        engine.apply_event(e).expect("applied");
    }
    (before, engine.get(&RecordId::from("d0")).expect("get").expect("stored").vector)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn event_order_is_irrelevant(
        docs in (arb_doc(0), arb_doc(1), arb_doc(2), arb_doc(3)),
        events in arb_events(),
    ) {
        let docs = vec![docs.0, docs.1, docs.2, docs.3];
        let (_, forward) = run(&docs, &events, false);
        let (_, backward) = run(&docs, &events, true);
        for (a, b) in forward.iter().zip(&backward) {
            prop_assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn events_never_touch_undeclared_spaces(
        docs in (arb_doc(0), arb_doc(1), arb_doc(2), arb_doc(3)),
        events in arb_events(),
    ) {
        let docs = vec![docs.0, docs.1, docs.2, docs.3];
        let (before, after) = run(&docs, &events, false);
        let idx = index(&schema());
        let score = idx.position("score").expect("space");
        prop_assert_eq!(idx.slice(&before, score), idx.slice(&after, score));
        if events.iter().all(|e| !e.1) {
            let body = idx.position("body").expect("space");
            prop_assert_eq!(idx.slice(&before, body), idx.slice(&after, body));
        }
    }
}
