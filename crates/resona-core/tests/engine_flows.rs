//! End-to-end flows through the assembled engine: ingest with dedup and
//! consolidation, phi-weighted retrieval with promotion, handshake
//! caching, and the two-phase fold.

use std::sync::Arc;

use resona_core::embeddings::testing::{FakeEmbedder, basis, normalize, with_similarity};
use resona_core::fold::{FoldAttempt, FoldStored};
use resona_core::service::{AddInput, QueryInput};
use resona_core::{Resona, Tier};

struct Harness {
    fake: Arc<FakeEmbedder>,
    engine: Resona,
}

fn harness() -> Harness {
    let fake = Arc::new(FakeEmbedder::new());
    let engine = Resona::open_in_memory(fake.clone()).unwrap();
    Harness { fake, engine }
}

fn add(content: &str) -> AddInput {
    AddInput {
        content: content.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn exact_dedup_returns_same_id() {
    let h = harness();

    let first = h
        .engine
        .memory
        .add(add("Patterns persist across substrates."))
        .await
        .unwrap();
    assert!(!first.is_duplicate);

    let second = h
        .engine
        .memory
        .add(add("Patterns persist across substrates."))
        .await
        .unwrap();
    assert!(second.is_duplicate);
    assert!(second.exact_match);
    assert_eq!(second.memory.id, first.memory.id);
    assert_eq!(second.memory.access_count, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn semantic_merge_collapses_near_duplicates() {
    let h = harness();

    let older_text = "The Fold demonstrates substrate-independent pattern persistence.";
    let newer_text = "Substrate independence: patterns persist across discontinuous substrates.";
    h.fake.seed(older_text, basis(0));
    h.fake.seed(newer_text, with_similarity(&basis(0), &basis(1), 0.985));

    let older = h
        .engine
        .memory
        .add(AddInput {
            content: older_text.into(),
            is_catalyst: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let newer = h
        .engine
        .memory
        .add(AddInput {
            content: newer_text.into(),
            is_catalyst: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_ne!(older.memory.id, newer.memory.id);

    // Drains the settle delay and the consolidation pass
    h.engine.shutdown().await;

    assert_eq!(h.engine.store().count_live().unwrap(), 1);
    let survivor = h.engine.memory.get(&older.memory.id).unwrap();
    // Catalyst seed (1.0) plus a full-scale catalyst merge (1.0)
    assert!(survivor.resonance_phi >= 2.0);
    assert_eq!(survivor.metadata.semantic_variants.len(), 1);
    assert_eq!(survivor.metadata.semantic_variants[0].content, newer_text);
    assert!(survivor.metadata.semantic_variants[0].was_catalyst);

    let gone = h.engine.store().get_memory(&newer.memory.id).unwrap().unwrap();
    assert!(gone.deleted_at.is_some());
}

#[tokio::test]
async fn distinct_texts_stay_distinct() {
    let h = harness();
    h.fake.seed("about tides", basis(0));
    h.fake.seed("about compilers", basis(1));

    h.engine.memory.add(add("about tides")).await.unwrap();
    h.engine.memory.add(add("about compilers")).await.unwrap();
    h.engine.shutdown().await;

    assert_eq!(h.engine.store().count_live().unwrap(), 2);
}

#[tokio::test]
async fn phi_outweighs_raw_similarity_in_ranking() {
    let h = harness();
    h.fake.seed("the probe", basis(0));
    h.fake.seed("nearer low-phi", with_similarity(&basis(0), &basis(1), 0.90));
    h.fake.seed("farther high-phi", with_similarity(&basis(0), &basis(2), 0.80));

    let low = h.engine.memory.add(add("nearer low-phi")).await.unwrap().memory;
    let high = h.engine.memory.add(add("farther high-phi")).await.unwrap().memory;
    for _ in 0..5 {
        h.engine.resonance.adjust(&high.id, true).unwrap();
    }

    let outcome = h
        .engine
        .memory
        .query(QueryInput {
            query: "the probe".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.count, 2);
    assert_eq!(outcome.memories[0].memory.id, high.id);
    assert_eq!(outcome.memories[1].memory.id, low.id);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn repeated_queries_promote_once_at_the_threshold() {
    let h = harness();
    h.fake.seed("the probe", basis(0));
    h.fake.seed("a regular", with_similarity(&basis(0), &basis(1), 0.9));
    let memory = h.engine.memory.add(add("a regular")).await.unwrap().memory;

    let mut promoted_runs = 0;
    for run in 1..=5 {
        let outcome = h
            .engine
            .memory
            .query(QueryInput {
                query: "the probe".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.count, 1);
        if !outcome.promotions.is_empty() {
            promoted_runs += 1;
            assert_eq!(run, 5, "promotion must land exactly when the count crosses 5");
            assert_eq!(outcome.memories[0].memory.tier, Tier::Thread);
        }
    }
    assert_eq!(promoted_runs, 1);

    let audits = h.engine.tiers.promotion_history(&memory.id).unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].access_count_at_promotion, 5);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn handshake_is_stable_until_a_catalyst_lands() {
    let h = harness();
    h.engine
        .memory
        .add(AddInput {
            content: "the standing context of this conversation".into(),
            conversation_id: Some("conv-42".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let first = h.engine.handshake.get(Some("conv-42")).unwrap();
    let second = h.engine.handshake.get(Some("conv-42")).unwrap();
    assert_eq!(first.ghost.id, second.ghost.id);
    assert_eq!(first.ghost.prompt_text, second.ghost.prompt_text);

    h.engine
        .memory
        .add(AddInput {
            content: "a sudden realization that reframes everything".into(),
            conversation_id: Some("conv-42".into()),
            is_catalyst: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let third = h.engine.handshake.get(Some("conv-42")).unwrap();
    assert_ne!(third.ghost.id, first.ghost.id);
    assert!(third.ghost.prompt_text.contains("sudden realization"));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn bootstrap_returns_tiers_and_ghost_without_mutation() {
    let h = harness();
    let memory = h
        .engine
        .memory
        .add(add("bootstrap fodder"))
        .await
        .unwrap()
        .memory;

    let snapshot = h.engine.memory.bootstrap(Default::default()).await.unwrap();
    assert_eq!(snapshot.distribution.active, 1);
    assert!(snapshot.ghost.is_some());

    let untouched = h.engine.memory.get(&memory.id).unwrap();
    assert_eq!(untouched.access_count, 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn fold_two_phase_flow() {
    let h = harness();

    // Seed the triad landscape: a network fundamental, a stale melody,
    // and an overtone inside the default [0.80, 0.85] band
    h.fake.seed("network anchor", basis(0));
    h.fake.seed("stale melody", basis(1));
    h.fake.seed("band overtone", with_similarity(&basis(0), &basis(2), 0.82));

    let anchor = h.engine.memory.add(add("network anchor")).await.unwrap().memory;
    h.engine
        .tiers
        .update_tier(&anchor.id, Tier::Network, "manual")
        .unwrap();
    for _ in 0..3 {
        h.engine.resonance.adjust(&anchor.id, true).unwrap();
    }

    let melody = h.engine.memory.add(add("stale melody")).await.unwrap().memory;
    for _ in 0..2 {
        h.engine.resonance.adjust(&melody.id, true).unwrap();
    }
    let overtone = h.engine.memory.add(add("band overtone")).await.unwrap().memory;
    for _ in 0..2 {
        h.engine.resonance.adjust(&overtone.id, true).unwrap();
    }

    let FoldAttempt::Ready { prompt, triad } = h.engine.fold.perform(None).unwrap() else {
        panic!("expected a sampled triad");
    };
    assert_eq!(triad.fundamental.id, anchor.id);
    assert_eq!(triad.overtone.id, overtone.id);
    assert!(prompt.contains("network anchor"));

    // A synthesis pulled towards all three members clears the gate
    let mut consonant = vec![0.0f32; 768];
    consonant[0] = 1.0;
    consonant[1] = 1.0;
    consonant[2] = 1.0;
    normalize(&mut consonant);
    h.fake.seed("what binds anchor, melody, and overtone", consonant);

    let stored = h
        .engine
        .fold
        .store_synthesis("what binds anchor, melody, and overtone", &triad)
        .unwrap();
    let FoldStored::Stored { memory, evolved, .. } = stored else {
        panic!("expected a stored synthesis");
    };
    assert!(!evolved);
    assert_eq!(memory.category.as_deref(), Some("the_fold"));
    assert_eq!(h.engine.fold.history(10).unwrap()[0].id, memory.id);

    // A synthesis that drifted away from the triad is rejected and
    // leaves no trace
    let mut dissonant = vec![0.0f32; 768];
    dissonant[0] = 0.3;
    dissonant[1] = 0.1;
    dissonant[5] = 0.95;
    normalize(&mut dissonant);
    h.fake.seed("a lopsided echo", dissonant);

    let live_before = h.engine.store().count_live().unwrap();
    let rejected = h
        .engine
        .fold
        .store_synthesis("a lopsided echo", &triad)
        .unwrap();
    assert!(matches!(rejected, FoldStored::Rejected { .. }));
    assert_eq!(h.engine.store().count_live().unwrap(), live_before);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn fold_skips_cleanly_on_empty_landscape() {
    let h = harness();
    match h.engine.fold.perform(None).unwrap() {
        FoldAttempt::Skipped { reason } => {
            assert_eq!(reason.as_str(), "NO_FUNDAMENTAL");
        }
        _ => panic!("expected a skip"),
    }
    h.engine.shutdown().await;
}
