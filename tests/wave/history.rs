use std::sync::Arc;

use coherence_gateway::{
    error::GatewayErrorKind,
    wave::{CoherenceAnalyzer, WaveService},
};

use crate::support::{Harness, caller};

fn service(harness: &Harness, max_content_bytes: usize) -> WaveService {
    WaveService::new(
        Arc::clone(&harness.storage.relational),
        harness.clock(),
        CoherenceAnalyzer::default(),
        max_content_bytes,
    )
}

#[tokio::test]
async fn given_analyses_by_two_callers_when_reading_history_then_only_own_newest_first() {
    let harness = Harness::new();
    let wave = service(&harness, 4096);
    let alice = caller("alice");
    let bob = caller("bob");

    let first = wave
        .analyze(&alice, "First draft. It wanders.")
        .await
        .expect("analysis should persist");
    harness.advance_secs(5);
    let second = wave
        .analyze(&alice, "Second draft. It focuses.")
        .await
        .expect("analysis should persist");
    wave.analyze(&bob, "Unrelated. Text.")
        .await
        .expect("analysis should persist");

    let history = wave.history(&alice, 10).await.expect("history should load");
    let ids: Vec<_> = history.iter().map(|analysis| analysis.id.clone()).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(history.iter().all(|analysis| analysis.caller_id == "alice"));
}

#[tokio::test]
async fn given_empty_text_when_analyzing_then_trivial_metrics_are_persisted() {
    let harness = Harness::new();
    let wave = service(&harness, 4096);

    let analysis = wave
        .analyze(&caller("alice"), "")
        .await
        .expect("empty text still scores");
    assert_eq!(analysis.curl, 0.0);
    assert_eq!(analysis.divergence, 0.0);
    assert_eq!(analysis.potential, 0.0);
    assert_eq!(analysis.coherence_score, 100.0);
    assert_eq!(analysis.content_fingerprint.len(), 64);
}

#[tokio::test]
async fn given_oversized_text_or_bad_limit_when_calling_then_validation_error() {
    let harness = Harness::new();
    let wave = service(&harness, 8);

    let err = wave
        .analyze(&caller("alice"), "far more than eight bytes")
        .await
        .expect_err("oversized content");
    assert_eq!(err.kind, GatewayErrorKind::Validation);

    for limit in [0, 1_001] {
        let err = wave
            .history(&caller("alice"), limit)
            .await
            .expect_err("limit out of range");
        assert_eq!(err.kind, GatewayErrorKind::Validation);
    }
}
