use std::time::Duration;

use futures_util::TryStreamExt;
use serde_json::json;

use coherence_gateway::{
    context::{ContextFilter, KnowledgeSettings, KnowledgeStore, OrphanSweeper, StoreContextRequest},
    error::GatewayErrorKind,
    storage::KvStore,
    types::JsonObject,
};

use crate::support::{Harness, caller};

fn settings() -> KnowledgeSettings {
    KnowledgeSettings {
        max_content_bytes: 1_024,
        promote_after_reads: 2,
        promoted_ttl: Duration::from_secs(300),
        read_counter_ttl: Duration::from_secs(3_600),
        page_size: 2,
        max_query_limit: 100,
    }
}

fn store(harness: &Harness) -> KnowledgeStore {
    KnowledgeStore::new(harness.storage.clone(), harness.clock(), settings())
}

fn object(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn entry(domain: &str, content: &str, signals: &[&str]) -> StoreContextRequest {
    StoreContextRequest {
        domain: domain.to_string(),
        content: content.to_string(),
        metadata: object(json!({ "source": "runbook" })),
        signals: signals.iter().map(|signal| signal.to_string()).collect(),
    }
}

fn filter(domain: &str) -> ContextFilter {
    ContextFilter {
        domain: domain.to_string(),
        ..ContextFilter::default()
    }
}

#[tokio::test]
async fn given_stored_entry_when_reading_then_content_is_hydrated_only_on_request() {
    let harness = Harness::new();
    let knowledge = store(&harness);

    let stored = knowledge
        .store(&caller("alice"), entry("ops", "restart the cache tier", &["cache", "cache", "restart"]))
        .await
        .expect("store");
    assert_eq!(stored.signals, vec!["cache", "restart"]);
    assert_eq!(stored.content_bytes, 22);
    assert_eq!(stored.content_ref, format!("context/{}", stored.id));

    let bare = knowledge.get(&stored.id, false).await.expect("get");
    assert_eq!(bare.content, None);
    assert_eq!(bare.metadata, stored.metadata);

    let full = knowledge.get(&stored.id, true).await.expect("get");
    assert_eq!(full.content.as_deref(), Some("restart the cache tier"));
}

#[tokio::test]
async fn given_bad_input_when_storing_then_validation_error_and_nothing_written() {
    let harness = Harness::new();
    let knowledge = store(&harness);

    let oversized = "x".repeat(1_025);
    for request in [
        entry("  ", "text", &[]),
        entry("ops", &oversized, &[]),
        entry("ops", "text", &[" "]),
    ] {
        let err = knowledge
            .store(&caller("alice"), request)
            .await
            .expect_err("invalid input");
        assert_eq!(err.kind, GatewayErrorKind::Validation);
    }
    assert!(harness.blobs.is_empty().await);
}

#[tokio::test]
async fn given_many_entries_when_querying_then_pages_are_stitched_in_id_order() {
    let harness = Harness::new();
    let knowledge = store(&harness);
    let alice = caller("alice");

    let mut expected = Vec::new();
    for index in 0..5 {
        let signals: &[&str] = if index % 2 == 0 { &["even"] } else { &["odd"] };
        let stored = knowledge
            .store(&alice, entry("ops", &format!("note {index}"), signals))
            .await
            .expect("store");
        expected.push(stored.id);
    }
    knowledge
        .store(&alice, entry("billing", "unrelated", &["even"]))
        .await
        .expect("store");

    let all: Vec<_> = knowledge
        .query(filter("ops"))
        .expect("query")
        .try_collect()
        .await
        .expect("stream");
    let ids: Vec<_> = all.iter().map(|entry| entry.id.clone()).collect();
    assert_eq!(ids, expected);
    assert!(all.iter().all(|entry| entry.content.is_none()));

    let first_page: Vec<_> = knowledge
        .query(ContextFilter {
            limit: Some(3),
            ..filter("ops")
        })
        .expect("query")
        .try_collect()
        .await
        .expect("stream");
    assert_eq!(first_page.len(), 3);

    let rest: Vec<_> = knowledge
        .query(ContextFilter {
            after: first_page.last().map(|entry| entry.id.clone()),
            include_content: true,
            ..filter("ops")
        })
        .expect("query")
        .try_collect()
        .await
        .expect("stream");
    let rest_ids: Vec<_> = rest.iter().map(|entry| entry.id.clone()).collect();
    assert_eq!(rest_ids, expected[3..].to_vec());
    assert_eq!(rest[0].content.as_deref(), Some("note 3"));

    let even: Vec<_> = knowledge
        .query(ContextFilter {
            signal: Some("even".to_string()),
            ..filter("ops")
        })
        .expect("query")
        .try_collect()
        .await
        .expect("stream");
    assert_eq!(even.len(), 3);
}

#[tokio::test]
async fn given_out_of_range_limit_when_querying_then_validation_error() {
    let harness = Harness::new();
    let knowledge = store(&harness);

    for limit in [0, 101] {
        let err = knowledge
            .query(ContextFilter {
                limit: Some(limit),
                ..filter("ops")
            })
            .err()
            .expect("limit must be rejected");
        assert_eq!(err.kind, GatewayErrorKind::Validation);
    }
}

#[tokio::test]
async fn given_hot_entry_when_metadata_changes_then_promoted_copy_is_invalidated() {
    let harness = Harness::new();
    let knowledge = store(&harness);
    let stored = knowledge
        .store(&caller("alice"), entry("ops", "hot path", &[]))
        .await
        .expect("store");
    let cache_key = format!("context:entry:{}", stored.id);

    knowledge.get(&stored.id, true).await.expect("first read");
    assert_eq!(harness.cache.get(&cache_key).await.expect("cache"), None);
    knowledge.get(&stored.id, true).await.expect("second read");
    assert!(harness.cache.get(&cache_key).await.expect("cache").is_some());

    let updated = knowledge
        .update_metadata(&stored.id, object(json!({ "source": "postmortem" })))
        .await
        .expect("update");
    assert_eq!(updated.metadata, object(json!({ "source": "postmortem" })));
    assert_eq!(harness.cache.get(&cache_key).await.expect("cache"), None);

    let reread = knowledge.get(&stored.id, false).await.expect("get");
    assert_eq!(reread.metadata, updated.metadata);

    let err = knowledge
        .update_metadata("missing", JsonObject::new())
        .await
        .expect_err("unknown entry");
    assert_eq!(err.kind, GatewayErrorKind::NotFound);
}

#[tokio::test]
async fn given_referenced_blobs_when_sweeping_then_nothing_is_deleted() {
    let harness = Harness::new();
    let knowledge = store(&harness);
    knowledge
        .store(&caller("alice"), entry("ops", "keep me", &[]))
        .await
        .expect("store");
    harness.advance_secs(3_600);

    let report = OrphanSweeper::new(harness.storage.clone(), harness.clock())
        .sweep_orphans(Duration::from_secs(600))
        .await
        .expect("sweep");
    assert_eq!((report.scanned, report.deleted, report.failed), (1, 0, 0));
    assert_eq!(harness.blobs.len().await, 1);
}
