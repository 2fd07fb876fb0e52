use std::time::Duration;

use futures_util::TryStreamExt;
use serde_json::json;

use coherence_gateway::{
    context::{
        ContextFilter, KnowledgeSettings, KnowledgeStore, OrphanSweeper, StoreContextRequest,
    },
    error::GatewayErrorKind,
    storage::BlobStore,
    types::JsonObject,
};

use crate::support::{Fault, Harness, caller};

#[tokio::test]
async fn given_row_write_failure_when_storing_then_no_row_exists_and_sweeper_reclaims_the_blob() {
    let harness = Harness::new();
    // A crash between the blob write and the row write.
    harness
        .relational_faults
        .set(Fault::Fails("insert_context_entry"));
    let knowledge = KnowledgeStore::new(
        harness.storage.clone(),
        harness.clock(),
        KnowledgeSettings::default(),
    );

    let err = knowledge
        .store(
            &caller("alice"),
            StoreContextRequest {
                domain: "ops".to_string(),
                content: "half-written".to_string(),
                metadata: JsonObject::new(),
                signals: vec![],
            },
        )
        .await
        .expect_err("row write fails");
    assert_eq!(err.kind, GatewayErrorKind::StorageUnavailable);

    // Every visible row has its blob: here there is no row at all.
    let rows: Vec<_> = knowledge
        .query(ContextFilter {
            domain: "ops".to_string(),
            ..ContextFilter::default()
        })
        .expect("query")
        .try_collect()
        .await
        .expect("stream");
    assert!(rows.is_empty());
    assert_eq!(harness.blobs.len().await, 1);

    let sweeper = OrphanSweeper::new(harness.storage.clone(), harness.clock());
    let grace = Duration::from_secs(600);

    let report = sweeper.sweep_orphans(grace).await.expect("sweep");
    assert_eq!(report.deleted, 0, "fresh orphans are inside the grace period");
    assert_eq!(harness.blobs.len().await, 1);

    harness.advance_secs(601);
    let report = sweeper.sweep_orphans(grace).await.expect("sweep");
    assert_eq!((report.scanned, report.deleted, report.failed), (1, 1, 0));
    assert!(harness.blobs.is_empty().await);
    assert!(
        harness
            .blobs
            .list("context")
            .await
            .expect("list")
            .is_empty()
    );
}

#[tokio::test]
async fn given_successful_store_when_reading_row_then_its_blob_is_present() {
    let harness = Harness::new();
    let knowledge = KnowledgeStore::new(
        harness.storage.clone(),
        harness.clock(),
        KnowledgeSettings::default(),
    );
    let stored = knowledge
        .store(
            &caller("alice"),
            StoreContextRequest {
                domain: "ops".to_string(),
                content: "complete".to_string(),
                metadata: serde_json::from_value(json!({ "k": "v" })).expect("object"),
                signals: vec!["s".to_string()],
            },
        )
        .await
        .expect("store");

    let blob = harness
        .blobs
        .get(&stored.content_ref)
        .await
        .expect("blob read")
        .expect("blob exists for every row");
    assert_eq!(blob, b"complete".to_vec());
}
