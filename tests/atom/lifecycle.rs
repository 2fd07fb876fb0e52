use std::sync::Arc;

use serde_json::json;

use coherence_gateway::{
    atom::{AtomSession, AtomStatus, CreateTaskRequest, TaskTracker, TransitionTaskRequest},
    error::GatewayErrorKind,
};

use crate::support::{Harness, caller};

fn tracker(harness: &Harness) -> TaskTracker {
    TaskTracker::new(Arc::clone(&harness.storage.relational), harness.clock())
}

fn to(status: AtomStatus) -> TransitionTaskRequest {
    TransitionTaskRequest {
        status,
        verification: None,
        reason: None,
    }
}

fn complete_with(verification: serde_json::Value) -> TransitionTaskRequest {
    TransitionTaskRequest {
        verification: Some(verification),
        ..to(AtomStatus::Complete)
    }
}

fn fail_with(reason: &str) -> TransitionTaskRequest {
    TransitionTaskRequest {
        reason: Some(reason.to_string()),
        ..to(AtomStatus::Failed)
    }
}

async fn active_task(tracker: &TaskTracker, molecule: &str) -> AtomSession {
    let task = tracker
        .create_task(
            &caller("alice"),
            CreateTaskRequest {
                name: "migrate schema".to_string(),
                molecule: molecule.to_string(),
            },
        )
        .await
        .expect("create");
    assert_eq!(task.status, AtomStatus::Pending);
    tracker
        .transition(&task.id, to(AtomStatus::Active))
        .await
        .expect("activate")
}

#[tokio::test]
async fn given_terminal_task_when_transitioning_anywhere_then_invalid_transition() {
    let harness = Harness::new();
    let tracker = tracker(&harness);

    let completed = active_task(&tracker, "release-7").await;
    tracker
        .transition(&completed.id, complete_with(json!({ "tests": "passed" })))
        .await
        .expect("complete");
    let failed = active_task(&tracker, "release-7").await;
    tracker
        .transition(&failed.id, fail_with("disk full"))
        .await
        .expect("fail");

    for id in [&completed.id, &failed.id] {
        for request in [
            to(AtomStatus::Pending),
            to(AtomStatus::Active),
            complete_with(json!({ "again": true })),
            fail_with("again"),
        ] {
            let err = tracker
                .transition(id, request)
                .await
                .expect_err("terminal tasks are closed");
            assert_eq!(err.kind, GatewayErrorKind::InvalidTransition);
        }
    }
}

#[tokio::test]
async fn given_pending_task_when_skipping_active_then_invalid_transition() {
    let harness = Harness::new();
    let tracker = tracker(&harness);
    let task = tracker
        .create_task(
            &caller("alice"),
            CreateTaskRequest {
                name: "index".to_string(),
                molecule: "search".to_string(),
            },
        )
        .await
        .expect("create");

    let err = tracker
        .transition(&task.id, complete_with(json!({ "ok": true })))
        .await
        .expect_err("pending cannot complete");
    assert_eq!(err.kind, GatewayErrorKind::InvalidTransition);
}

#[tokio::test]
async fn given_active_task_when_completing_without_evidence_then_validation_error() {
    let harness = Harness::new();
    let tracker = tracker(&harness);
    let task = active_task(&tracker, "release-8").await;

    for request in [
        to(AtomStatus::Complete),
        complete_with(json!({})),
        complete_with(json!("  ")),
        fail_with(" "),
        to(AtomStatus::Failed),
    ] {
        let err = tracker
            .transition(&task.id, request)
            .await
            .expect_err("missing evidence");
        assert_eq!(err.kind, GatewayErrorKind::Validation);
    }

    let done = tracker
        .transition(&task.id, complete_with(json!({ "checks": 12 })))
        .await
        .expect("complete with evidence");
    assert_eq!(done.status, AtomStatus::Complete);
    assert_eq!(done.verification, Some(json!({ "checks": 12 })));
    assert_eq!(tracker.get_task(&task.id).await.expect("get"), done);
}

#[tokio::test]
async fn given_tasks_in_molecules_when_listing_then_only_that_molecule_is_returned() {
    let harness = Harness::new();
    let tracker = tracker(&harness);
    let a = active_task(&tracker, "alpha").await;
    let b = active_task(&tracker, "alpha").await;
    active_task(&tracker, "beta").await;

    let alpha = tracker.list_molecule("alpha").await.expect("list");
    let mut ids: Vec<_> = alpha.iter().map(|task| task.id.clone()).collect();
    ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);

    let err = tracker.get_task("missing").await.expect_err("unknown task");
    assert_eq!(err.kind, GatewayErrorKind::NotFound);
}
