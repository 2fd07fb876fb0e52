use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::RETRY_AFTER},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use coherence_gateway::{
    api::{AppState, build_router},
    awi::AuthorizationLevel,
    config::{Config, TierConfig},
    identity::KeyRegistry,
};

use crate::support::{Fault, Harness};

struct TestApp {
    router: Router,
    harness: Harness,
}

impl TestApp {
    fn new(config: Config) -> Self {
        let harness = Harness::new();
        let state = AppState::from_config(&config, harness.storage.clone(), harness.clock());
        Self {
            router: build_router(Arc::new(state)),
            harness,
        }
    }

    fn standard() -> Self {
        let mut config = Config::default();
        config.tiers.insert(
            "operator".to_string(),
            TierConfig {
                grant_authority: Some(AuthorizationLevel::Administer),
                ..TierConfig::default()
            },
        );
        Self::new(config)
    }

    async fn key(&self, tier: &str) -> String {
        KeyRegistry::new(
            Arc::clone(&self.harness.storage.relational),
            Arc::clone(&self.harness.storage.cache),
            self.harness.clock(),
        )
        .create("tests", tier)
        .await
        .expect("key should be minted")
        .raw_key
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("X-API-Key", key);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should be readable")
            .to_bytes();
        (status, headers, bytes.to_vec())
    }

    async fn json(
        &self,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, _, bytes) = self.send(method, uri, key, body).await;
        let value = serde_json::from_slice(&bytes).expect("response should be json");
        (status, value)
    }
}

#[tokio::test]
async fn given_no_key_when_calling_health_then_checks_are_reported() {
    let app = TestApp::standard();
    let (status, body) = app.json(Method::GET, "/api/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "status": "ok",
            "checks": { "relational": "ok", "cache": "ok", "blob": "ok" }
        })
    );
}

#[tokio::test]
async fn given_missing_or_bad_key_when_calling_protected_route_then_401_generic_body() {
    let app = TestApp::standard();
    let payload = json!({ "content": "Hello. World." });

    for key in [None, Some("cg_wrong")] {
        let (status, body) = app
            .json(Method::POST, "/api/wave/analyze", key, Some(payload.clone()))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "auth_error");
        assert_eq!(body["message"], "authentication failed");
    }
}

#[tokio::test]
async fn given_empty_content_when_analyzing_then_trivial_metrics_and_quota_header() {
    let app = TestApp::standard();
    let key = app.key("free").await;

    let (status, headers, bytes) = app
        .send(
            Method::POST,
            "/api/wave/analyze",
            Some(&key),
            Some(json!({ "content": "" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-ratelimit-remaining"], "99");

    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["curl"], 0.0);
    assert_eq!(body["divergence"], 0.0);
    assert_eq!(body["potential"], 0.0);
    assert_eq!(body["coherenceScore"], 100.0);

    let (status, history) = app
        .json(Method::GET, "/api/wave/history?limit=5", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn given_quota_spent_when_calling_again_then_429_with_retry_after() {
    let mut config = Config::default();
    config.rate_limit.max_requests = 2;
    let app = TestApp::new(config);
    let key = app.key("free").await;

    for _ in 0..2 {
        let (status, _) = app
            .json(Method::GET, "/api/wave/history", Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, bytes) = app
        .send(Method::GET, "/api/wave/history", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[RETRY_AFTER]
        .to_str()
        .expect("ascii header")
        .parse()
        .expect("numeric retry-after");
    assert!(retry_after >= 1);
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn given_marker_when_created_replayed_and_resolved_twice_then_status_codes_follow_the_lifecycle() {
    let app = TestApp::standard();
    let key = app.key("free").await;
    let create = json!({
        "type": "HANDOFF",
        "source": "planner",
        "target": "executor",
        "operation": "deploy",
        "payload": { "build": 7 },
        "idempotencyKey": "deploy-7"
    });

    let (status, created) = app
        .json(Method::POST, "/api/bump", Some(&key), Some(create.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "created");
    let id = created["id"].as_str().expect("id").to_string();

    let (status, replay) = app
        .json(Method::POST, "/api/bump", Some(&key), Some(create))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["id"], created["id"]);

    let (status, pending) = app
        .json(Method::GET, "/api/bump?target=executor", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().map(Vec::len), Some(1));

    let resolve = json!({ "context": "executor", "resolution": { "ok": true } });
    let uri = format!("/api/bump/{id}/resolve");
    let (status, resolved) = app
        .json(Method::POST, &uri, Some(&key), Some(resolve.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "resolved");

    let (status, body) = app.json(Method::POST, &uri, Some(&key), Some(resolve)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_resolved");

    let (status, body) = app
        .json(Method::GET, "/api/bump/does-not-exist", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn given_grant_requests_when_issuing_then_validation_and_authority_are_enforced() {
    let app = TestApp::standard();
    let operator = app.key("operator").await;
    let free = app.key("free").await;

    let (status, body) = app
        .json(
            Method::POST,
            "/api/awi",
            Some(&operator),
            Some(json!({ "subject": "agent:x", "level": "apply", "intent": "   " })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = app
        .json(
            Method::POST,
            "/api/awi",
            Some(&free),
            Some(json!({ "subject": "agent:x", "level": "apply", "intent": "deploy" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, grant) = app
        .json(
            Method::POST,
            "/api/awi",
            Some(&operator),
            Some(json!({
                "subject": "agent:x",
                "level": "apply",
                "intent": "deploy",
                "constraints": [{ "kind": "path", "value": "/srv" }]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, decision) = app
        .json(
            Method::GET,
            "/api/awi/check?subject=agent:x&level=administer",
            Some(&free),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision, json!({ "allowed": false, "reason": "insufficient_level" }));

    let uri = format!("/api/awi/{}/revoke", grant["id"].as_str().expect("id"));
    let (status, revoked) = app.json(Method::POST, &uri, Some(&operator), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revoked["revoked"], true);
}

#[tokio::test]
async fn given_task_when_patched_out_of_order_then_409_invalid_transition() {
    let app = TestApp::standard();
    let key = app.key("free").await;

    let (status, task) = app
        .json(
            Method::POST,
            "/api/atom",
            Some(&key),
            Some(json!({ "name": "rebuild index", "molecule": "search" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/api/atom/{}", task["id"].as_str().expect("id"));

    let (status, body) = app
        .json(
            Method::PATCH,
            &uri,
            Some(&key),
            Some(json!({ "status": "complete", "verification": { "ok": true } })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");

    let (status, active) = app
        .json(Method::PATCH, &uri, Some(&key), Some(json!({ "status": "active" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["status"], "active");

    let (status, listed) = app
        .json(Method::GET, "/api/atom?molecule=search", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn given_stored_entries_when_querying_then_ndjson_lines_stream_back() {
    let app = TestApp::standard();
    let key = app.key("free").await;

    for index in 0..3 {
        let (status, _) = app
            .json(
                Method::POST,
                "/api/context",
                Some(&key),
                Some(json!({
                    "domain": "ops",
                    "content": format!("runbook step {index}"),
                    "metadata": { "step": index },
                    "signals": ["runbook"]
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, headers, bytes) = app
        .send(
            Method::GET,
            "/api/context?domain=ops&limit=2&includeContent=true",
            Some(&key),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/x-ndjson");

    let text = String::from_utf8(bytes).expect("utf-8 body");
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line is json"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["content"], "runbook step 0");
    assert_eq!(lines[1]["metadata"]["step"], 1);

    let id = lines[0]["id"].as_str().expect("id");
    let (status, patched) = app
        .json(
            Method::PATCH,
            &format!("/api/context/{id}"),
            Some(&key),
            Some(json!({ "metadata": { "step": "reviewed" } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["metadata"]["step"], "reviewed");

    let (status, body) = app
        .json(Method::GET, "/api/context?domain=ops&limit=0", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn given_task_store_outage_when_creating_a_task_then_503_storage_unavailable() {
    let app = TestApp::standard();
    let key = app.key("free").await;
    let payload = json!({ "name": "rebuild index", "molecule": "search" });
    let (status, _) = app
        .json(Method::GET, "/api/atom?molecule=search", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    app.harness.relational_faults.set(Fault::Fails("insert_task"));
    let (status, body) = app
        .json(Method::POST, "/api/atom", Some(&key), Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "storage_unavailable");

    app.harness.relational_faults.set(Fault::Healthy);
    let (status, _) = app
        .json(Method::POST, "/api/atom", Some(&key), Some(payload))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn given_key_store_outage_when_authenticating_then_401_generic_body() {
    let app = TestApp::standard();
    let key = app.key("free").await;
    app.harness.relational_faults.set(Fault::Down);

    let (status, body) = app
        .json(Method::GET, "/api/wave/history", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_error");
    assert_eq!(body["message"], "authentication failed");
}

#[tokio::test]
async fn given_quota_counter_outage_when_calling_then_429_with_one_second_retry() {
    let app = TestApp::standard();
    let key = app.key("free").await;
    app.harness.cache_faults.fail_keys_with("quota:");

    let (status, headers, bytes) = app
        .send(Method::GET, "/api/wave/history", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[RETRY_AFTER], "1");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn given_stalled_store_when_request_outlives_its_deadline_then_504_timeout() {
    let mut config = Config::default();
    config.server.request_timeout_ms = 100;
    let app = TestApp::new(config);
    let key = app.key("free").await;
    // Warm the key cache so authentication no longer needs the stalled store.
    let (status, _) = app
        .json(Method::GET, "/api/wave/history", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    app.harness.relational_faults.set(Fault::Stalled);
    let (status, body) = app
        .json(Method::GET, "/api/atom/0190-missing", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "timeout");
}

#[tokio::test]
async fn given_stalled_store_when_streaming_context_then_body_ends_with_a_timeout_line() {
    let mut config = Config::default();
    config.server.request_timeout_ms = 100;
    let app = TestApp::new(config);
    let key = app.key("free").await;
    let (status, _) = app
        .json(Method::GET, "/api/wave/history", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    app.harness.relational_faults.set(Fault::Stalled);
    let (status, _, bytes) = app
        .send(Method::GET, "/api/context?domain=ops", Some(&key), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(bytes).expect("utf-8 body");
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line is json"))
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["error"], "timeout");
}
