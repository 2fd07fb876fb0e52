use std::{convert::Infallible, sync::Arc};

use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        extract::{JsonBody, QueryParams, ValidatedJson},
        state::AppState,
    },
    atom::{AtomSession, CreateTaskRequest, TransitionTaskRequest},
    awi::{AuthorizationLevel, AwiGrant, GrantDecision, IssueGrantRequest},
    bump::{AcknowledgeMarkerRequest, BumpMarker, CreateMarkerRequest, ResolveMarkerRequest},
    context::{ContextEntry, ContextFilter, StoreContextRequest, UpdateMetadataRequest},
    error::{ErrorBody, GatewayError, timeout},
    identity::CallerIdentity,
    storage::StorageHealth,
    wave::{AnalyzeRequest, WaveAnalysis},
};

type ApiResult<T> = Result<T, GatewayError>;

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub checks: StorageHealth,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let checks = state.storage.health(state.health_budget).await;
    let (status_code, status) = if checks.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (status_code, Json(HealthResponse { status, checks })).into_response()
}

// Wave

pub async fn analyze_wave(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    JsonBody(request): JsonBody<AnalyzeRequest>,
) -> ApiResult<Json<WaveAnalysis>> {
    Ok(Json(state.wave.analyze(&caller, request.text()).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn wave_history(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    QueryParams(query): QueryParams<HistoryQuery>,
) -> ApiResult<Json<Vec<WaveAnalysis>>> {
    let limit = query.limit.unwrap_or(state.default_history_limit);
    Ok(Json(state.wave.history(&caller, limit).await?))
}

// Bump

pub async fn create_marker(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ValidatedJson(request): ValidatedJson<CreateMarkerRequest>,
) -> ApiResult<(StatusCode, Json<BumpMarker>)> {
    let outcome = state.broker.create_marker(&caller, request).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.marker)))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub target: String,
}

pub async fn list_pending_markers(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<PendingQuery>,
) -> ApiResult<Json<Vec<BumpMarker>>> {
    Ok(Json(state.broker.list_pending(&query.target).await?))
}

pub async fn get_marker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<BumpMarker>> {
    Ok(Json(state.broker.get_marker(&id).await?))
}

pub async fn acknowledge_marker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<AcknowledgeMarkerRequest>,
) -> ApiResult<Json<BumpMarker>> {
    Ok(Json(
        state
            .broker
            .acknowledge_marker(&id, request.context.trim())
            .await?,
    ))
}

pub async fn resolve_marker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<ResolveMarkerRequest>,
) -> ApiResult<Json<BumpMarker>> {
    Ok(Json(
        state
            .broker
            .resolve_marker(&id, request.context.trim(), request.resolution)
            .await?,
    ))
}

// Awi

pub async fn issue_grant(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ValidatedJson(request): ValidatedJson<IssueGrantRequest>,
) -> ApiResult<(StatusCode, Json<AwiGrant>)> {
    let grant = state.grants.issue_grant(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

#[derive(Debug, Deserialize)]
pub struct CheckGrantQuery {
    pub subject: String,
    pub level: AuthorizationLevel,
}

pub async fn check_grant(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<CheckGrantQuery>,
) -> ApiResult<Json<GrantDecision>> {
    Ok(Json(
        state.grants.check_grant(&query.subject, query.level).await?,
    ))
}

pub async fn get_grant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AwiGrant>> {
    Ok(Json(state.grants.get_grant(&id).await?))
}

pub async fn revoke_grant(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult<Json<AwiGrant>> {
    Ok(Json(state.grants.revoke_grant(&caller, &id).await?))
}

// Atom

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ValidatedJson(request): ValidatedJson<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<AtomSession>)> {
    let task = state.tasks.create_task(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
pub struct MoleculeQuery {
    pub molecule: String,
}

pub async fn list_molecule(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<MoleculeQuery>,
) -> ApiResult<Json<Vec<AtomSession>>> {
    Ok(Json(state.tasks.list_molecule(&query.molecule).await?))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AtomSession>> {
    Ok(Json(state.tasks.get_task(&id).await?))
}

pub async fn transition_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<TransitionTaskRequest>,
) -> ApiResult<Json<AtomSession>> {
    Ok(Json(state.tasks.transition(&id, request).await?))
}

// Context

pub async fn store_context(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ValidatedJson(request): ValidatedJson<StoreContextRequest>,
) -> ApiResult<(StatusCode, Json<ContextEntry>)> {
    let entry = state.knowledge.store(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQuery {
    pub domain: String,
    pub signal: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_content: bool,
}

impl From<ContextQuery> for ContextFilter {
    fn from(query: ContextQuery) -> Self {
        Self {
            domain: query.domain,
            signal: query.signal.filter(|signal| !signal.trim().is_empty()),
            after: query.after.filter(|after| !after.is_empty()),
            limit: query.limit,
            include_content: query.include_content,
        }
    }
}

fn ndjson_line<T: Serialize>(value: &T) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

/// Streams matching entries as NDJSON. A failure after the first byte can no
/// longer change the status code, so it becomes a final error line instead.
///
/// The body outlives the request deadline middleware, so each entry must
/// arrive within the deadline on its own; a stalled page ends the stream.
pub async fn query_context(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<ContextQuery>,
) -> ApiResult<Response> {
    let entries = state.knowledge.query(ContextFilter::from(query))?;
    let deadline = state.request_timeout;
    let bounded = stream::unfold(Some(entries), move |entries| async move {
        let mut entries = entries?;
        match tokio::time::timeout(deadline, entries.next()).await {
            Ok(Some(item)) => Some((item, Some(entries))),
            Ok(None) => None,
            Err(_) => Some((
                Err(timeout(format!(
                    "context stream stalled past its {}ms deadline",
                    deadline.as_millis()
                ))),
                None,
            )),
        }
    });

    let lines = bounded.map(|item| {
        let line = match item {
            Ok(entry) => ndjson_line(&entry),
            Err(err) => {
                tracing::warn!(
                    target: "http",
                    kind = err.kind.as_str(),
                    error = %err.message,
                    "context_stream_aborted"
                );
                ndjson_line(&ErrorBody {
                    error: err.kind.as_str().to_string(),
                    message: err.message,
                    details: err.details,
                })
            }
        };
        Ok::<_, Infallible>(line)
    });

    Ok(([(CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeContentQuery {
    #[serde(default)]
    pub include_content: bool,
}

pub async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    QueryParams(query): QueryParams<IncludeContentQuery>,
) -> ApiResult<Json<ContextEntry>> {
    Ok(Json(state.knowledge.get(&id, query.include_content).await?))
}

pub async fn update_context_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<UpdateMetadataRequest>,
) -> ApiResult<Json<ContextEntry>> {
    Ok(Json(
        state
            .knowledge
            .update_metadata(&id, request.metadata)
            .await?,
    ))
}
