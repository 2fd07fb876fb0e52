use std::sync::Arc;

use crate::{
    bump::types::{BumpMarker, CreateMarkerRequest, MarkerStatus},
    clock::Clock,
    error::{
        GatewayError, already_resolved, forbidden, invalid_transition, not_found, validation,
    },
    identity::CallerIdentity,
    storage::{MarkerInsert, RelationalStore},
    types::{JsonObject, json_depth, new_record_id},
};

const MAX_CAS_ATTEMPTS: usize = 3;
const MAX_PAYLOAD_DEPTH: usize = 16;
const PENDING_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerOutcome {
    pub marker: BumpMarker,
    /// False when an idempotency key matched an earlier marker.
    pub created: bool,
}

pub struct HandoffBroker {
    relational: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
}

enum Step {
    Acknowledge,
    Resolve(JsonObject),
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Resolve(_) => "resolve",
        }
    }
}

fn check_payload(field: &str, payload: &JsonObject) -> Result<(), GatewayError> {
    let depth = 1 + payload.values().map(json_depth).max().unwrap_or(0);
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(validation(format!(
            "{field} nests deeper than {MAX_PAYLOAD_DEPTH} levels"
        )));
    }
    Ok(())
}

impl HandoffBroker {
    pub fn new(relational: Arc<dyn RelationalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { relational, clock }
    }

    pub async fn create_marker(
        &self,
        caller: &CallerIdentity,
        request: CreateMarkerRequest,
    ) -> Result<MarkerOutcome, GatewayError> {
        check_payload("payload", &request.payload)?;

        let marker = BumpMarker {
            id: new_record_id(),
            marker_type: request.marker_type,
            source: request.source,
            target: request.target,
            operation: request.operation,
            payload: request.payload,
            status: MarkerStatus::Created,
            caller_id: caller.key_id.clone(),
            idempotency_key: request.idempotency_key,
            resolution: None,
            created_at: self.clock.now(),
            acknowledged_at: None,
            resolved_at: None,
        };

        match self.relational.insert_marker(&marker).await? {
            MarkerInsert::Inserted => {
                tracing::info!(
                    target: "bump",
                    marker_id = %marker.id,
                    marker_type = marker.marker_type.as_str(),
                    source = %marker.source,
                    target_context = %marker.target,
                    "marker_created"
                );
                Ok(MarkerOutcome {
                    marker,
                    created: true,
                })
            }
            MarkerInsert::Duplicate(existing) => {
                tracing::info!(
                    target: "bump",
                    marker_id = %existing.id,
                    caller_id = %caller.key_id,
                    "marker_idempotent_replay"
                );
                Ok(MarkerOutcome {
                    marker: existing,
                    created: false,
                })
            }
        }
    }

    pub async fn get_marker(&self, id: &str) -> Result<BumpMarker, GatewayError> {
        self.relational
            .get_marker(id)
            .await?
            .ok_or_else(|| not_found("marker", id))
    }

    pub async fn acknowledge_marker(
        &self,
        id: &str,
        context: &str,
    ) -> Result<BumpMarker, GatewayError> {
        self.transition(id, context, Step::Acknowledge).await
    }

    pub async fn resolve_marker(
        &self,
        id: &str,
        context: &str,
        resolution: JsonObject,
    ) -> Result<BumpMarker, GatewayError> {
        check_payload("resolution", &resolution)?;
        self.transition(id, context, Step::Resolve(resolution)).await
    }

    /// Markers addressed to `target` that are not yet resolved, oldest first.
    pub async fn list_pending(&self, target: &str) -> Result<Vec<BumpMarker>, GatewayError> {
        if target.trim().is_empty() {
            return Err(validation("target must not be empty"));
        }
        Ok(self
            .relational
            .list_pending_markers(target, PENDING_PAGE_LIMIT)
            .await?)
    }

    async fn transition(
        &self,
        id: &str,
        context: &str,
        step: Step,
    ) -> Result<BumpMarker, GatewayError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_marker(id).await?;
            if current.target != context {
                tracing::info!(
                    target: "bump",
                    marker_id = %id,
                    acting_context = %context,
                    step = step.name(),
                    "marker_transition_forbidden"
                );
                return Err(forbidden("only the target context may transition this marker"));
            }

            let now = self.clock.now();
            let expected = current.status;
            let mut next = current;
            match (&step, expected) {
                (_, MarkerStatus::Resolved) => {
                    return Err(already_resolved(format!("marker '{id}' is already resolved")));
                }
                (Step::Acknowledge, MarkerStatus::Acknowledged) => {
                    return Err(invalid_transition(format!(
                        "marker '{id}' is already acknowledged"
                    )));
                }
                (Step::Acknowledge, MarkerStatus::Created) => {
                    next.status = MarkerStatus::Acknowledged;
                    next.acknowledged_at = Some(now);
                }
                (Step::Resolve(resolution), MarkerStatus::Created | MarkerStatus::Acknowledged) => {
                    next.status = MarkerStatus::Resolved;
                    next.resolution = Some(resolution.clone());
                    next.resolved_at = Some(now);
                }
            }

            if self.relational.update_marker(&next, expected).await? {
                tracing::info!(
                    target: "bump",
                    marker_id = %next.id,
                    from = expected.as_str(),
                    to = next.status.as_str(),
                    "marker_transitioned"
                );
                return Ok(next);
            }
            tracing::debug!(target: "bump", marker_id = %id, "marker_cas_retry");
        }

        Err(invalid_transition(format!(
            "marker '{id}' changed concurrently; retry the request"
        )))
    }
}
