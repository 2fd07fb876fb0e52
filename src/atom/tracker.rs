use std::sync::Arc;

use serde_json::Value;

use crate::{
    atom::types::{AtomSession, AtomStatus, CreateTaskRequest, TransitionTaskRequest},
    clock::Clock,
    error::{GatewayError, invalid_transition, not_found, validation},
    identity::CallerIdentity,
    storage::RelationalStore,
    types::{json_depth, new_record_id},
};

const MAX_CAS_ATTEMPTS: usize = 3;
const MAX_VERIFICATION_DEPTH: usize = 16;

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Payload each terminal status demands.
fn check_requirements(request: &TransitionTaskRequest) -> Result<(), GatewayError> {
    match request.status {
        AtomStatus::Complete => {
            let verification = request.verification.as_ref();
            if verification.is_none_or(is_blank) {
                return Err(validation("completing a task requires a verification payload"));
            }
            if verification.is_some_and(|value| json_depth(value) > MAX_VERIFICATION_DEPTH) {
                return Err(validation(format!(
                    "verification nests deeper than {MAX_VERIFICATION_DEPTH} levels"
                )));
            }
        }
        AtomStatus::Failed => {
            if request
                .reason
                .as_deref()
                .is_none_or(|reason| reason.trim().is_empty())
            {
                return Err(validation("failing a task requires a reason"));
            }
        }
        AtomStatus::Pending | AtomStatus::Active => {}
    }
    Ok(())
}

pub struct TaskTracker {
    relational: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
}

impl TaskTracker {
    pub fn new(relational: Arc<dyn RelationalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { relational, clock }
    }

    pub async fn create_task(
        &self,
        caller: &CallerIdentity,
        request: CreateTaskRequest,
    ) -> Result<AtomSession, GatewayError> {
        let name = request.name.trim();
        let molecule = request.molecule.trim();
        if name.is_empty() || molecule.is_empty() {
            return Err(validation("name and molecule must not be blank"));
        }

        let now = self.clock.now();
        let task = AtomSession {
            id: new_record_id(),
            name: name.to_string(),
            molecule: molecule.to_string(),
            status: AtomStatus::Pending,
            verification: None,
            failure_reason: None,
            caller_id: caller.key_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.relational.insert_task(&task).await?;

        tracing::info!(
            target: "atom",
            task_id = %task.id,
            molecule = %task.molecule,
            "task_created"
        );
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<AtomSession, GatewayError> {
        self.relational
            .get_task(id)
            .await?
            .ok_or_else(|| not_found("task", id))
    }

    pub async fn list_molecule(&self, molecule: &str) -> Result<Vec<AtomSession>, GatewayError> {
        if molecule.trim().is_empty() {
            return Err(validation("molecule must not be empty"));
        }
        Ok(self.relational.list_tasks_in_molecule(molecule).await?)
    }

    pub async fn transition(
        &self,
        id: &str,
        request: TransitionTaskRequest,
    ) -> Result<AtomSession, GatewayError> {
        let next_status = request.status;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_task(id).await?;
            let expected = current.status;
            if !expected.can_move_to(next_status) {
                return Err(invalid_transition(format!(
                    "task '{id}' cannot move from {} to {}",
                    expected.as_str(),
                    next_status.as_str()
                )));
            }
            check_requirements(&request)?;

            let mut next = current;
            next.status = next_status;
            next.updated_at = self.clock.now();
            match next_status {
                AtomStatus::Complete => next.verification = request.verification.clone(),
                AtomStatus::Failed => {
                    next.failure_reason = request.reason.as_deref().map(|r| r.trim().to_string())
                }
                AtomStatus::Pending | AtomStatus::Active => {}
            }

            if self.relational.update_task(&next, expected).await? {
                tracing::info!(
                    target: "atom",
                    task_id = %next.id,
                    molecule = %next.molecule,
                    from = expected.as_str(),
                    to = next.status.as_str(),
                    "task_transitioned"
                );
                return Ok(next);
            }
            tracing::debug!(target: "atom", task_id = %id, "task_cas_retry");
        }

        Err(invalid_transition(format!(
            "task '{id}' changed concurrently; retry the request"
        )))
    }
}
