use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::types::{CallerId, JsonObject, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerType {
    Pass,
    Quantum,
    Error,
    Sync,
    Handoff,
}

impl MarkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Quantum => "QUANTUM",
            Self::Error => "ERROR",
            Self::Sync => "SYNC",
            Self::Handoff => "HANDOFF",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PASS" => Some(Self::Pass),
            "QUANTUM" => Some(Self::Quantum),
            "ERROR" => Some(Self::Error),
            "SYNC" => Some(Self::Sync),
            "HANDOFF" => Some(Self::Handoff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Created,
    Acknowledged,
    Resolved,
}

impl MarkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(Self::Created),
            "acknowledged" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BumpMarker {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub marker_type: MarkerType,
    pub source: String,
    pub target: String,
    pub operation: String,
    pub payload: JsonObject,
    pub status: MarkerStatus,
    pub caller_id: CallerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<JsonObject>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl BumpMarker {
    /// `resolved_at` is present exactly when the marker is terminal.
    pub fn is_consistent(&self) -> bool {
        self.status.is_terminal() == self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateMarkerRequest {
    #[serde(rename = "type")]
    pub marker_type: MarkerType,
    #[validate(length(min = 1, max = 128))]
    pub source: String,
    #[validate(length(min = 1, max = 128))]
    pub target: String,
    #[validate(length(min = 1, max = 128))]
    pub operation: String,
    #[serde(default)]
    pub payload: JsonObject,
    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeMarkerRequest {
    #[validate(length(min = 1, max = 128))]
    pub context: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResolveMarkerRequest {
    #[validate(length(min = 1, max = 128))]
    pub context: String,
    #[serde(default)]
    pub resolution: JsonObject,
}
