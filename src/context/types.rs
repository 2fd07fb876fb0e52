use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::types::{CallerId, JsonObject, RecordId};

pub const BLOB_PREFIX: &str = "context";

pub fn blob_key_for(id: &str) -> String {
    format!("{BLOB_PREFIX}/{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub id: RecordId,
    pub domain: String,
    pub metadata: JsonObject,
    pub content_ref: String,
    pub content_sha256: String,
    pub content_bytes: u64,
    pub signals: Vec<String>,
    pub caller_id: CallerId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Hydrated from the blob store only when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextFilter {
    pub domain: String,
    pub signal: Option<String>,
    pub after: Option<RecordId>,
    pub limit: Option<usize>,
    pub include_content: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StoreContextRequest {
    #[validate(length(min = 1, max = 128))]
    pub domain: String,
    pub content: String,
    #[serde(default)]
    pub metadata: JsonObject,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub metadata: JsonObject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}
