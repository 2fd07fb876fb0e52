use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    atom::{AtomSession, AtomStatus},
    awi::AwiGrant,
    bump::{BumpMarker, MarkerStatus},
    context::ContextEntry,
    identity::ApiKeyRecord,
    storage::error::StorageError,
    types::JsonObject,
    wave::WaveAnalysis,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerInsert {
    Inserted,
    /// The `(caller, idempotency key)` pair already exists; carries the stored row.
    Duplicate(BumpMarker),
}

/// One page of context rows, ordered by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPageRequest<'a> {
    pub domain: &'a str,
    pub signal: Option<&'a str>,
    pub after: Option<&'a str>,
    pub limit: usize,
}

/// Source of truth for every structured record.
///
/// Transition methods are compare-and-set: they apply only when the stored
/// status still equals `expected` and report whether a row changed.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StorageError>;
    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, StorageError>;
    async fn find_api_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApiKeyRecord>, StorageError>;
    async fn revoke_api_key(&self, id: &str) -> Result<bool, StorageError>;
    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StorageError>;

    async fn insert_wave_analysis(&self, analysis: &WaveAnalysis) -> Result<(), StorageError>;
    async fn list_wave_analyses(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<WaveAnalysis>, StorageError>;

    async fn insert_marker(&self, marker: &BumpMarker) -> Result<MarkerInsert, StorageError>;
    async fn get_marker(&self, id: &str) -> Result<Option<BumpMarker>, StorageError>;
    async fn update_marker(
        &self,
        marker: &BumpMarker,
        expected: MarkerStatus,
    ) -> Result<bool, StorageError>;
    async fn list_pending_markers(
        &self,
        target: &str,
        limit: usize,
    ) -> Result<Vec<BumpMarker>, StorageError>;

    async fn insert_grant(&self, grant: &AwiGrant) -> Result<(), StorageError>;
    async fn get_grant(&self, id: &str) -> Result<Option<AwiGrant>, StorageError>;
    async fn list_grants_for_subject(&self, subject: &str) -> Result<Vec<AwiGrant>, StorageError>;
    async fn revoke_grant(&self, id: &str, revoked_at: OffsetDateTime)
    -> Result<bool, StorageError>;

    async fn insert_task(&self, task: &AtomSession) -> Result<(), StorageError>;
    async fn get_task(&self, id: &str) -> Result<Option<AtomSession>, StorageError>;
    async fn update_task(
        &self,
        task: &AtomSession,
        expected: AtomStatus,
    ) -> Result<bool, StorageError>;
    async fn list_tasks_in_molecule(
        &self,
        molecule: &str,
    ) -> Result<Vec<AtomSession>, StorageError>;

    async fn insert_context_entry(&self, entry: &ContextEntry) -> Result<(), StorageError>;
    async fn get_context_entry(&self, id: &str) -> Result<Option<ContextEntry>, StorageError>;
    async fn update_context_metadata(
        &self,
        id: &str,
        metadata: &JsonObject,
        updated_at: OffsetDateTime,
    ) -> Result<bool, StorageError>;
    async fn page_context_entries(
        &self,
        request: ContextPageRequest<'_>,
    ) -> Result<Vec<ContextEntry>, StorageError>;
    async fn referenced_blob_keys(&self) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}
