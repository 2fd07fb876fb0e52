#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;

use coherence_gateway::{
    atom::{AtomSession, AtomStatus},
    awi::AwiGrant,
    bump::{BumpMarker, MarkerStatus},
    clock::{Clock, ManualClock},
    context::ContextEntry,
    identity::{ApiKeyRecord, CallerIdentity},
    storage::{
        ContextPageRequest, KvStore, MarkerInsert, MemoryBlobStore, MemoryKv, RelationalStore,
        SqliteStore, Storage, StorageError, StoreBackend,
    },
    types::JsonObject,
    wave::WaveAnalysis,
};

pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// What an injected relational fault does to the calls it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    Healthy,
    /// Every call fails as unavailable.
    Down,
    /// Every call hangs forever.
    Stalled,
    /// Only the named call fails as unavailable.
    Fails(&'static str),
}

/// SQLite behind a switch that can take it down or make it hang.
pub struct FaultyRelational {
    inner: SqliteStore,
    fault: Mutex<Fault>,
}

impl FaultyRelational {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            fault: Mutex::new(Fault::Healthy),
        }
    }

    pub fn set(&self, fault: Fault) {
        *self.fault.lock().expect("fault switch") = fault;
    }

    async fn gate(&self, call: &'static str) -> Result<(), StorageError> {
        let fault = *self.fault.lock().expect("fault switch");
        match fault {
            Fault::Healthy => Ok(()),
            Fault::Fails(name) if name != call => Ok(()),
            Fault::Down | Fault::Fails(_) => Err(StorageError::unavailable(
                StoreBackend::Relational,
                format!("injected outage in {call}"),
            )),
            Fault::Stalled => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RelationalStore for FaultyRelational {
    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StorageError> {
        self.gate("insert_api_key").await?;
        self.inner.insert_api_key(record).await
    }
    async fn get_api_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, StorageError> {
        self.gate("get_api_key").await?;
        self.inner.get_api_key(id).await
    }
    async fn find_api_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApiKeyRecord>, StorageError> {
        self.gate("find_api_key_by_fingerprint").await?;
        self.inner.find_api_key_by_fingerprint(fingerprint).await
    }
    async fn revoke_api_key(&self, id: &str) -> Result<bool, StorageError> {
        self.gate("revoke_api_key").await?;
        self.inner.revoke_api_key(id).await
    }
    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StorageError> {
        self.gate("list_api_keys").await?;
        self.inner.list_api_keys().await
    }
    async fn insert_wave_analysis(&self, analysis: &WaveAnalysis) -> Result<(), StorageError> {
        self.gate("insert_wave_analysis").await?;
        self.inner.insert_wave_analysis(analysis).await
    }
    async fn list_wave_analyses(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<WaveAnalysis>, StorageError> {
        self.gate("list_wave_analyses").await?;
        self.inner.list_wave_analyses(caller_id, limit).await
    }
    async fn insert_marker(&self, marker: &BumpMarker) -> Result<MarkerInsert, StorageError> {
        self.gate("insert_marker").await?;
        self.inner.insert_marker(marker).await
    }
    async fn get_marker(&self, id: &str) -> Result<Option<BumpMarker>, StorageError> {
        self.gate("get_marker").await?;
        self.inner.get_marker(id).await
    }
    async fn update_marker(
        &self,
        marker: &BumpMarker,
        expected: MarkerStatus,
    ) -> Result<bool, StorageError> {
        self.gate("update_marker").await?;
        self.inner.update_marker(marker, expected).await
    }
    async fn list_pending_markers(
        &self,
        target: &str,
        limit: usize,
    ) -> Result<Vec<BumpMarker>, StorageError> {
        self.gate("list_pending_markers").await?;
        self.inner.list_pending_markers(target, limit).await
    }
    async fn insert_grant(&self, grant: &AwiGrant) -> Result<(), StorageError> {
        self.gate("insert_grant").await?;
        self.inner.insert_grant(grant).await
    }
    async fn get_grant(&self, id: &str) -> Result<Option<AwiGrant>, StorageError> {
        self.gate("get_grant").await?;
        self.inner.get_grant(id).await
    }
    async fn list_grants_for_subject(&self, subject: &str) -> Result<Vec<AwiGrant>, StorageError> {
        self.gate("list_grants_for_subject").await?;
        self.inner.list_grants_for_subject(subject).await
    }
    async fn revoke_grant(
        &self,
        id: &str,
        revoked_at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.gate("revoke_grant").await?;
        self.inner.revoke_grant(id, revoked_at).await
    }
    async fn insert_task(&self, task: &AtomSession) -> Result<(), StorageError> {
        self.gate("insert_task").await?;
        self.inner.insert_task(task).await
    }
    async fn get_task(&self, id: &str) -> Result<Option<AtomSession>, StorageError> {
        self.gate("get_task").await?;
        self.inner.get_task(id).await
    }
    async fn update_task(
        &self,
        task: &AtomSession,
        expected: AtomStatus,
    ) -> Result<bool, StorageError> {
        self.gate("update_task").await?;
        self.inner.update_task(task, expected).await
    }
    async fn list_tasks_in_molecule(
        &self,
        molecule: &str,
    ) -> Result<Vec<AtomSession>, StorageError> {
        self.gate("list_tasks_in_molecule").await?;
        self.inner.list_tasks_in_molecule(molecule).await
    }
    async fn insert_context_entry(&self, entry: &ContextEntry) -> Result<(), StorageError> {
        self.gate("insert_context_entry").await?;
        self.inner.insert_context_entry(entry).await
    }
    async fn get_context_entry(&self, id: &str) -> Result<Option<ContextEntry>, StorageError> {
        self.gate("get_context_entry").await?;
        self.inner.get_context_entry(id).await
    }
    async fn update_context_metadata(
        &self,
        id: &str,
        metadata: &JsonObject,
        updated_at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.gate("update_context_metadata").await?;
        self.inner
            .update_context_metadata(id, metadata, updated_at)
            .await
    }
    async fn page_context_entries(
        &self,
        request: ContextPageRequest<'_>,
    ) -> Result<Vec<ContextEntry>, StorageError> {
        self.gate("page_context_entries").await?;
        self.inner.page_context_entries(request).await
    }
    async fn referenced_blob_keys(&self) -> Result<Vec<String>, StorageError> {
        self.gate("referenced_blob_keys").await?;
        self.inner.referenced_blob_keys().await
    }
    async fn ping(&self) -> Result<(), StorageError> {
        self.gate("ping").await?;
        self.inner.ping().await
    }
}

/// In-memory KV whose calls fail for keys under a chosen prefix. The empty
/// prefix takes the whole cache down, pings included.
pub struct FaultyKv {
    inner: MemoryKv,
    failing_prefix: Mutex<Option<String>>,
}

impl FaultyKv {
    pub fn new(inner: MemoryKv) -> Self {
        Self {
            inner,
            failing_prefix: Mutex::new(None),
        }
    }

    pub fn fail_keys_with(&self, prefix: &str) {
        *self.failing_prefix.lock().expect("fault switch") = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.failing_prefix.lock().expect("fault switch") = None;
    }

    fn gate(&self, key: &str) -> Result<(), StorageError> {
        let failing = self
            .failing_prefix
            .lock()
            .expect("fault switch")
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix));
        if failing {
            Err(StorageError::unavailable(
                StoreBackend::Cache,
                format!("injected outage for '{key}'"),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for FaultyKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gate(key)?;
        self.inner.get(key).await
    }
    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.gate(key)?;
        self.inner.set(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.gate(key)?;
        self.inner.delete(key).await
    }
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StorageError> {
        self.gate(key)?;
        self.inner.incr(key, ttl).await
    }
    async fn decr(&self, key: &str) -> Result<u64, StorageError> {
        self.gate(key)?;
        self.inner.decr(key).await
    }
    async fn ping(&self) -> Result<(), StorageError> {
        self.gate("")?;
        self.inner.ping().await
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub sqlite: SqliteStore,
    pub cache: Arc<MemoryKv>,
    pub blobs: Arc<MemoryBlobStore>,
    /// Switches for the stores behind `storage`; healthy until set.
    pub relational_faults: Arc<FaultyRelational>,
    pub cache_faults: Arc<FaultyKv>,
    pub storage: Storage,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let sqlite =
            SqliteStore::open_in_memory(OPERATION_TIMEOUT).expect("in-memory sqlite should open");
        let cache = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new(clock.clone() as Arc<dyn Clock>));
        let relational_faults = Arc::new(FaultyRelational::new(sqlite.clone()));
        let cache_faults = Arc::new(FaultyKv::new(cache.as_ref().clone()));
        let storage = Storage::new(
            relational_faults.clone(),
            cache_faults.clone(),
            blobs.clone(),
        );
        Self {
            clock,
            sqlite,
            cache,
            blobs,
            relational_faults,
            cache_faults,
            storage,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.clock.advance(time::Duration::seconds(seconds));
    }
}

pub fn caller(key_id: &str) -> CallerIdentity {
    CallerIdentity {
        key_id: key_id.to_string(),
        owner: format!("{key_id}-owner"),
        tier: "free".to_string(),
    }
}

pub fn caller_with(key_id: &str, owner: &str, tier: &str) -> CallerIdentity {
    CallerIdentity {
        key_id: key_id.to_string(),
        owner: owner.to_string(),
        tier: tier.to_string(),
    }
}
