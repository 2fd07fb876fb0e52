pub mod blob;
pub mod cache;
pub mod error;
pub mod relational;
pub mod sqlite;

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;

pub use blob::{BlobInfo, BlobStore, FsBlobStore, MemoryBlobStore};
pub use cache::{KvStore, MemoryKv};
pub use error::{StorageError, StorageErrorKind, StoreBackend};
pub use relational::{ContextPageRequest, MarkerInsert, RelationalStore};
pub use sqlite::SqliteStore;

/// The three stores every component reads and writes through.
#[derive(Clone)]
pub struct Storage {
    pub relational: Arc<dyn RelationalStore>,
    pub cache: Arc<dyn KvStore>,
    pub blob: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub relational: CheckStatus,
    pub cache: CheckStatus,
    pub blob: CheckStatus,
}

impl StorageHealth {
    pub fn is_healthy(&self) -> bool {
        [self.relational, self.cache, self.blob]
            .iter()
            .all(|status| *status == CheckStatus::Ok)
    }
}

fn check_status(backend: StoreBackend, result: Result<(), StorageError>) -> CheckStatus {
    match result {
        Ok(()) => CheckStatus::Ok,
        Err(err) => {
            tracing::warn!(
                target: "storage",
                backend = %backend,
                error = %err,
                "health_check_failed"
            );
            CheckStatus::Unavailable
        }
    }
}

/// Runs one storage call under `limit`. Running out of time is reported as
/// the backend being unavailable.
pub(crate) async fn bounded<T, F>(
    backend: StoreBackend,
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                target: "storage",
                backend = %backend,
                operation,
                timeout_ms = limit.as_millis() as u64,
                "storage_operation_timed_out"
            );
            Err(StorageError::unavailable(
                backend,
                format!("{operation} exceeded {}ms", limit.as_millis()),
            ))
        }
    }
}

impl Storage {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            relational,
            cache,
            blob,
        }
    }

    pub async fn health(&self, budget: Duration) -> StorageHealth {
        let (relational, cache, blob) = tokio::join!(
            bounded(StoreBackend::Relational, "ping", budget, self.relational.ping()),
            bounded(StoreBackend::Cache, "ping", budget, self.cache.ping()),
            bounded(StoreBackend::Blob, "ping", budget, self.blob.ping()),
        );
        StorageHealth {
            relational: check_status(StoreBackend::Relational, relational),
            cache: check_status(StoreBackend::Cache, cache),
            blob: check_status(StoreBackend::Blob, blob),
        }
    }
}
