use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};

use crate::storage::{
    bounded,
    error::{StorageError, StoreBackend},
};

const PURGE_EVERY_WRITES: u64 = 1_024;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Key-value cache with TTLs and atomic counters.
///
/// Counters must be shared by every gateway instance that enforces the same
/// quota, so deployments running more than one process plug a shared store in
/// behind this trait. [`MemoryKv`] serves single-process deployments and tests.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Increments the counter at `key` and returns the new value. `ttl` applies
    /// only when the counter is created, so the window it bounds never slides.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StorageError>;

    /// Decrements the counter at `key`, never below zero, keeping its TTL.
    /// A missing counter stays missing and reads as zero.
    async fn decr(&self, key: &str) -> Result<u64, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Default)]
struct KvInner {
    entries: HashMap<String, KvEntry>,
    writes: u64,
}

impl KvInner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut KvEntry> {
        let expired = self.entries.get(key).is_some_and(|entry| !entry.is_live(now));
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn counter(
        &mut self,
        key: &str,
        now: Instant,
    ) -> Result<Option<(u64, Option<Instant>)>, StorageError> {
        let Some(entry) = self.live(key, now) else {
            return Ok(None);
        };
        let value = entry.value.parse::<u64>().map_err(|_| {
            StorageError::corrupt(
                StoreBackend::Cache,
                format!("counter '{key}' holds a non-numeric value"),
            )
        })?;
        Ok(Some((value, entry.expires_at)))
    }

    fn put_counter(&mut self, key: &str, value: u64, expires_at: Option<Instant>, now: Instant) {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.note_write(now);
    }

    fn note_write(&mut self, now: Instant) {
        self.writes = self.writes.wrapping_add(1);
        if self.writes % PURGE_EVERY_WRITES == 0 {
            self.entries.retain(|_, entry| entry.is_live(now));
        }
    }
}

#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<KvInner>>,
    operation_timeout: Duration,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    async fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, KvInner>, StorageError> {
        bounded(StoreBackend::Cache, operation, self.operation_timeout, async {
            Ok(self.inner.lock().await)
        })
        .await
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut guard = self.lock("get").await?;
        let now = Instant::now();
        Ok(guard.live(key, now).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock("set").await?;
        let now = Instant::now();
        guard.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        guard.note_write(now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.lock("delete").await?;
        guard.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StorageError> {
        let mut guard = self.lock("incr").await?;
        let now = Instant::now();
        let (next, expires_at) = match guard.counter(key, now)? {
            Some((current, expires_at)) => (current.saturating_add(1), expires_at),
            None => (1, Some(now + ttl)),
        };
        guard.put_counter(key, next, expires_at, now);
        Ok(next)
    }

    async fn decr(&self, key: &str) -> Result<u64, StorageError> {
        let mut guard = self.lock("decr").await?;
        let now = Instant::now();
        let Some((current, expires_at)) = guard.counter(key, now)? else {
            return Ok(0);
        };
        let next = current.saturating_sub(1);
        guard.put_counter(key, next, expires_at, now);
        Ok(next)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.lock("ping").await.map(|_| ())
    }
}
