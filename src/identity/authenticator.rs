use std::{sync::Arc, time::Duration};

use crate::{
    clock::Clock,
    config::IdentityConfig,
    error::{GatewayError, unauthenticated},
    identity::{
        CallerIdentity,
        keys::{ApiKeyRecord, fingerprint, key_cache_key},
    },
    storage::{KvStore, RelationalStore, StorageError},
    types::{from_unix_millis, to_unix_millis},
};

const LOCKOUT_HISTORY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingKey,
    InvalidKey,
    RevokedKey,
    LockedOut,
    StorageUnavailable,
}

impl AuthFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingKey => "missing_key",
            Self::InvalidKey => "invalid_key",
            Self::RevokedKey => "revoked_key",
            Self::LockedOut => "locked_out",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub key_cache_ttl: Duration,
    pub max_failures: u64,
    pub failure_window: Duration,
    pub lockout: Duration,
    pub max_lockout: Duration,
}

impl From<&IdentityConfig> for AuthPolicy {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            key_cache_ttl: Duration::from_secs(config.key_cache_ttl_seconds),
            max_failures: config.max_auth_failures.max(1),
            failure_window: Duration::from_secs(config.failure_window_seconds.max(1)),
            lockout: Duration::from_secs(config.lockout_seconds.max(1)),
            max_lockout: Duration::from_secs(
                config.max_lockout_seconds.max(config.lockout_seconds).max(1),
            ),
        }
    }
}

impl AuthPolicy {
    /// Lockout length for the `n`th lockout of a source: doubles each time,
    /// capped at `max_lockout`.
    pub fn lockout_for(&self, lockout_count: u64) -> Duration {
        let exponent = lockout_count.saturating_sub(1).min(31) as u32;
        self.lockout
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_lockout)
            .min(self.max_lockout)
    }
}

fn address_source(client_addr: &str) -> String {
    format!("addr:{client_addr}")
}

fn fingerprint_source(fingerprint: &str) -> String {
    format!("key:{fingerprint}")
}

fn failures_key(source: &str) -> String {
    format!("authfail:{source}")
}

fn lockout_key(source: &str) -> String {
    format!("lockout:{source}")
}

fn lockout_count_key(source: &str) -> String {
    format!("lockouts:{source}")
}

pub struct Authenticator {
    relational: Arc<dyn RelationalStore>,
    cache: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    policy: AuthPolicy,
}

impl Authenticator {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        policy: AuthPolicy,
    ) -> Self {
        Self {
            relational,
            cache,
            clock,
            policy,
        }
    }

    /// Resolves a raw `X-API-Key` value into a caller. Every rejection is the
    /// same generic auth error; the precise reason only reaches the logs.
    pub async fn authenticate(
        &self,
        raw_key: Option<&str>,
        client_addr: &str,
    ) -> Result<CallerIdentity, GatewayError> {
        let address = address_source(client_addr);
        let raw_key = raw_key.map(str::trim).filter(|key| !key.is_empty());
        let key_fingerprint = raw_key.map(fingerprint);
        let key_source = key_fingerprint.as_deref().map(fingerprint_source);

        for source in std::iter::once(&address).chain(key_source.as_ref()) {
            match self.lockout_remaining(source).await {
                Ok(None) => {}
                Ok(Some(remaining)) => {
                    self.log_rejection(AuthFailure::LockedOut, source);
                    return Err(unauthenticated().with_retry_after(remaining));
                }
                Err(err) => return Err(self.fail_closed(err, source)),
            }
        }

        let (Some(key_fingerprint), Some(key_source)) = (key_fingerprint, key_source) else {
            self.record_failure(&address).await;
            self.log_rejection(AuthFailure::MissingKey, &address);
            return Err(unauthenticated());
        };

        let record = match self.lookup(&key_fingerprint).await {
            Ok(record) => record,
            Err(err) => return Err(self.fail_closed(err, &key_source)),
        };

        match record {
            None => {
                self.record_failure(&address).await;
                self.log_rejection(AuthFailure::InvalidKey, &address);
                Err(unauthenticated())
            }
            Some(record) if record.revoked => {
                self.record_failure(&key_source).await;
                self.log_rejection(AuthFailure::RevokedKey, &key_source);
                Err(unauthenticated())
            }
            Some(record) => {
                self.reset_failures(&address).await;
                self.reset_failures(&key_source).await;
                Ok(CallerIdentity::from(&record))
            }
        }
    }

    async fn lookup(&self, key_fingerprint: &str) -> Result<Option<ApiKeyRecord>, StorageError> {
        let cache_key = key_cache_key(key_fingerprint);
        match self.cache.get(&cache_key).await {
            Ok(Some(cached)) => match serde_json::from_str::<ApiKeyRecord>(&cached) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    tracing::warn!(target: "identity", error = %err, "api_key_cache_entry_corrupt");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(target: "identity", error = %err, "api_key_cache_read_failed");
            }
        }

        let record = self
            .relational
            .find_api_key_by_fingerprint(key_fingerprint)
            .await?;

        if let Some(record) = &record
            && !record.revoked
            && let Ok(encoded) = serde_json::to_string(record)
            && let Err(err) = self
                .cache
                .set(&cache_key, encoded, Some(self.policy.key_cache_ttl))
                .await
        {
            tracing::warn!(target: "identity", error = %err, "api_key_cache_write_failed");
        }
        Ok(record)
    }

    async fn lockout_remaining(&self, source: &str) -> Result<Option<u64>, StorageError> {
        let Some(raw) = self.cache.get(&lockout_key(source)).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let until = raw.parse::<i64>().ok().and_then(from_unix_millis);
        let Some(until) = until else {
            // Unreadable lockouts still lock; the TTL clears them.
            return Ok(Some(self.policy.lockout.as_secs().max(1)));
        };
        if until <= now {
            return Ok(None);
        }
        let remaining_ms = (to_unix_millis(until) - to_unix_millis(now)).max(0) as u64;
        Ok(Some(remaining_ms.div_ceil(1_000).max(1)))
    }

    async fn record_failure(&self, source: &str) {
        let failures = match self
            .cache
            .incr(&failures_key(source), self.policy.failure_window)
            .await
        {
            Ok(failures) => failures,
            Err(err) => {
                tracing::warn!(
                    target: "identity",
                    source = %source,
                    error = %err,
                    "auth_failure_not_recorded"
                );
                return;
            }
        };
        if failures < self.policy.max_failures {
            return;
        }

        let lockouts = match self
            .cache
            .incr(&lockout_count_key(source), LOCKOUT_HISTORY)
            .await
        {
            Ok(lockouts) => lockouts,
            Err(err) => {
                // Without the history the lockout starts from the base length.
                tracing::warn!(
                    target: "identity",
                    source = %source,
                    error = %err,
                    "auth_lockout_history_unavailable"
                );
                1
            }
        };
        let duration = self.policy.lockout_for(lockouts);
        let until = self.clock.now() + duration;
        let engaged = self
            .cache
            .set(
                &lockout_key(source),
                to_unix_millis(until).to_string(),
                Some(duration),
            )
            .await;
        if let Err(err) = self.cache.delete(&failures_key(source)).await {
            tracing::warn!(
                target: "identity",
                source = %source,
                error = %err,
                "auth_failure_reset_failed"
            );
        }

        match engaged {
            Ok(()) => tracing::warn!(
                target: "identity",
                source = %source,
                failures,
                lockouts,
                lockout_seconds = duration.as_secs(),
                "auth_lockout_engaged"
            ),
            Err(err) => tracing::warn!(
                target: "identity",
                source = %source,
                error = %err,
                "auth_lockout_not_recorded"
            ),
        }
    }

    async fn reset_failures(&self, source: &str) {
        if let Err(err) = self.cache.delete(&failures_key(source)).await {
            tracing::warn!(
                target: "identity",
                source = %source,
                error = %err,
                "auth_failure_reset_failed"
            );
        }
    }

    fn fail_closed(&self, err: StorageError, source: &str) -> GatewayError {
        tracing::warn!(
            target: "identity",
            source = %source,
            reason = AuthFailure::StorageUnavailable.as_str(),
            error = %err,
            "auth_failed_closed"
        );
        unauthenticated()
    }

    fn log_rejection(&self, reason: AuthFailure, source: &str) {
        tracing::info!(
            target: "identity",
            source = %source,
            reason = reason.as_str(),
            "auth_rejected"
        );
    }
}
