use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{GatewayError, not_found, validation},
    storage::{KvStore, RelationalStore},
    types::{RecordId, new_record_id, sha256_hex},
};

const RAW_KEY_PREFIX: &str = "cg_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: RecordId,
    pub fingerprint: String,
    pub owner: String,
    pub tier: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub revoked: bool,
}

/// A freshly minted key. The raw value exists only here and is never stored.
#[derive(Debug, Clone)]
pub struct MintedKey {
    pub record: ApiKeyRecord,
    pub raw_key: String,
}

pub fn fingerprint(raw_key: &str) -> String {
    sha256_hex(raw_key.as_bytes())
}

pub fn mint_raw_key() -> String {
    format!(
        "{RAW_KEY_PREFIX}{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

pub fn key_cache_key(fingerprint: &str) -> String {
    format!("apikey:{fingerprint}")
}

/// Operator-side key management: keys are minted and revoked out-of-band,
/// never through the public HTTP surface.
pub struct KeyRegistry {
    relational: Arc<dyn RelationalStore>,
    cache: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl KeyRegistry {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            relational,
            cache,
            clock,
        }
    }

    pub async fn create(&self, owner: &str, tier: &str) -> Result<MintedKey, GatewayError> {
        let owner = owner.trim();
        let tier = tier.trim();
        if owner.is_empty() {
            return Err(validation("key owner label cannot be empty"));
        }
        if tier.is_empty() {
            return Err(validation("key tier cannot be empty"));
        }

        let raw_key = mint_raw_key();
        let record = ApiKeyRecord {
            id: new_record_id(),
            fingerprint: fingerprint(&raw_key),
            owner: owner.to_string(),
            tier: tier.to_string(),
            created_at: self.clock.now(),
            revoked: false,
        };
        self.relational.insert_api_key(&record).await?;

        tracing::info!(
            target: "identity",
            key_id = %record.id,
            owner = %record.owner,
            tier = %record.tier,
            "api_key_created"
        );
        Ok(MintedKey { record, raw_key })
    }

    pub async fn revoke(&self, id: &str) -> Result<ApiKeyRecord, GatewayError> {
        let mut record = self
            .relational
            .get_api_key(id)
            .await?
            .ok_or_else(|| not_found("api key", id))?;

        if !record.revoked {
            self.relational.revoke_api_key(id).await?;
            record.revoked = true;
        }

        if let Err(err) = self.cache.delete(&key_cache_key(&record.fingerprint)).await {
            tracing::warn!(
                target: "identity",
                key_id = %record.id,
                error = %err,
                "api_key_cache_invalidation_failed"
            );
            return Err(err.into());
        }

        tracing::info!(target: "identity", key_id = %record.id, "api_key_revoked");
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyRecord>, GatewayError> {
        Ok(self.relational.list_api_keys().await?)
    }
}
