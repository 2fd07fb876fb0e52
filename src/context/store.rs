use std::{collections::VecDeque, pin::Pin, sync::Arc, time::Duration};

use futures_core::Stream;
use futures_util::stream;

use crate::{
    clock::Clock,
    config::KnowledgeConfig,
    context::types::{ContextEntry, ContextFilter, StoreContextRequest, blob_key_for},
    error::{GatewayError, internal_error, not_found, validation},
    identity::CallerIdentity,
    storage::{ContextPageRequest, Storage},
    types::{JsonObject, json_depth, new_record_id, sha256_hex},
};

const MAX_METADATA_DEPTH: usize = 16;
const MAX_SIGNAL_CHARS: usize = 64;

pub type ContextStream = Pin<Box<dyn Stream<Item = Result<ContextEntry, GatewayError>> + Send>>;

fn entry_cache_key(id: &str) -> String {
    format!("context:entry:{id}")
}

fn read_counter_key(id: &str) -> String {
    format!("context:reads:{id}")
}

#[derive(Debug, Clone)]
pub struct KnowledgeSettings {
    pub max_content_bytes: usize,
    pub promote_after_reads: u64,
    pub promoted_ttl: Duration,
    pub read_counter_ttl: Duration,
    pub page_size: usize,
    pub max_query_limit: usize,
}

impl From<&KnowledgeConfig> for KnowledgeSettings {
    fn from(config: &KnowledgeConfig) -> Self {
        Self {
            max_content_bytes: config.max_content_bytes,
            promote_after_reads: config.promote_after_reads.max(1),
            promoted_ttl: Duration::from_secs(config.promoted_ttl_seconds),
            read_counter_ttl: Duration::from_secs(config.read_counter_ttl_seconds),
            page_size: config.query_page_size.max(1),
            max_query_limit: config.max_query_limit.max(1),
        }
    }
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self::from(&KnowledgeConfig::default())
    }
}

fn check_metadata(metadata: &JsonObject) -> Result<(), GatewayError> {
    let depth = 1 + metadata.values().map(json_depth).max().unwrap_or(0);
    if depth > MAX_METADATA_DEPTH {
        return Err(validation(format!(
            "metadata nests deeper than {MAX_METADATA_DEPTH} levels"
        )));
    }
    Ok(())
}

fn normalize_signals(signals: Vec<String>) -> Result<Vec<String>, GatewayError> {
    let mut normalized: Vec<String> = Vec::with_capacity(signals.len());
    for signal in signals {
        let signal = signal.trim();
        if signal.is_empty() || signal.chars().count() > MAX_SIGNAL_CHARS {
            return Err(validation(format!(
                "signals must be 1 to {MAX_SIGNAL_CHARS} characters"
            )));
        }
        if !normalized.iter().any(|existing| existing == signal) {
            normalized.push(signal.to_string());
        }
    }
    Ok(normalized)
}

async fn hydrate(storage: &Storage, mut entry: ContextEntry) -> Result<ContextEntry, GatewayError> {
    let bytes = storage
        .blob
        .get(&entry.content_ref)
        .await?
        .ok_or_else(|| {
            internal_error(format!(
                "content blob '{}' for entry '{}' is missing",
                entry.content_ref, entry.id
            ))
        })?;
    let content = String::from_utf8(bytes).map_err(|_| {
        internal_error(format!("content blob '{}' is not utf-8", entry.content_ref))
    })?;
    entry.content = Some(content);
    Ok(entry)
}

/// Metadata in the relational store, content in the blob store, hot entries
/// promoted into the cache.
#[derive(Clone)]
pub struct KnowledgeStore {
    storage: Storage,
    clock: Arc<dyn Clock>,
    settings: KnowledgeSettings,
}

impl KnowledgeStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, settings: KnowledgeSettings) -> Self {
        Self {
            storage,
            clock,
            settings,
        }
    }

    /// Writes the blob first and the row second, so a visible row always has
    /// its content. A failed row write leaves an orphan blob for the sweeper.
    pub async fn store(
        &self,
        caller: &CallerIdentity,
        request: StoreContextRequest,
    ) -> Result<ContextEntry, GatewayError> {
        let domain = request.domain.trim();
        if domain.is_empty() {
            return Err(validation("domain must not be blank"));
        }
        if request.content.len() > self.settings.max_content_bytes {
            return Err(validation(format!(
                "content exceeds {} bytes",
                self.settings.max_content_bytes
            )));
        }
        check_metadata(&request.metadata)?;
        let signals = normalize_signals(request.signals)?;

        let id = new_record_id();
        let content_ref = blob_key_for(&id);
        let content = request.content.into_bytes();
        let now = self.clock.now();
        let entry = ContextEntry {
            id,
            domain: domain.to_string(),
            metadata: request.metadata,
            content_ref,
            content_sha256: sha256_hex(&content),
            content_bytes: content.len() as u64,
            signals,
            caller_id: caller.key_id.clone(),
            created_at: now,
            updated_at: now,
            content: None,
        };

        self.storage.blob.put(&entry.content_ref, content).await?;
        if let Err(err) = self.storage.relational.insert_context_entry(&entry).await {
            tracing::warn!(
                target: "context",
                entry_id = %entry.id,
                blob_key = %entry.content_ref,
                error = %err,
                "context_row_write_failed"
            );
            return Err(err.into());
        }

        tracing::info!(
            target: "context",
            entry_id = %entry.id,
            domain = %entry.domain,
            content_bytes = entry.content_bytes,
            signals = entry.signals.len(),
            "context_stored"
        );
        Ok(entry)
    }

    /// Read-through: promoted entries come from the cache; others from the
    /// relational store, counting content reads toward promotion.
    pub async fn get(&self, id: &str, include_content: bool) -> Result<ContextEntry, GatewayError> {
        if let Some(mut cached) = self.cached_entry(id).await {
            if !include_content {
                cached.content = None;
                return Ok(cached);
            }
            if cached.content.is_some() {
                return Ok(cached);
            }
            return hydrate(&self.storage, cached).await;
        }

        let entry = self
            .storage
            .relational
            .get_context_entry(id)
            .await?
            .ok_or_else(|| not_found("context entry", id))?;
        if !include_content {
            return Ok(entry);
        }

        let entry = hydrate(&self.storage, entry).await?;
        self.note_read(&entry).await;
        Ok(entry)
    }

    pub async fn update_metadata(
        &self,
        id: &str,
        metadata: JsonObject,
    ) -> Result<ContextEntry, GatewayError> {
        check_metadata(&metadata)?;
        let now = self.clock.now();
        let updated = self
            .storage
            .relational
            .update_context_metadata(id, &metadata, now)
            .await?;
        if !updated {
            return Err(not_found("context entry", id));
        }

        if let Err(err) = self.storage.cache.delete(&entry_cache_key(id)).await {
            tracing::warn!(
                target: "context",
                entry_id = %id,
                error = %err,
                "context_cache_invalidation_failed"
            );
            return Err(err.into());
        }

        tracing::info!(target: "context", entry_id = %id, "context_metadata_updated");
        self.storage
            .relational
            .get_context_entry(id)
            .await?
            .ok_or_else(|| not_found("context entry", id))
    }

    /// Lazily pages rows in id order. The stream ends after `limit` entries,
    /// when the store runs out, or after the first error. Resume with the last
    /// seen id as `after`.
    pub fn query(&self, filter: ContextFilter) -> Result<ContextStream, GatewayError> {
        if filter.domain.trim().is_empty() {
            return Err(validation("domain must not be blank"));
        }
        let max_limit = self.settings.max_query_limit;
        let limit = match filter.limit {
            Some(0) => return Err(validation("limit must be at least 1")),
            Some(limit) if limit > max_limit => {
                return Err(validation(format!("limit must not exceed {max_limit}")));
            }
            Some(limit) => limit,
            None => max_limit,
        };

        let cursor = QueryCursor {
            storage: self.storage.clone(),
            domain: filter.domain,
            signal: filter.signal,
            after: filter.after,
            remaining: limit,
            page_size: self.settings.page_size,
            include_content: filter.include_content,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        Ok(Box::pin(stream::try_unfold(cursor, QueryCursor::advance)))
    }

    async fn cached_entry(&self, id: &str) -> Option<ContextEntry> {
        match self.storage.cache.get(&entry_cache_key(id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<ContextEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(
                        target: "context",
                        entry_id = %id,
                        error = %err,
                        "context_cache_entry_corrupt"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    target: "context",
                    entry_id = %id,
                    error = %err,
                    "context_cache_read_failed"
                );
                None
            }
        }
    }

    async fn note_read(&self, entry: &ContextEntry) {
        let reads = match self
            .storage
            .cache
            .incr(&read_counter_key(&entry.id), self.settings.read_counter_ttl)
            .await
        {
            Ok(reads) => reads,
            Err(err) => {
                tracing::warn!(
                    target: "context",
                    entry_id = %entry.id,
                    error = %err,
                    "context_read_count_failed"
                );
                return;
            }
        };
        if reads < self.settings.promote_after_reads {
            return;
        }

        let Ok(encoded) = serde_json::to_string(entry) else {
            return;
        };
        match self
            .storage
            .cache
            .set(
                &entry_cache_key(&entry.id),
                encoded,
                Some(self.settings.promoted_ttl),
            )
            .await
        {
            Ok(()) => tracing::info!(
                target: "context",
                entry_id = %entry.id,
                reads,
                "context_promoted"
            ),
            Err(err) => tracing::warn!(
                target: "context",
                entry_id = %entry.id,
                error = %err,
                "context_promotion_failed"
            ),
        }
    }
}

struct QueryCursor {
    storage: Storage,
    domain: String,
    signal: Option<String>,
    after: Option<String>,
    remaining: usize,
    page_size: usize,
    include_content: bool,
    buffered: VecDeque<ContextEntry>,
    exhausted: bool,
}

impl QueryCursor {
    async fn advance(mut self) -> Result<Option<(ContextEntry, Self)>, GatewayError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        if self.buffered.is_empty() && !self.exhausted {
            let want = self.page_size.min(self.remaining);
            let page = self
                .storage
                .relational
                .page_context_entries(ContextPageRequest {
                    domain: &self.domain,
                    signal: self.signal.as_deref(),
                    after: self.after.as_deref(),
                    limit: want,
                })
                .await?;
            self.exhausted = page.len() < want;
            if let Some(last) = page.last() {
                self.after = Some(last.id.clone());
            }
            self.buffered.extend(page);
        }

        let Some(entry) = self.buffered.pop_front() else {
            return Ok(None);
        };
        let entry = if self.include_content {
            hydrate(&self.storage, entry).await?
        } else {
            entry
        };
        self.remaining -= 1;
        Ok(Some((entry, self)))
    }
}
