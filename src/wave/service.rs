use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    clock::Clock,
    error::{GatewayError, internal_error, validation},
    identity::CallerIdentity,
    storage::RelationalStore,
    types::{CallerId, RecordId, new_record_id, sha256_hex},
    wave::analyzer::CoherenceAnalyzer,
};

pub const MAX_HISTORY_LIMIT: usize = 1_000;

/// One scored submission. The text itself is never stored, only its hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveAnalysis {
    pub id: RecordId,
    pub content_fingerprint: String,
    pub curl: f64,
    pub divergence: f64,
    pub potential: f64,
    pub coherence_score: f64,
    pub caller_id: CallerId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub content: Option<Value>,
}

impl AnalyzeRequest {
    /// Non-string content scores as empty text.
    pub fn text(&self) -> &str {
        match &self.content {
            Some(Value::String(text)) => text,
            _ => "",
        }
    }
}

pub struct WaveService {
    relational: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    analyzer: CoherenceAnalyzer,
    max_content_bytes: usize,
}

impl WaveService {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        clock: Arc<dyn Clock>,
        analyzer: CoherenceAnalyzer,
        max_content_bytes: usize,
    ) -> Self {
        Self {
            relational,
            clock,
            analyzer,
            max_content_bytes,
        }
    }

    pub async fn analyze(
        &self,
        caller: &CallerIdentity,
        text: &str,
    ) -> Result<WaveAnalysis, GatewayError> {
        if text.len() > self.max_content_bytes {
            return Err(validation(format!(
                "content exceeds {} bytes",
                self.max_content_bytes
            )));
        }

        // Scoring is CPU-bound; keep it off the async workers so request
        // deadlines still fire.
        let analyzer = self.analyzer.clone();
        let owned = text.to_owned();
        let metrics = tokio::task::spawn_blocking(move || analyzer.analyze(&owned))
            .await
            .map_err(|err| internal_error(format!("wave analysis worker failed: {err}")))?;
        let analysis = WaveAnalysis {
            id: new_record_id(),
            content_fingerprint: sha256_hex(text.as_bytes()),
            curl: metrics.curl,
            divergence: metrics.divergence,
            potential: metrics.potential,
            coherence_score: metrics.coherence_score,
            caller_id: caller.key_id.clone(),
            created_at: self.clock.now(),
        };
        self.relational.insert_wave_analysis(&analysis).await?;

        tracing::info!(
            target: "wave",
            analysis_id = %analysis.id,
            caller_id = %analysis.caller_id,
            policy = self.analyzer.policy_name(),
            coherence_score = analysis.coherence_score,
            content_bytes = text.len(),
            "wave_analyzed"
        );
        Ok(analysis)
    }

    pub async fn history(
        &self,
        caller: &CallerIdentity,
        limit: usize,
    ) -> Result<Vec<WaveAnalysis>, GatewayError> {
        if limit == 0 || limit > MAX_HISTORY_LIMIT {
            return Err(validation(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}"
            )));
        }
        Ok(self
            .relational
            .list_wave_analyses(&caller.key_id, limit)
            .await?)
    }
}
