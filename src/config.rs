use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::awi::AuthorizationLevel;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tiers: BTreeMap<String, TierConfig>,
    #[serde(default)]
    pub wave: WaveConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_enabled_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_enabled_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./state/gateway.sqlite3")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./state/blobs")
}

fn default_operation_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_dir: default_blob_dir(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_key_cache_ttl_seconds() -> u64 {
    60
}

fn default_max_auth_failures() -> u64 {
    5
}

fn default_failure_window_seconds() -> u64 {
    300
}

fn default_lockout_seconds() -> u64 {
    60
}

fn default_max_lockout_seconds() -> u64 {
    3_600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_key_cache_ttl_seconds")]
    pub key_cache_ttl_seconds: u64,
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u64,
    #[serde(default = "default_failure_window_seconds")]
    pub failure_window_seconds: u64,
    #[serde(default = "default_lockout_seconds")]
    pub lockout_seconds: u64,
    #[serde(default = "default_max_lockout_seconds")]
    pub max_lockout_seconds: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_cache_ttl_seconds: default_key_cache_ttl_seconds(),
            max_auth_failures: default_max_auth_failures(),
            failure_window_seconds: default_failure_window_seconds(),
            lockout_seconds: default_lockout_seconds(),
            max_lockout_seconds: default_max_lockout_seconds(),
        }
    }
}

fn default_window_seconds() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_requests: default_max_requests(),
        }
    }
}

/// Per-tier overrides. Unset fields fall back to `rate_limit`; a tier without
/// `grant_authority` may only issue grants backed by a grant of its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub window_seconds: Option<u64>,
    #[serde(default)]
    pub grant_authority: Option<AuthorizationLevel>,
}

fn default_max_content_bytes() -> usize {
    256 * 1024
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveConfig {
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
            default_history_limit: default_history_limit(),
        }
    }
}

fn default_promote_after_reads() -> u64 {
    3
}

fn default_promoted_ttl_seconds() -> u64 {
    300
}

fn default_read_counter_ttl_seconds() -> u64 {
    3_600
}

fn default_query_page_size() -> usize {
    50
}

fn default_max_query_limit() -> usize {
    1_000
}

fn default_gc_interval_seconds() -> u64 {
    3_600
}

fn default_gc_grace_seconds() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "default_promote_after_reads")]
    pub promote_after_reads: u64,
    #[serde(default = "default_promoted_ttl_seconds")]
    pub promoted_ttl_seconds: u64,
    #[serde(default = "default_read_counter_ttl_seconds")]
    pub read_counter_ttl_seconds: u64,
    #[serde(default = "default_query_page_size")]
    pub query_page_size: usize,
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: usize,
    #[serde(default = "default_enabled_true")]
    pub gc_enabled: bool,
    #[serde(default = "default_gc_interval_seconds")]
    pub gc_interval_seconds: u64,
    #[serde(default = "default_gc_grace_seconds")]
    pub gc_grace_seconds: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
            promote_after_reads: default_promote_after_reads(),
            promoted_ttl_seconds: default_promoted_ttl_seconds(),
            read_counter_ttl_seconds: default_read_counter_ttl_seconds(),
            query_page_size: default_query_page_size(),
            max_query_limit: default_max_query_limit(),
            gc_enabled: true,
            gc_interval_seconds: default_gc_interval_seconds(),
            gc_grace_seconds: default_gc_grace_seconds(),
        }
    }
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs/gateway")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_logging_retention_days() -> usize {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default = "default_logging_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_enabled_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: default_logging_rotation(),
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(config_value).context("failed to deserialize gateway config")?;

        for path in [
            &mut config.storage.database_path,
            &mut config.storage.blob_dir,
            &mut config.logging.dir,
        ] {
            if !path.is_absolute() {
                *path = config_base.join(&*path);
            }
        }

        Ok(config)
    }

    /// Effective quota for a tier: `(max_requests, window)`.
    pub fn quota_for_tier(&self, tier: &str) -> (u64, Duration) {
        let tier = self.tiers.get(tier);
        let max_requests = tier
            .and_then(|tier| tier.max_requests)
            .unwrap_or(self.rate_limit.max_requests);
        let window_seconds = tier
            .and_then(|tier| tier.window_seconds)
            .unwrap_or(self.rate_limit.window_seconds);
        (max_requests, Duration::from_secs(window_seconds.max(1)))
    }

    pub fn grant_authority_for_tier(&self, tier: &str) -> Option<AuthorizationLevel> {
        self.tiers.get(tier).and_then(|tier| tier.grant_authority)
    }
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let local_default = config_base.join("gateway.schema.json");
    if local_default.exists() {
        return Ok(local_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or gateway.schema.json next to it"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
