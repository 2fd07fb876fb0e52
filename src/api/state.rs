use std::{sync::Arc, time::Duration};

use crate::{
    atom::TaskTracker,
    awi::GrantIssuer,
    bump::HandoffBroker,
    clock::Clock,
    config::Config,
    context::{KnowledgeSettings, KnowledgeStore},
    identity::{AuthPolicy, Authenticator, RateLimiter},
    storage::Storage,
    wave::{CoherenceAnalyzer, WaveService},
};

/// Everything a request handler may touch. Holds no mutable domain state of
/// its own; all of it lives behind the stores.
pub struct AppState {
    pub storage: Storage,
    pub authenticator: Authenticator,
    pub rate_limiter: RateLimiter,
    pub wave: WaveService,
    pub broker: HandoffBroker,
    pub grants: GrantIssuer,
    pub tasks: TaskTracker,
    pub knowledge: KnowledgeStore,
    pub request_timeout: Duration,
    pub health_budget: Duration,
    pub default_history_limit: usize,
    pub max_body_bytes: usize,
    pub enable_cors: bool,
}

impl AppState {
    pub fn from_config(config: &Config, storage: Storage, clock: Arc<dyn Clock>) -> Self {
        let relational = Arc::clone(&storage.relational);
        let cache = Arc::clone(&storage.cache);

        Self {
            authenticator: Authenticator::new(
                Arc::clone(&relational),
                Arc::clone(&cache),
                Arc::clone(&clock),
                AuthPolicy::from(&config.identity),
            ),
            rate_limiter: RateLimiter::from_config(cache, Arc::clone(&clock), config),
            wave: WaveService::new(
                Arc::clone(&relational),
                Arc::clone(&clock),
                CoherenceAnalyzer::default(),
                config.wave.max_content_bytes,
            ),
            broker: HandoffBroker::new(Arc::clone(&relational), Arc::clone(&clock)),
            grants: GrantIssuer::from_config(Arc::clone(&relational), Arc::clone(&clock), config),
            tasks: TaskTracker::new(relational, Arc::clone(&clock)),
            knowledge: KnowledgeStore::new(
                storage.clone(),
                clock,
                KnowledgeSettings::from(&config.knowledge),
            ),
            storage,
            request_timeout: config.server.request_timeout(),
            health_budget: config.storage.operation_timeout(),
            default_history_limit: config.wave.default_history_limit,
            max_body_bytes: config.server.max_body_bytes,
            enable_cors: config.server.enable_cors,
        }
    }
}
