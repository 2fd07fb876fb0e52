use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::{
    clock::Clock,
    config::Config,
    error::{GatewayError, rate_limited},
    identity::CallerIdentity,
    storage::{KvStore, StorageError},
    types::to_unix_millis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRule {
    pub max_requests: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow { limit: u64, remaining: u64 },
    Limited { retry_after_seconds: u64 },
}

fn bucket_key(caller_id: &str, bucket: i64) -> String {
    format!("quota:{caller_id}:{bucket}")
}

/// Sliding-window quota approximated from two fixed buckets: the previous
/// bucket's count weighted by how much of it still overlaps the window, plus
/// the current bucket's count.
pub struct RateLimiter {
    cache: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    default_rule: QuotaRule,
    tier_rules: BTreeMap<String, QuotaRule>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn KvStore>, clock: Arc<dyn Clock>, default_rule: QuotaRule) -> Self {
        Self {
            cache,
            clock,
            default_rule,
            tier_rules: BTreeMap::new(),
        }
    }

    pub fn from_config(cache: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let (max_requests, window) = config.quota_for_tier("");
        let mut limiter = Self::new(
            cache,
            clock,
            QuotaRule {
                max_requests,
                window,
            },
        );
        for tier in config.tiers.keys() {
            let (max_requests, window) = config.quota_for_tier(tier);
            limiter = limiter.with_tier(
                tier,
                QuotaRule {
                    max_requests,
                    window,
                },
            );
        }
        limiter
    }

    pub fn with_tier(mut self, tier: impl Into<String>, rule: QuotaRule) -> Self {
        self.tier_rules.insert(tier.into(), rule);
        self
    }

    pub fn rule_for(&self, tier: &str) -> QuotaRule {
        self.tier_rules
            .get(tier)
            .copied()
            .unwrap_or(self.default_rule)
    }

    pub async fn check_quota(&self, caller: &CallerIdentity) -> QuotaDecision {
        match self.evaluate(caller).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    target: "identity",
                    caller_id = %caller.key_id,
                    error = %err,
                    "quota_failed_closed"
                );
                QuotaDecision::Limited {
                    retry_after_seconds: 1,
                }
            }
        }
    }

    /// Like [`Self::check_quota`], mapped onto the gateway error taxonomy.
    pub async fn enforce(&self, caller: &CallerIdentity) -> Result<u64, GatewayError> {
        match self.check_quota(caller).await {
            QuotaDecision::Allow { remaining, .. } => Ok(remaining),
            QuotaDecision::Limited {
                retry_after_seconds,
            } => {
                tracing::info!(
                    target: "identity",
                    caller_id = %caller.key_id,
                    tier = %caller.tier,
                    retry_after_seconds,
                    "quota_exceeded"
                );
                Err(rate_limited(retry_after_seconds))
            }
        }
    }

    async fn evaluate(&self, caller: &CallerIdentity) -> Result<QuotaDecision, StorageError> {
        let rule = self.rule_for(&caller.tier);
        let window_ms = (rule.window.as_millis() as i64).max(1);
        let now_ms = to_unix_millis(self.clock.now());
        let bucket = now_ms.div_euclid(window_ms);
        let elapsed_ms = now_ms.rem_euclid(window_ms);
        let current_key = bucket_key(&caller.key_id, bucket);

        let current = self.cache.incr(&current_key, rule.window * 2).await?;
        let previous = self
            .cache
            .get(&bucket_key(&caller.key_id, bucket - 1))
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        let window = SlidingWindow {
            window_ms: window_ms as f64,
            elapsed_ms: elapsed_ms as f64,
            max_requests: rule.max_requests as f64,
        };
        let estimate = window.estimate(previous as f64, current as f64, 0.0);

        if estimate > window.max_requests + ESTIMATE_SLACK {
            // Rejected requests are not charged.
            let current = self.cache.decr(&current_key).await?;
            let retry_after_ms = window.retry_after_ms(previous as f64, current as f64);
            return Ok(QuotaDecision::Limited {
                retry_after_seconds: (retry_after_ms.ceil() as u64).div_ceil(1_000).max(1),
            });
        }

        Ok(QuotaDecision::Allow {
            limit: rule.max_requests,
            remaining: rule
                .max_requests
                .saturating_sub((estimate - ESTIMATE_SLACK).ceil().max(0.0) as u64),
        })
    }
}

/// Absorbs float noise in the weighted estimate.
const ESTIMATE_SLACK: f64 = 1e-9;

/// Two-bucket approximation of a sliding window, in milliseconds.
struct SlidingWindow {
    window_ms: f64,
    elapsed_ms: f64,
    max_requests: f64,
}

impl SlidingWindow {
    /// Weighted request count `after_ms` from now, with no further requests.
    fn estimate(&self, previous: f64, current: f64, after_ms: f64) -> f64 {
        let overlap = (self.window_ms - self.elapsed_ms - after_ms) / self.window_ms;
        previous * overlap.max(0.0) + current
    }

    /// Time until one more request fits under the ceiling.
    fn retry_after_ms(&self, previous: f64, current: f64) -> f64 {
        let headroom = self.max_requests - 1.0;
        let bucket_left = self.window_ms - self.elapsed_ms;

        // Still inside this bucket: wait for the previous bucket to fade.
        if previous > 0.0 && current <= headroom {
            let wait = bucket_left - (headroom - current) * self.window_ms / previous;
            if wait < bucket_left {
                return wait.max(0.0);
            }
        }

        // Next bucket: this bucket's count becomes the fading one.
        if headroom < 0.0 {
            return bucket_left + self.window_ms;
        }
        let fade = if current > headroom {
            self.window_ms - headroom * self.window_ms / current
        } else {
            0.0
        };
        bucket_left + fade.max(0.0)
    }
}
