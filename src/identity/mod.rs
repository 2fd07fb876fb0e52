pub mod authenticator;
pub mod keys;
pub mod rate_limit;

use serde::{Deserialize, Serialize};

use crate::types::CallerId;

pub use authenticator::{AuthFailure, AuthPolicy, Authenticator};
pub use keys::{ApiKeyRecord, KeyRegistry, MintedKey, fingerprint, mint_raw_key};
pub use rate_limit::{QuotaDecision, QuotaRule, RateLimiter};

/// Who is calling, resolved from a valid, unrevoked API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub key_id: CallerId,
    pub owner: String,
    pub tier: String,
}

impl From<&ApiKeyRecord> for CallerIdentity {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            key_id: record.id.clone(),
            owner: record.owner.clone(),
            tier: record.tier.clone(),
        }
    }
}
