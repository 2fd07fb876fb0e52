use std::{collections::BTreeMap, sync::Arc};

use time::OffsetDateTime;
use validator::Validate;

use crate::{
    awi::types::{AuthorizationLevel, AwiGrant, DenialReason, GrantDecision, IssueGrantRequest},
    clock::Clock,
    config::Config,
    error::{GatewayError, forbidden, not_found, validation},
    identity::CallerIdentity,
    storage::RelationalStore,
    types::new_record_id,
};

pub fn is_honored(grant: &AwiGrant, now: OffsetDateTime) -> bool {
    !grant.revoked && grant.expires_at.is_none_or(|expires_at| expires_at > now)
}

/// Evaluates each grant in order: revoked, then expired, then level. Any
/// passing grant allows; otherwise the reason from the grant that got furthest
/// through the checks is reported.
pub fn evaluate_grants(
    grants: &[AwiGrant],
    required: AuthorizationLevel,
    now: OffsetDateTime,
) -> GrantDecision {
    let mut furthest = DenialReason::NoGrant;
    for grant in grants {
        let reason = if grant.revoked {
            DenialReason::Revoked
        } else if grant.expires_at.is_some_and(|expires_at| expires_at <= now) {
            DenialReason::Expired
        } else if grant.level < required {
            DenialReason::InsufficientLevel
        } else {
            return GrantDecision::allowed();
        };
        furthest = furthest.max(reason);
    }
    GrantDecision::denied(furthest)
}

pub struct GrantIssuer {
    relational: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    tier_authority: BTreeMap<String, AuthorizationLevel>,
}

impl GrantIssuer {
    pub fn new(relational: Arc<dyn RelationalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            relational,
            clock,
            tier_authority: BTreeMap::new(),
        }
    }

    pub fn from_config(
        relational: Arc<dyn RelationalStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        config
            .tiers
            .keys()
            .fold(Self::new(relational, clock), |issuer, tier| {
                match config.grant_authority_for_tier(tier) {
                    Some(level) => issuer.with_tier_authority(tier, level),
                    None => issuer,
                }
            })
    }

    pub fn with_tier_authority(mut self, tier: impl Into<String>, level: AuthorizationLevel) -> Self {
        self.tier_authority.insert(tier.into(), level);
        self
    }

    /// The highest level a caller may act with: its tier's bootstrap
    /// authority or any honored grant held by its owner label.
    pub async fn caller_authority(
        &self,
        caller: &CallerIdentity,
    ) -> Result<Option<AuthorizationLevel>, GatewayError> {
        let now = self.clock.now();
        let bootstrap = self.tier_authority.get(&caller.tier).copied();
        let granted = self
            .relational
            .list_grants_for_subject(&caller.owner)
            .await?
            .into_iter()
            .filter(|grant| is_honored(grant, now))
            .map(|grant| grant.level)
            .max();
        Ok(bootstrap.max(granted))
    }

    pub async fn issue_grant(
        &self,
        caller: &CallerIdentity,
        request: IssueGrantRequest,
    ) -> Result<AwiGrant, GatewayError> {
        request.validate()?;
        let now = self.clock.now();
        if let Some(expires_at) = request.expires_at
            && expires_at <= now
        {
            return Err(validation("expiresAt must be in the future"));
        }

        let authority = self.caller_authority(caller).await?;
        if authority.is_none_or(|authority| authority < request.level) {
            tracing::info!(
                target: "awi",
                caller_id = %caller.key_id,
                requested_level = request.level.as_str(),
                authority = authority.map(AuthorizationLevel::as_str),
                "grant_issue_denied"
            );
            return Err(forbidden(format!(
                "caller may not issue grants at level '{}'",
                request.level
            )));
        }

        let grant = AwiGrant {
            id: new_record_id(),
            subject: request.subject.trim().to_string(),
            level: request.level,
            intent: request.intent.trim().to_string(),
            constraints: request.constraints,
            issued_by: caller.key_id.clone(),
            issued_at: now,
            expires_at: request.expires_at,
            revoked: false,
            revoked_at: None,
        };
        self.relational.insert_grant(&grant).await?;

        tracing::info!(
            target: "awi",
            grant_id = %grant.id,
            subject = %grant.subject,
            level = grant.level.as_str(),
            issued_by = %grant.issued_by,
            constraints = grant.constraints.len(),
            "grant_issued"
        );
        Ok(grant)
    }

    pub async fn check_grant(
        &self,
        subject: &str,
        required: AuthorizationLevel,
    ) -> Result<GrantDecision, GatewayError> {
        let grants = self.relational.list_grants_for_subject(subject).await?;
        let decision = evaluate_grants(&grants, required, self.clock.now());
        tracing::debug!(
            target: "awi",
            subject = %subject,
            required = required.as_str(),
            allowed = decision.allowed,
            reason = decision.reason.map(DenialReason::as_str),
            "grant_checked"
        );
        Ok(decision)
    }

    pub async fn get_grant(&self, id: &str) -> Result<AwiGrant, GatewayError> {
        self.relational
            .get_grant(id)
            .await?
            .ok_or_else(|| not_found("grant", id))
    }

    pub async fn revoke_grant(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<AwiGrant, GatewayError> {
        let grant = self.get_grant(id).await?;
        if grant.revoked {
            return Ok(grant);
        }

        let is_issuer = grant.issued_by == caller.key_id;
        let outranks = self
            .caller_authority(caller)
            .await?
            .is_some_and(|authority| authority > grant.level);
        if !is_issuer && !outranks {
            tracing::info!(
                target: "awi",
                grant_id = %grant.id,
                caller_id = %caller.key_id,
                "grant_revoke_denied"
            );
            return Err(forbidden("only the issuer or a higher authority may revoke"));
        }

        let now = self.clock.now();
        if self.relational.revoke_grant(id, now).await? {
            tracing::info!(
                target: "awi",
                grant_id = %grant.id,
                revoked_by = %caller.key_id,
                "grant_revoked"
            );
        }
        self.get_grant(id).await
    }
}
