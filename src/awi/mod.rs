pub mod issuer;
pub mod types;

pub use issuer::{GrantIssuer, evaluate_grants, is_honored};
pub use types::{
    AuthorizationLevel, AwiGrant, ConstraintKind, DenialReason, GrantConstraint, GrantDecision,
    IssueGrantRequest,
};
