use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use validator::ValidationErrors;

use crate::storage::{StorageError, StorageErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    InvalidTransition,
    AlreadyResolved,
    RateLimited,
    StorageUnavailable,
    Timeout,
    Internal,
}

impl GatewayErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Auth => "auth_error",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::InvalidTransition => "invalid_transition",
            Self::AlreadyResolved => "already_resolved",
            Self::RateLimited => "rate_limited",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidTransition | Self::AlreadyResolved => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    pub details: Option<Value>,
    pub retry_after_seconds: Option<u64>,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after_seconds: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }
}

pub fn validation(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Validation, message)
}

pub fn not_found(resource: &str, id: &str) -> GatewayError {
    GatewayError::new(
        GatewayErrorKind::NotFound,
        format!("{resource} '{id}' was not found"),
    )
}

pub fn forbidden(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Forbidden, message)
}

pub fn invalid_transition(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::InvalidTransition, message)
}

pub fn already_resolved(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::AlreadyResolved, message)
}

pub fn unauthenticated() -> GatewayError {
    GatewayError::new(GatewayErrorKind::Auth, "authentication failed")
}

pub fn rate_limited(retry_after_seconds: u64) -> GatewayError {
    GatewayError::new(GatewayErrorKind::RateLimited, "too many requests")
        .with_retry_after(retry_after_seconds)
        .with_details(serde_json::json!({ "retryAfterSeconds": retry_after_seconds }))
}

pub fn timeout(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Timeout, message)
}

pub fn internal_error(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Internal, message)
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            StorageErrorKind::Unavailable => GatewayError::new(
                GatewayErrorKind::StorageUnavailable,
                format!("{} store unavailable", err.backend),
            ),
            StorageErrorKind::Conflict | StorageErrorKind::Corrupt => {
                internal_error(err.to_string())
            }
        }
    }
}

impl From<ValidationErrors> for GatewayError {
    fn from(errors: ValidationErrors) -> Self {
        let details = serde_json::to_value(&errors).unwrap_or(Value::Null);
        validation(format!("request validation failed: {errors}")).with_details(details)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(
            self.kind,
            GatewayErrorKind::StorageUnavailable | GatewayErrorKind::Internal
        ) {
            tracing::warn!(
                target: "http",
                kind = self.kind.as_str(),
                error = %self.message,
                "request_failed"
            );
        }

        let status = self.status_code();
        let retry_after = self.retry_after_seconds;
        let body = ErrorBody {
            error: self.kind.as_str().to_string(),
            message: self.message,
            details: self.details,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}
