use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{api::state::AppState, error::timeout};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");

fn client_address(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolves the caller from `X-API-Key`, charges its quota and hands the
/// identity to handlers through request extensions.
pub async fn authenticate_caller(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let client_addr = client_address(&request);
    let raw_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let caller = match state
        .authenticator
        .authenticate(raw_key.as_deref(), &client_addr)
        .await
    {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let remaining = match state.rate_limiter.enforce(&caller).await {
        Ok(remaining) => remaining,
        Err(err) => return err.into_response(),
    };

    request.extensions_mut().insert(caller);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    response
}

/// Bounds the whole request. Work already handed to storage finishes on its
/// own; the client sees a timeout either way.
pub async fn enforce_deadline(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = state.request_timeout;
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                target: "http",
                method = %method,
                path = %path,
                deadline_ms = deadline.as_millis() as u64,
                "request_deadline_exceeded"
            );
            timeout(format!(
                "request exceeded its {}ms deadline",
                deadline.as_millis()
            ))
            .into_response()
        }
    }
}
