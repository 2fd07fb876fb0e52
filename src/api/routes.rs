use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::{
    handlers::*,
    middleware::{authenticate_caller, enforce_deadline},
    state::AppState,
};

/// Every `/api` route except health sits behind key authentication and the
/// caller's quota.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/api/wave/analyze", post(analyze_wave))
        .route("/api/wave/history", get(wave_history))
        .route("/api/bump", post(create_marker).get(list_pending_markers))
        .route("/api/bump/:id", get(get_marker))
        .route("/api/bump/:id/acknowledge", post(acknowledge_marker))
        .route("/api/bump/:id/resolve", post(resolve_marker))
        .route("/api/awi", post(issue_grant))
        .route("/api/awi/check", get(check_grant))
        .route("/api/awi/:id", get(get_grant))
        .route("/api/awi/:id/revoke", post(revoke_grant))
        .route("/api/atom", post(create_task).get(list_molecule))
        .route("/api/atom/:id", get(get_task).patch(transition_task))
        .route("/api/context", post(store_context).get(query_context))
        .route(
            "/api/context/:id",
            get(get_context).patch(update_context_metadata),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            authenticate_caller,
        ));

    let mut router = Router::new()
        .route("/api/health", get(health))
        .merge(authenticated)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            enforce_deadline,
        ))
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes));

    if state.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
