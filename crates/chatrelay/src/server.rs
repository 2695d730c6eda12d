use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::challenge::ChallengeStore;
use crate::dispatch::MessageDispatcher;
use crate::handlers;
use crate::session::SessionRegistry;

// ============================================================================
// Runtime Services
// ============================================================================

/// Shared runtime services used across handlers and the janitor.
#[derive(Clone)]
pub struct RuntimeServices {
    pub registry: SessionRegistry,
    pub challenges: ChallengeStore,
    pub dispatcher: MessageDispatcher,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: RuntimeServices,
    /// How long the challenge endpoint waits for a challenge to appear.
    pub challenge_wait: Duration,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64, max_connections: usize) -> Router {
    let api_routes = Router::new()
        .route("/sessions", get(handlers::v1::list_sessions))
        .route(
            "/sessions/{identity}/status",
            get(handlers::v1::session_status),
        )
        .route(
            "/sessions/{identity}/challenge",
            get(handlers::v1::session_challenge),
        )
        .route(
            "/sessions/{identity}/messages",
            post(handlers::v1::send_message),
        )
        .route(
            "/sessions/{identity}/reset",
            post(handlers::v1::reset_session),
        )
        .with_state(state.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .layer(DefaultBodyLimit::max(64 * 1024)) // 64 KB
        .layer(ConcurrencyLimitLayer::new(max_connections));

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .with_state(state)
        .nest("/api/v1", api_routes)
}
