//! Session HTTP handlers.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path as PathExtract, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::time::Instant;
use tracing::error;

use crate::api::{
    ChallengeResponse, ListSessionsResponse, ResetResponse, SendMessageRequest,
    SendMessageResponse, SessionState, SessionSummary, StatusResponse,
};
use crate::challenge::Challenge;
use crate::dispatch::DispatchError;
use crate::handlers::problem_details;
use crate::identity::Identity;
use crate::server::AppState;
use crate::session::SessionSnapshot;

/// Poll interval while waiting for a challenge to appear.
const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let sessions: Vec<SessionSummary> = state
        .services
        .registry
        .list()
        .await
        .into_iter()
        .map(|snapshot| SessionSummary {
            identity: snapshot.identity.to_string(),
            state: snapshot.state,
            created_at: snapshot.created_at.to_rfc3339(),
            last_state_change_at: snapshot.last_state_change_at.to_rfc3339(),
        })
        .collect();

    Json(ListSessionsResponse { sessions })
}

/// GET /api/v1/sessions/{identity}/status
///
/// Reports the current state without creating a session.
pub async fn session_status(
    State(state): State<AppState>,
    PathExtract(identity): PathExtract<String>,
) -> Response {
    let identity = Identity::sanitize(&identity);

    let Some(handle) = state.services.registry.get(&identity) else {
        return problem_details::not_found("session not found").into_response();
    };

    let snapshot = match handle.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(identity = %identity, error = %e, "failed to read session state");
            return problem_details::internal_error("failed to read session state")
                .into_response();
        }
    };

    (StatusCode::OK, Json(status_response(&state, snapshot))).into_response()
}

/// GET /api/v1/sessions/{identity}/challenge
///
/// Gets or creates the session, then waits bounded for a challenge to
/// appear; answers with the challenge artifact or a readiness indicator.
pub async fn session_challenge(
    State(state): State<AppState>,
    PathExtract(identity): PathExtract<String>,
) -> Response {
    let identity = Identity::sanitize(&identity);

    let handle = match state.services.registry.get_or_create(&identity).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(identity = %identity, error = %e, "failed to create session");
            return problem_details::bad_gateway("transport construction failed").into_response();
        }
    };

    let deadline = Instant::now() + state.challenge_wait;
    loop {
        if let Some(challenge) = state.services.challenges.get(&identity) {
            let snapshot_state = match handle.snapshot().await {
                Ok(snapshot) => snapshot.state,
                Err(_) => SessionState::AwaitingScan,
            };
            return (
                StatusCode::OK,
                Json(challenge_response(&identity, snapshot_state, Some(challenge))),
            )
                .into_response();
        }

        let snapshot = match handle.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(identity = %identity, error = %e, "failed to read session state");
                return problem_details::internal_error("failed to read session state")
                    .into_response();
            }
        };

        if snapshot.state == SessionState::Ready {
            return (
                StatusCode::OK,
                Json(challenge_response(&identity, SessionState::Ready, None)),
            )
                .into_response();
        }
        if snapshot.state.is_failed() {
            let detail = snapshot
                .error_detail
                .unwrap_or_else(|| "session failed".to_string());
            return problem_details::bad_gateway(format!(
                "session failed before a challenge was issued: {}",
                detail
            ))
            .into_response();
        }
        if Instant::now() >= deadline {
            // Still starting up; report the state so the caller can poll.
            return (
                StatusCode::OK,
                Json(challenge_response(&identity, snapshot.state, None)),
            )
                .into_response();
        }

        tokio::time::sleep(CHALLENGE_POLL_INTERVAL).await;
    }
}

/// POST /api/v1/sessions/{identity}/messages
pub async fn send_message(
    State(state): State<AppState>,
    PathExtract(identity): PathExtract<String>,
    Json(req): Json<SendMessageRequest>,
) -> Response {
    if req.recipient.trim().is_empty() || req.body.is_empty() {
        return problem_details::bad_request("recipient and body are required").into_response();
    }

    let identity = Identity::sanitize(&identity);

    let handle = match state.services.registry.get_or_create(&identity).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(identity = %identity, error = %e, "failed to create session");
            return problem_details::bad_gateway("transport construction failed").into_response();
        }
    };

    match state
        .services
        .dispatcher
        .send(&handle, &req.recipient, &req.body)
        .await
    {
        Ok(delivery) => (
            StatusCode::OK,
            Json(SendMessageResponse {
                message_id: delivery.message_id,
                recipient: delivery.recipient,
                accepted_at: delivery.accepted_at.to_rfc3339(),
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/v1/sessions/{identity}/reset
///
/// Forces teardown and recreation; answers with the fresh session's state.
pub async fn reset_session(
    State(state): State<AppState>,
    PathExtract(identity): PathExtract<String>,
) -> Response {
    let identity = Identity::sanitize(&identity);

    state.services.registry.reset(&identity).await;

    let handle = match state.services.registry.get_or_create(&identity).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(identity = %identity, error = %e, "failed to recreate session after reset");
            return problem_details::bad_gateway("transport construction failed").into_response();
        }
    };

    let session_state = match handle.snapshot().await {
        Ok(snapshot) => snapshot.state,
        Err(_) => SessionState::Initializing,
    };

    (
        StatusCode::OK,
        Json(ResetResponse {
            identity: identity.to_string(),
            state: session_state,
        }),
    )
        .into_response()
}

// ============================================================================
// Implementation Details
// ============================================================================

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match &self {
            DispatchError::NotReady(state) => {
                problem_details::conflict(format!("session is not ready (state: {})", state))
            }
            DispatchError::InvalidRecipient(_) => problem_details::bad_request(self.to_string()),
            DispatchError::RecipientNotFound(_) => problem_details::not_found(self.to_string()),
            DispatchError::DeliveryFailed { .. } => problem_details::bad_gateway(self.to_string()),
            DispatchError::Cancelled => {
                problem_details::conflict("session was torn down during dispatch")
            }
        }
        .into_response()
    }
}

fn status_response(state: &AppState, snapshot: SessionSnapshot) -> StatusResponse {
    StatusResponse {
        identity: snapshot.identity.to_string(),
        state: snapshot.state,
        has_challenge: state.services.challenges.get(&snapshot.identity).is_some(),
        is_ready: snapshot.state == SessionState::Ready,
        error: snapshot.error_detail,
    }
}

fn challenge_response(
    identity: &Identity,
    state: SessionState,
    challenge: Option<Challenge>,
) -> ChallengeResponse {
    match challenge {
        Some(challenge) => {
            let expires_at = challenge.expires_at();
            ChallengeResponse {
                identity: identity.to_string(),
                state,
                payload: Some(challenge.payload),
                artifact: challenge.artifact.map(|bytes| BASE64.encode(bytes)),
                issued_at: Some(challenge.issued_at.to_rfc3339()),
                expires_at: Some(expires_at.to_rfc3339()),
            }
        }
        None => ChallengeResponse {
            identity: identity.to_string(),
            state,
            payload: None,
            artifact: None,
            issued_at: None,
            expires_at: None,
        },
    }
}
