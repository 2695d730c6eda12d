//! Shared API types used by the HTTP handlers and clients.
//!
//! These types define the contract between server and client.
//! Changes here affect both sides, preventing silent drift.

use serde::{Deserialize, Serialize};

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a messaging session.
///
/// States progress `Initializing → AwaitingScan → Authenticated → Ready`;
/// the three failure states are equivalent for cleanup purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The transport is being constructed and is connecting.
    Initializing,
    /// A challenge has been issued and is waiting to be scanned.
    AwaitingScan,
    /// The scan was accepted; the connection is warming up.
    Authenticated,
    /// The session can dispatch messages.
    Ready,
    /// Authentication was rejected.
    AuthFailed,
    /// The connection to the messaging network was lost.
    Disconnected,
    /// The transport reported a fault.
    Error,
}

impl SessionState {
    /// True for the failure states, which are equivalent for cleanup.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::AuthFailed | Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::AwaitingScan => "awaiting_scan",
            SessionState::Authenticated => "authenticated",
            SessionState::Ready => "ready",
            SessionState::AuthFailed => "auth_failed",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Summary of a session in list responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub identity: String,
    pub state: SessionState,
    pub created_at: String,
    pub last_state_change_at: String,
}

/// Response for listing sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Response for a session status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub identity: String,
    pub state: SessionState,
    pub has_challenge: bool,
    pub is_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for a challenge query.
///
/// `payload` and `artifact` are present while a challenge is pending;
/// `state` alone indicates readiness or that the flow is still starting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub identity: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Rendered artifact, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

// ============================================================================
// Message Types
// ============================================================================

/// Request to send a message through a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub recipient: String,
    pub body: String,
}

/// Response for an accepted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    /// Canonical address the message was delivered to.
    pub recipient: String,
    pub accepted_at: String,
}

/// Response for a session reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub identity: String,
    pub state: SessionState,
}
