//! Transport collaborator interface.
//!
//! A transport is the external connection to the messaging network for one
//! identity, including its authentication flow and credential persistence.
//! The core drives transports only through the [`Transport`] trait and
//! consumes the lifecycle events they push; the messaging wire protocol
//! itself lives behind this seam.
//!
//! Two implementations ship with the server:
//! - [`SubprocessTransport`] — one external process per identity, speaking
//!   the `chatrelay-transport-protocol` wire format over stdio.
//! - [`LoopbackTransport`] — an in-memory transport for local development
//!   and tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::Identity;

mod loopback;
mod subprocess;

pub use loopback::{LoopbackFactory, LoopbackTransport};
pub use subprocess::{SubprocessConfig, SubprocessFactory, SubprocessTransport};

/// Channel capacity for transport events.
///
/// Events for one session are consumed promptly by its lifecycle task; the
/// buffer only has to absorb short bursts.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Events
// ============================================================================

/// Lifecycle events pushed by a transport instance.
///
/// Events for one instance arrive one at a time and are applied in arrival
/// order by the owning session task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fresh challenge payload to present for scanning.
    Qr { payload: String },
    /// The scan was accepted; credentials are established.
    Authenticated,
    /// The connection is fully usable for sending.
    Ready,
    /// Authentication was rejected.
    AuthFailure { reason: String },
    /// The connection was lost.
    Disconnected { reason: String },
    /// The transport reported a fault without a confirmed disconnect.
    Error { detail: String },
}

impl TransportEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Qr { .. } => "qr",
            TransportEvent::Authenticated => "authenticated",
            TransportEvent::Ready => "ready",
            TransportEvent::AuthFailure { .. } => "auth_failure",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::Error { .. } => "error",
        }
    }
}

// ============================================================================
// Results and Errors
// ============================================================================

/// Receipt for a message the transport accepted.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not connected (yet, or anymore).
    #[error("transport is not ready")]
    NotReady,

    /// The recipient does not exist on the messaging network.
    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    /// The transport's internal session crashed and needs re-initialization.
    #[error("transport crashed: {0}")]
    Crashed(String),

    /// An operation exceeded its deadline.
    #[error("transport operation timed out")]
    Timeout,

    /// The transport instance is gone (process exited, channel closed).
    #[error("transport is closed")]
    Closed,

    /// The transport answered with something unintelligible.
    #[error("transport protocol error: {0}")]
    Protocol(String),

    /// The transport reported a failure it did not classify further.
    #[error("transport operation failed: {0}")]
    Failed(String),

    /// The transport process could not be spawned.
    #[error("transport spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
}

// ============================================================================
// Traits
// ============================================================================

/// One connection to the messaging network, owned by a single session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start (or restart) the connection; authentication progresses via
    /// pushed events.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Release the connection. Destroying an already-destroyed transport is
    /// a no-op, not an error. Persisted credentials survive.
    async fn destroy(&self) -> Result<(), TransportError>;

    /// Deliver a message to a canonical address.
    async fn send_message(&self, address: &str, body: &str)
        -> Result<SendReceipt, TransportError>;

    /// Whether the transport currently reports itself usable for sending.
    async fn is_ready(&self) -> bool;
}

/// Constructs one transport per identity.
///
/// The returned transport is constructed but not initialized; the session
/// lifecycle calls [`Transport::initialize`] once it owns the instance.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
