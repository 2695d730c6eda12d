//! Per-session lifecycle task.
//!
//! Each session gets a dedicated task that:
//! - exclusively owns the transport instance and the mutable session state
//! - consumes transport events strictly in arrival order (no concurrency,
//!   no locks)
//! - answers snapshot/lease/teardown commands over a channel
//!
//! The task never propagates errors across its event boundary: events that
//! are invalid for the current state are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::SessionState;
use crate::challenge::{ChallengeRenderer, ChallengeStore};
use crate::identity::Identity;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Channel capacity for session commands.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The lifecycle task has shut down.
    #[error("session task has shut down")]
    Closed,

    /// The session is not in `Ready` state.
    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),

    /// The transport factory could not construct an instance.
    #[error("transport construction failed: {0}")]
    ConstructionFailed(#[source] TransportError),
}

/// Timeouts bounding the transport suspension points.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    pub initialize: Duration,
    pub destroy: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(90),
            destroy: Duration::from_secs(15),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub identity: Identity,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,
    /// Present only in failed states.
    pub error_detail: Option<String>,
}

/// Revocable dispatch capability for a `Ready` session.
///
/// The lifecycle task stays the sole owner of the transport; a lease is a
/// bounded borrow that teardown revokes through the cancellation token.
#[derive(Clone)]
pub struct TransportLease {
    pub transport: Arc<dyn Transport>,
    /// Cancelled when the session is torn down or reset.
    pub cancel: CancellationToken,
}

/// Commands understood by a lifecycle task.
pub(crate) enum SessionCommand {
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Lease {
        reply: oneshot::Sender<Result<TransportLease, SessionError>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

/// Configuration for spawning a lifecycle task.
pub(crate) struct LifecycleConfig {
    pub identity: Identity,
    pub transport: Arc<dyn Transport>,
    pub challenges: ChallengeStore,
    pub renderer: Arc<dyn ChallengeRenderer>,
    pub timeouts: LifecycleTimeouts,
    pub event_rx: mpsc::Receiver<TransportEvent>,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ============================================================================
// Lifecycle Task
// ============================================================================

pub(crate) struct SessionLifecycle {
    identity: Identity,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_state_change_at: DateTime<Utc>,
    error_detail: Option<String>,

    transport: Arc<dyn Transport>,
    challenges: ChallengeStore,
    renderer: Arc<dyn ChallengeRenderer>,
    timeouts: LifecycleTimeouts,

    /// Revokes outstanding leases on teardown.
    cancel: CancellationToken,

    event_rx: mpsc::Receiver<TransportEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
    shutdown_rx: watch::Receiver<bool>,

    event_closed: bool,
    torn_down: bool,
}

impl SessionLifecycle {
    /// Spawn a lifecycle task for a freshly constructed transport.
    ///
    /// The session enters `Initializing` immediately; transport
    /// initialization runs concurrently so queries stay responsive.
    pub(crate) fn spawn(
        config: LifecycleConfig,
    ) -> (mpsc::Sender<SessionCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let now = Utc::now();

        let lifecycle = Self {
            identity: config.identity,
            state: SessionState::Initializing,
            created_at: now,
            last_state_change_at: now,
            error_detail: None,
            transport: config.transport,
            challenges: config.challenges,
            renderer: config.renderer,
            timeouts: config.timeouts,
            cancel: CancellationToken::new(),
            event_rx: config.event_rx,
            command_rx: rx,
            shutdown_rx: config.shutdown_rx,
            event_closed: false,
            torn_down: false,
        };

        let task = tokio::spawn(lifecycle.run());
        (tx, task)
    }

    async fn run(mut self) {
        debug!(identity = %self.identity, "session task started");

        // Drive transport bring-up off the command path.
        let transport = self.transport.clone();
        let init_timeout = self.timeouts.initialize;
        let mut init_task = tokio::spawn(async move {
            match tokio::time::timeout(init_timeout, transport.initialize()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            }
        });
        let mut init_pending = true;

        loop {
            tokio::select! {
                init_result = &mut init_task, if init_pending => {
                    init_pending = false;
                    match init_result {
                        Ok(Ok(())) => {
                            debug!(identity = %self.identity, "transport initialization started");
                        }
                        Ok(Err(e)) => {
                            self.fail(SessionState::Error, e.to_string(), true).await;
                        }
                        Err(e) => {
                            self.fail(
                                SessionState::Error,
                                format!("transport initialization panicked: {}", e),
                                true,
                            )
                            .await;
                        }
                    }
                }

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!(identity = %self.identity, "session task received shutdown signal");
                        self.teardown().await;
                        break;
                    }
                }

                event = self.event_rx.recv(), if !self.event_closed => {
                    match event {
                        Some(event) => self.apply_event(event).await,
                        None => {
                            self.event_closed = true;
                            if !self.state.is_failed() {
                                self.fail(
                                    SessionState::Disconnected,
                                    "transport event channel closed".to_string(),
                                    true,
                                )
                                .await;
                            }
                        }
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            // Registry and every caller dropped the handle.
                            self.teardown().await;
                            break;
                        }
                    }
                }
            }
        }

        if init_pending {
            init_task.abort();
        }
        debug!(identity = %self.identity, "session task stopped");
    }

    // ------------------------------------------------------------------------
    // Event Handling
    // ------------------------------------------------------------------------

    /// Apply one transport event per the lifecycle transition table.
    ///
    /// Events invalid for the current state are no-ops; events after a
    /// failed state are ignored entirely.
    async fn apply_event(&mut self, event: TransportEvent) {
        if self.state.is_failed() {
            debug!(
                identity = %self.identity,
                event = event.name(),
                "event after failed state ignored"
            );
            return;
        }

        match event {
            TransportEvent::Qr { payload }
                if matches!(
                    self.state,
                    SessionState::Initializing | SessionState::AwaitingScan
                ) =>
            {
                let artifact = match self.renderer.render(&payload).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(identity = %self.identity, error = %e, "challenge rendering failed");
                        None
                    }
                };
                self.challenges.put(&self.identity, payload, artifact);
                self.set_state(SessionState::AwaitingScan);
            }

            TransportEvent::Authenticated if self.state == SessionState::AwaitingScan => {
                self.challenges.clear(&self.identity);
                self.set_state(SessionState::Authenticated);
            }

            TransportEvent::Ready
                if matches!(
                    self.state,
                    SessionState::Initializing
                        | SessionState::AwaitingScan
                        | SessionState::Authenticated
                ) =>
            {
                // Any pending challenge is invalidated by readiness.
                self.challenges.clear(&self.identity);
                self.set_state(SessionState::Ready);
            }

            TransportEvent::AuthFailure { reason } => {
                self.fail(SessionState::AuthFailed, reason, true).await;
            }

            TransportEvent::Disconnected { reason } => {
                self.fail(SessionState::Disconnected, reason, true).await;
            }

            TransportEvent::Error { detail } => {
                // A reported fault is not a confirmed disconnect: mark the
                // session failed but leave the transport object alone.
                self.fail(SessionState::Error, detail, false).await;
            }

            other => {
                debug!(
                    identity = %self.identity,
                    event = other.name(),
                    state = %self.state,
                    "ignoring out-of-order transport event"
                );
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Lease { reply } => {
                let result = if self.state == SessionState::Ready {
                    Ok(TransportLease {
                        transport: self.transport.clone(),
                        cancel: self.cancel.child_token(),
                    })
                } else {
                    Err(SessionError::NotReady(self.state))
                };
                let _ = reply.send(result);
            }
            SessionCommand::Teardown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // State Changes
    // ------------------------------------------------------------------------

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            state: self.state,
            created_at: self.created_at,
            last_state_change_at: self.last_state_change_at,
            error_detail: self.error_detail.clone(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(
            identity = %self.identity,
            from = %self.state,
            to = %state,
            "session state changed"
        );
        self.state = state;
        self.last_state_change_at = Utc::now();
    }

    /// Enter a failed state: clear the challenge, revoke leases, and
    /// optionally release the transport.
    async fn fail(&mut self, state: SessionState, detail: String, destroy: bool) {
        warn!(
            identity = %self.identity,
            from = %self.state,
            to = %state,
            detail = %detail,
            "session failed"
        );
        self.challenges.clear(&self.identity);
        self.cancel.cancel();
        if destroy {
            self.destroy_transport().await;
        }
        self.error_detail = Some(detail);
        self.set_state(state);
    }

    /// Release everything this session holds. Idempotent.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.cancel.cancel();
        self.challenges.clear(&self.identity);
        self.destroy_transport().await;

        if !self.state.is_failed() {
            self.error_detail = Some("session torn down".to_string());
            self.set_state(SessionState::Disconnected);
        }
    }

    /// Destroy the transport best-effort; failures are logged, never
    /// propagated.
    async fn destroy_transport(&self) {
        match tokio::time::timeout(self.timeouts.destroy, self.transport.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(identity = %self.identity, error = %e, "transport destroy failed");
            }
            Err(_) => {
                warn!(identity = %self.identity, "transport destroy timed out");
            }
        }
    }
}
