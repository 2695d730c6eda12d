//! Session registry enforcing one live session per identity.
//!
//! The registry is responsible for:
//! - Looking up existing sessions and constructing missing ones
//! - Serializing construction/teardown per identity
//! - Transparently replacing sessions that have failed
//! - Graceful shutdown of all lifecycle tasks

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::challenge::{ChallengeRenderer, ChallengeStore};
use crate::identity::Identity;
use crate::sync::IdentityLocks;
use crate::transport::{EVENT_CHANNEL_CAPACITY, TransportFactory};

use super::handle::SessionHandle;
use super::lifecycle::{
    LifecycleConfig, LifecycleTimeouts, SessionError, SessionLifecycle, SessionSnapshot,
};

/// Maximum concurrent snapshot fetches for `list()`.
const LIST_CONCURRENCY: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

/// Collaborators and settings for a registry.
pub struct RegistryConfig {
    pub factory: Arc<dyn TransportFactory>,
    pub renderer: Arc<dyn ChallengeRenderer>,
    pub challenges: ChallengeStore,
    pub timeouts: LifecycleTimeouts,
}

// ============================================================================
// Session Registry
// ============================================================================

/// Registry mapping identities to session handles.
///
/// Thread-safe and cheap to clone. The identity→session map is mutated only
/// through this API; per-identity locks guarantee a single construction in
/// flight per identity.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Identity, SessionHandle>>,
    locks: IdentityLocks,
    factory: Arc<dyn TransportFactory>,
    renderer: Arc<dyn ChallengeRenderer>,
    challenges: ChallengeStore,
    timeouts: LifecycleTimeouts,
    /// Lifecycle task handles for graceful shutdown.
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            sessions: Arc::new(DashMap::new()),
            locks: IdentityLocks::new(),
            factory: config.factory,
            renderer: config.renderer,
            challenges: config.challenges,
            timeouts: config.timeouts,
            task_handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    // ------------------------------------------------------------------------
    // Core API
    // ------------------------------------------------------------------------

    /// Return the existing session for `identity` or construct a fresh one.
    ///
    /// Safe under concurrent calls for the same identity: only one
    /// construction proceeds, every caller observes the same handle. A
    /// session found in a failed state is torn down and replaced before
    /// returning.
    pub async fn get_or_create(&self, identity: &Identity) -> Result<SessionHandle, SessionError> {
        let _guard = self.locks.acquire(identity).await;

        if let Some(handle) = self.sessions.get(identity).map(|entry| entry.value().clone()) {
            match handle.snapshot().await {
                Ok(snapshot) if !snapshot.state.is_failed() => return Ok(handle),
                Ok(snapshot) => {
                    info!(
                        identity = %identity,
                        state = %snapshot.state,
                        "replacing failed session"
                    );
                    self.sessions.remove(identity);
                    if let Err(e) = handle.teardown().await {
                        debug!(identity = %identity, error = %e, "teardown of failed session");
                    }
                }
                Err(_) => {
                    // The lifecycle task is gone; forget the stale handle.
                    self.sessions.remove(identity);
                }
            }
        }

        self.construct(identity).await
    }

    /// Look up a session without creating one.
    pub fn get(&self, identity: &Identity) -> Option<SessionHandle> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    /// Destroy the session for `identity` and forget it.
    ///
    /// Transport destruction failures are logged, never propagated; the
    /// challenge is cleared so a subsequent `get_or_create` starts clean.
    pub async fn reset(&self, identity: &Identity) {
        let _guard = self.locks.acquire(identity).await;

        if let Some((_, handle)) = self.sessions.remove(identity) {
            if let Err(e) = handle.teardown().await {
                debug!(identity = %identity, error = %e, "teardown during reset");
            }
            info!(identity = %identity, "session reset");
        }
        self.challenges.clear(identity);
    }

    /// Forget the session for `identity` without an explicit teardown.
    ///
    /// The lifecycle task releases its transport when the last handle is
    /// dropped. Returns true if a session was removed.
    pub fn remove(&self, identity: &Identity) -> bool {
        let removed = self.sessions.remove(identity).is_some();
        if removed {
            self.challenges.clear(identity);
        }
        removed
    }

    /// Snapshot all tracked sessions.
    ///
    /// Fetches snapshots in parallel to avoid O(n) sequential latency with
    /// many sessions.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        // Collect handles first to avoid holding DashMap references across await
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        stream::iter(handles)
            .map(|handle| async move { handle.snapshot().await })
            .buffer_unordered(LIST_CONCURRENCY)
            .filter_map(|result| async move { result.ok() })
            .collect()
            .await
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop idle per-identity lock entries; returns the number removed.
    pub fn prune_locks(&self, max_idle: Duration) -> usize {
        self.locks.prune(max_idle)
    }

    /// Receiver for the registry's shutdown signal, for background tasks
    /// that should stop alongside the sessions.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Gracefully shut down every lifecycle task.
    pub async fn shutdown(&self) {
        info!("shutting down session registry");

        if self.shutdown_tx.send(true).is_err() {
            warn!("failed to send shutdown signal");
            return;
        }

        let task_handles = {
            let mut handles = self.task_handles.lock().await;
            std::mem::take(&mut *handles)
        };

        for task_handle in task_handles {
            if let Err(e) = task_handle.await {
                warn!(error = ?e, "session task panicked during shutdown");
            }
        }

        info!("session registry shutdown complete");
    }

    // ------------------------------------------------------------------------
    // Implementation Details
    // ------------------------------------------------------------------------

    /// Construct a session. Caller must hold the identity lock.
    async fn construct(&self, identity: &Identity) -> Result<SessionHandle, SessionError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = self
            .factory
            .create(identity, event_tx)
            .await
            .map_err(SessionError::ConstructionFailed)?;

        let (tx, task) = SessionLifecycle::spawn(LifecycleConfig {
            identity: identity.clone(),
            transport,
            challenges: self.challenges.clone(),
            renderer: self.renderer.clone(),
            timeouts: self.timeouts,
            event_rx,
            shutdown_rx: self.shutdown_rx.clone(),
        });
        let handle = SessionHandle::new(tx, identity.clone());

        self.sessions.insert(identity.clone(), handle.clone());

        let mut guard = self.task_handles.lock().await;
        guard.retain(|h| !h.is_finished());
        guard.push(task);

        info!(identity = %identity, "session created");
        Ok(handle)
    }
}
