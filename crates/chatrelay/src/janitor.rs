//! Background maintenance sweep.
//!
//! The janitor bounds resource usage from abandoned logins: challenges that
//! were never scanned expire and take their sessions with them, sessions
//! stuck before authentication are torn down after the bring-up window, and
//! already-failed sessions are reaped so the registry map stays bounded.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::SessionState;
use crate::challenge::ChallengeStore;
use crate::session::SessionRegistry;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// How long a session may stay in Initializing/AwaitingScan before it
    /// is considered abandoned.
    pub bringup_window: chrono::Duration,
    /// Idle age after which per-identity lock entries are pruned.
    pub lock_max_idle: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            bringup_window: chrono::Duration::minutes(5),
            lock_max_idle: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// Janitor
// ============================================================================

pub struct Janitor {
    registry: SessionRegistry,
    challenges: ChallengeStore,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(
        registry: SessionRegistry,
        challenges: ChallengeStore,
        config: JanitorConfig,
    ) -> Self {
        Self {
            registry,
            challenges,
            config,
        }
    }

    /// Run the sweep loop until the shutdown signal fires.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.tick().await; // skip immediate tick

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("janitor stopped");
        })
    }

    /// One maintenance pass.
    pub async fn sweep(&self) {
        let now = Utc::now();

        // Expired challenges abandon their sessions.
        for identity in self.challenges.sweep_expired(now) {
            info!(identity = %identity, "challenge expired, tearing down session");
            self.registry.reset(&identity).await;
        }

        // Stuck bring-ups and failed leftovers.
        let mut reaped = 0usize;
        for snapshot in self.registry.list().await {
            let stuck = matches!(
                snapshot.state,
                SessionState::Initializing | SessionState::AwaitingScan
            ) && now - snapshot.created_at > self.config.bringup_window;

            if stuck {
                warn!(
                    identity = %snapshot.identity,
                    state = %snapshot.state,
                    "session exceeded bring-up window, tearing down"
                );
                self.registry.reset(&snapshot.identity).await;
                reaped += 1;
            } else if snapshot.state.is_failed() {
                debug!(
                    identity = %snapshot.identity,
                    state = %snapshot.state,
                    "reaping failed session"
                );
                self.registry.remove(&snapshot.identity);
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!(reaped, "janitor sweep complete");
        }

        let pruned = self.registry.prune_locks(self.config.lock_max_idle);
        if pruned > 0 {
            debug!(pruned, "pruned idle identity locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeStore, PassthroughRenderer};
    use crate::identity::Identity;
    use crate::session::{LifecycleTimeouts, RegistryConfig, SessionHandle};
    use crate::transport::{LoopbackFactory, TransportEvent};
    use std::sync::Arc;

    fn id(s: &str) -> Identity {
        Identity::sanitize(s)
    }

    fn setup(
        challenge_ttl: chrono::Duration,
        bringup_window: chrono::Duration,
    ) -> (Janitor, SessionRegistry, Arc<LoopbackFactory>, ChallengeStore) {
        let factory = Arc::new(LoopbackFactory::manual());
        let challenges = ChallengeStore::new(challenge_ttl);
        let registry = SessionRegistry::new(RegistryConfig {
            factory: factory.clone(),
            renderer: Arc::new(PassthroughRenderer),
            challenges: challenges.clone(),
            timeouts: LifecycleTimeouts::default(),
        });
        let janitor = Janitor::new(
            registry.clone(),
            challenges.clone(),
            JanitorConfig {
                bringup_window,
                ..JanitorConfig::default()
            },
        );
        (janitor, registry, factory, challenges)
    }

    async fn wait_for(handle: &SessionHandle, state: SessionState) {
        for _ in 0..100 {
            if let Ok(snap) = handle.snapshot().await {
                if snap.state == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {}", state);
    }

    #[tokio::test]
    async fn expired_challenge_tears_down_session() {
        let (janitor, registry, factory, challenges) =
            setup(chrono::Duration::zero(), chrono::Duration::minutes(5));

        let handle = registry.get_or_create(&id("user1")).await.unwrap();
        factory
            .get(&id("user1"))
            .unwrap()
            .emit(TransportEvent::Qr {
                payload: "ABC".to_string(),
            })
            .await;
        wait_for(&handle, SessionState::AwaitingScan).await;

        // A zero TTL makes the challenge expired as soon as any time passes.
        tokio::time::sleep(Duration::from_millis(5)).await;
        janitor.sweep().await;

        assert!(challenges.get(&id("user1")).is_none());
        assert!(registry.get(&id("user1")).is_none());
        assert_eq!(factory.get(&id("user1")).unwrap().destroy_calls(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_challenge_survives_sweep() {
        let (janitor, registry, factory, challenges) =
            setup(chrono::Duration::minutes(10), chrono::Duration::minutes(5));

        let handle = registry.get_or_create(&id("user1")).await.unwrap();
        factory
            .get(&id("user1"))
            .unwrap()
            .emit(TransportEvent::Qr {
                payload: "ABC".to_string(),
            })
            .await;
        wait_for(&handle, SessionState::AwaitingScan).await;

        janitor.sweep().await;

        assert!(challenges.get(&id("user1")).is_some());
        assert!(registry.get(&id("user1")).is_some());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_bringup_is_torn_down() {
        let (janitor, registry, _, _) =
            setup(chrono::Duration::minutes(10), chrono::Duration::zero());

        registry.get_or_create(&id("user1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        janitor.sweep().await;

        assert!(registry.get(&id("user1")).is_none());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn ready_session_survives_bringup_window() {
        let (janitor, registry, factory, _) =
            setup(chrono::Duration::minutes(10), chrono::Duration::zero());

        let handle = registry.get_or_create(&id("user1")).await.unwrap();
        factory
            .get(&id("user1"))
            .unwrap()
            .emit(TransportEvent::Ready)
            .await;
        wait_for(&handle, SessionState::Ready).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        janitor.sweep().await;

        assert!(registry.get(&id("user1")).is_some());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn failed_sessions_are_reaped() {
        let (janitor, registry, factory, _) =
            setup(chrono::Duration::minutes(10), chrono::Duration::minutes(5));

        let handle = registry.get_or_create(&id("user1")).await.unwrap();
        factory
            .get(&id("user1"))
            .unwrap()
            .emit(TransportEvent::Disconnected {
                reason: "gone".to_string(),
            })
            .await;
        wait_for(&handle, SessionState::Disconnected).await;

        janitor.sweep().await;

        assert!(registry.get(&id("user1")).is_none());

        registry.shutdown().await;
    }
}
