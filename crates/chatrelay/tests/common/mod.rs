//! Common test utilities.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use chatrelay::api::SessionState;
use chatrelay::challenge::{ChallengeStore, PassthroughRenderer};
use chatrelay::dispatch::{MessageDispatcher, RetryPolicy};
use chatrelay::identity::Identity;
use chatrelay::server::{self, AppState, RuntimeServices};
use chatrelay::session::{LifecycleTimeouts, RegistryConfig, SessionRegistry};
use chatrelay::transport::{LoopbackFactory, LoopbackTransport, TransportEvent};

pub struct TestServer {
    pub app: Router,
    pub factory: Arc<LoopbackFactory>,
    pub registry: SessionRegistry,
    pub challenges: ChallengeStore,
}

/// Create a test server with a manually driven loopback transport and fast
/// retry timings.
pub fn test_server() -> TestServer {
    let factory = Arc::new(LoopbackFactory::manual());
    let challenges = ChallengeStore::new(chrono::Duration::minutes(10));
    let registry = SessionRegistry::new(RegistryConfig {
        factory: factory.clone(),
        renderer: Arc::new(PassthroughRenderer),
        challenges: challenges.clone(),
        timeouts: LifecycleTimeouts::default(),
    });
    let dispatcher = MessageDispatcher::new(RetryPolicy {
        attempt_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(5),
        reinit_delay: Duration::from_millis(5),
        ..RetryPolicy::default()
    });

    let state = AppState {
        services: RuntimeServices {
            registry: registry.clone(),
            challenges: challenges.clone(),
            dispatcher,
        },
        challenge_wait: Duration::from_millis(300),
    };

    TestServer {
        app: server::build_app(state, 30, 64),
        factory,
        registry,
        challenges,
    }
}

/// Create the session for `identity` and drive its transport to Ready.
pub async fn bring_ready(server: &TestServer, identity: &str) -> Arc<LoopbackTransport> {
    let identity = Identity::sanitize(identity);
    let handle = server.registry.get_or_create(&identity).await.unwrap();

    let transport = server.factory.get(&identity).unwrap();
    transport.emit(TransportEvent::Ready).await;
    transport.set_ready(true);

    wait_for_state(server, identity.as_str(), SessionState::Ready).await;
    drop(handle);
    transport
}

/// Poll until the session for `identity` reaches `state`.
pub async fn wait_for_state(server: &TestServer, identity: &str, state: SessionState) {
    let identity = Identity::sanitize(identity);
    for _ in 0..200 {
        if let Some(handle) = server.registry.get(&identity) {
            if let Ok(snapshot) = handle.snapshot().await {
                if snapshot.state == state {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {}", identity, state);
}
