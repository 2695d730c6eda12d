//! In-memory transport for local development and tests.
//!
//! In auto-flow mode the transport fabricates the authentication flow
//! (challenge, scan, ready) on its own, which makes the server usable end to
//! end without a real messaging backend. In manual mode it emits nothing by
//! itself; tests drive every event and script every send outcome.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::identity::Identity;

use super::{SendReceipt, Transport, TransportError, TransportEvent, TransportFactory};

/// Delay between the fabricated challenge and the fabricated scan in
/// auto-flow mode, so the challenge is observable over HTTP.
const AUTO_FLOW_SCAN_DELAY: Duration = Duration::from_millis(1000);

// ============================================================================
// Factory
// ============================================================================

/// Factory for loopback transports.
///
/// Keeps every transport it created so callers (tests, diagnostics) can
/// reach a session's transport by identity.
pub struct LoopbackFactory {
    auto_flow: bool,
    created: DashMap<Identity, Arc<LoopbackTransport>>,
    create_count: AtomicUsize,
}

impl LoopbackFactory {
    /// Factory whose transports authenticate themselves after a short delay.
    pub fn auto() -> Self {
        Self::with_mode(true)
    }

    /// Factory whose transports emit nothing until driven via
    /// [`LoopbackTransport::emit`].
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto_flow: bool) -> Self {
        Self {
            auto_flow,
            created: DashMap::new(),
            create_count: AtomicUsize::new(0),
        }
    }

    /// The most recently created transport for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<Arc<LoopbackTransport>> {
        self.created.get(identity).map(|entry| entry.value().clone())
    }

    /// Total number of transports constructed by this factory.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(LoopbackTransport::new(
            identity.clone(),
            events,
            self.auto_flow,
        ));
        self.created.insert(identity.clone(), transport.clone());
        self.create_count.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// An in-memory transport instance.
pub struct LoopbackTransport {
    identity: Identity,
    events: mpsc::Sender<TransportEvent>,
    auto_flow: bool,
    ready: Arc<AtomicBool>,
    init_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    /// Queued outcomes for upcoming sends; empty queue means success.
    send_script: Mutex<VecDeque<Result<SendReceipt, TransportError>>>,
    /// Artificial latency applied to every send.
    send_delay: Mutex<Option<Duration>>,
    /// (address, body) pairs the transport accepted a send call for.
    send_calls: Mutex<Vec<(String, String)>>,
}

impl LoopbackTransport {
    fn new(identity: Identity, events: mpsc::Sender<TransportEvent>, auto_flow: bool) -> Self {
        Self {
            identity,
            events,
            auto_flow,
            ready: Arc::new(AtomicBool::new(false)),
            init_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            send_script: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            send_calls: Mutex::new(Vec::new()),
        }
    }

    /// Push a lifecycle event into the owning session.
    pub async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Queue the outcome for the next unscripted send.
    pub fn script_send(&self, outcome: Result<SendReceipt, TransportError>) {
        self.send_script
            .lock()
            .expect("mutex poisoned")
            .push_back(outcome);
    }

    /// Apply an artificial delay to every subsequent send.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().expect("mutex poisoned") = Some(delay);
    }

    /// Force the readiness flag, bypassing the fabricated flow.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Every send call the transport has received, in order.
    pub fn send_calls(&self) -> Vec<(String, String)> {
        self.send_calls.lock().expect("mutex poisoned").clone()
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);

        if self.auto_flow {
            self.emit(TransportEvent::Qr {
                payload: format!("loopback:{}:{}", self.identity, Ulid::new()),
            })
            .await;

            let events = self.events.clone();
            let ready = self.ready.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_FLOW_SCAN_DELAY).await;
                let _ = events.send(TransportEvent::Authenticated).await;
                ready.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Ready).await;
            });
        }

        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        address: &str,
        body: &str,
    ) -> Result<SendReceipt, TransportError> {
        let send_delay = *self.send_delay.lock().expect("mutex poisoned");
        if let Some(delay) = send_delay {
            tokio::time::sleep(delay).await;
        }

        if !self.ready.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }

        self.send_calls
            .lock()
            .expect("mutex poisoned")
            .push((address.to_string(), body.to_string()));

        let scripted = self.send_script.lock().expect("mutex poisoned").pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(SendReceipt {
                id: format!("msg_{}", Ulid::new()),
                timestamp: Utc::now(),
            }),
        }
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
