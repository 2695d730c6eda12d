//! Subprocess transport: one external transport process per identity.
//!
//! The child process implements the messaging protocol and owns credential
//! persistence (under `state_dir/<identity>`); this module only spawns it,
//! bridges its stdio to the wire protocol, and correlates command acks.
//! Restart decisions belong to the dispatcher and the session lifecycle;
//! a dead child simply surfaces as a disconnect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use ulid::Ulid;

use chatrelay_transport_protocol as wire;

use crate::identity::Identity;

use super::{SendReceipt, Transport, TransportError, TransportEvent, TransportFactory};

/// Capacity of the command channel into the bridge task.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Grace period for the child to exit after a destroy command.
const DESTROY_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for the bridge task to finish before aborting it.
const BRIDGE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type PendingAcks = Arc<DashMap<String, oneshot::Sender<Result<SendReceipt, TransportError>>>>;

// ============================================================================
// Configuration and Factory
// ============================================================================

/// Configuration shared by all subprocess transports.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Command to spawn, one process per identity.
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Root directory for per-identity transport state (credentials).
    pub state_dir: PathBuf,
}

/// Factory spawning one transport process per identity.
pub struct SubprocessFactory {
    config: SubprocessConfig,
}

impl SubprocessFactory {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for SubprocessFactory {
    async fn create(
        &self,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(SubprocessTransport::new(
            self.config.clone(),
            identity.clone(),
            events,
        )))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport backed by an external process speaking JSON Lines over stdio.
pub struct SubprocessTransport {
    identity: Identity,
    config: SubprocessConfig,
    events: mpsc::Sender<TransportEvent>,
    ready: Arc<AtomicBool>,
    pending: PendingAcks,
    bridge: Mutex<Option<BridgeHandle>>,
}

struct BridgeHandle {
    cmd_tx: mpsc::Sender<wire::TransportCommand>,
    task: JoinHandle<()>,
}

impl SubprocessTransport {
    fn new(
        config: SubprocessConfig,
        identity: Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            identity,
            config,
            events,
            ready: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(DashMap::new()),
            bridge: Mutex::new(None),
        }
    }

    /// Spawn the child process with stdio piped and death tied to ours.
    fn spawn_child(&self) -> std::io::Result<Child> {
        let state_dir = self.config.state_dir.join(self.identity.as_str());

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("CHATRELAY_IDENTITY", self.identity.as_str())
            .env("CHATRELAY_STATE_DIR", &state_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // On Linux, set PR_SET_PDEATHSIG to ensure child dies when parent dies
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        let mut guard = self.bridge.lock().await;

        // Re-initializing a live transport replaces its process.
        if let Some(handle) = guard.take() {
            self.ready.store(false, Ordering::SeqCst);
            shutdown_bridge(handle, &self.pending).await;
        }

        let child = self.spawn_child().map_err(TransportError::Spawn)?;
        debug!(identity = %self.identity, command = %self.config.command, "transport process spawned");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(bridge(
            self.identity.clone(),
            child,
            cmd_rx,
            self.events.clone(),
            self.ready.clone(),
            self.pending.clone(),
        ));

        cmd_tx
            .send(wire::TransportCommand::Initialize {
                request_id: Ulid::new().to_string(),
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        *guard = Some(BridgeHandle { cmd_tx, task });
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        let mut guard = self.bridge.lock().await;
        let Some(handle) = guard.take() else {
            // Already destroyed.
            return Ok(());
        };

        self.ready.store(false, Ordering::SeqCst);
        shutdown_bridge(handle, &self.pending).await;
        debug!(identity = %self.identity, "transport process destroyed");
        Ok(())
    }

    async fn send_message(
        &self,
        address: &str,
        body: &str,
    ) -> Result<SendReceipt, TransportError> {
        let cmd_tx = {
            let guard = self.bridge.lock().await;
            guard
                .as_ref()
                .map(|handle| handle.cmd_tx.clone())
                .ok_or(TransportError::Closed)?
        };

        let request_id = Ulid::new().to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), ack_tx);

        let command = wire::TransportCommand::SendMessage {
            request_id: request_id.clone(),
            address: address.to_string(),
            body: body.to_string(),
        };
        if cmd_tx.send(command).await.is_err() {
            self.pending.remove(&request_id);
            return Err(TransportError::Closed);
        }

        match ack_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Bridge Task
// ============================================================================

/// Bridge the child's stdio: commands in, events out, acks correlated.
async fn bridge(
    identity: Identity,
    mut child: Child,
    mut cmd_rx: mpsc::Receiver<wire::TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    ready: Arc<AtomicBool>,
    pending: PendingAcks,
) {
    let stdin = child.stdin.take().expect("stdin should be piped");
    let stdout = child.stdout.take().expect("stdout should be piped");

    let mut stdin = stdin;
    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut destroying = false;

    loop {
        tokio::select! {
            // Events from the child
            line = stdout_reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match serde_json::from_str::<wire::TransportEvent>(&line) {
                            Ok(event) => {
                                handle_wire_event(&identity, event, &events, &ready, &pending).await;
                            }
                            Err(e) => {
                                warn!(
                                    identity = %identity,
                                    line = %line,
                                    error = %e,
                                    "unparseable transport event"
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(identity = %identity, "transport stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!(identity = %identity, error = %e, "error reading transport stdout");
                        break;
                    }
                }
            }

            // Commands to the child
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if matches!(command, wire::TransportCommand::Destroy { .. }) {
                            destroying = true;
                        }
                        match serde_json::to_string(&command) {
                            Ok(json) => {
                                let line = format!("{}\n", json);
                                if stdin.write_all(line.as_bytes()).await.is_err()
                                    || stdin.flush().await.is_err()
                                {
                                    error!(identity = %identity, "failed to write to transport stdin");
                                    break;
                                }
                                if destroying {
                                    // Give the child a moment to exit cleanly.
                                    tokio::time::sleep(DESTROY_GRACE).await;
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(identity = %identity, error = %e, "failed to serialize command");
                            }
                        }
                    }
                    None => {
                        debug!(identity = %identity, "command channel closed");
                        destroying = true;
                        break;
                    }
                }
            }

            // Child exit
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        debug!(identity = %identity, status = %status, "transport process exited");
                    }
                    Err(e) => {
                        error!(identity = %identity, error = %e, "error waiting for transport process");
                    }
                }
                finish_bridge(&identity, destroying, &events, &ready, &pending).await;
                return;
            }
        }
    }

    // Kill the child if it is still running, then report.
    let _ = child.kill().await;
    let _ = child.wait().await;
    finish_bridge(&identity, destroying, &events, &ready, &pending).await;
}

/// Common bridge teardown: readiness off, pending acks failed, and a
/// disconnect event unless the shutdown was requested by our side.
async fn finish_bridge(
    identity: &Identity,
    destroying: bool,
    events: &mpsc::Sender<TransportEvent>,
    ready: &Arc<AtomicBool>,
    pending: &PendingAcks,
) {
    ready.store(false, Ordering::SeqCst);
    drain_pending(pending);

    if !destroying {
        let _ = events
            .send(TransportEvent::Disconnected {
                reason: "transport process exited".to_string(),
            })
            .await;
        warn!(identity = %identity, "transport process exited unexpectedly");
    }
}

/// Fail every outstanding ack with `Closed`.
fn drain_pending(pending: &PendingAcks) {
    let request_ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for request_id in request_ids {
        if let Some((_, reply)) = pending.remove(&request_id) {
            let _ = reply.send(Err(TransportError::Closed));
        }
    }
}

/// Route one wire event: acks resolve pending sends, the rest become
/// lifecycle events for the owning session.
async fn handle_wire_event(
    identity: &Identity,
    event: wire::TransportEvent,
    events: &mpsc::Sender<TransportEvent>,
    ready: &Arc<AtomicBool>,
    pending: &PendingAcks,
) {
    match event {
        wire::TransportEvent::Ack {
            request_id,
            message_id,
            timestamp,
            error,
        } => {
            let Some((_, reply)) = pending.remove(&request_id) else {
                debug!(identity = %identity, request_id = %request_id, "ack for unknown request");
                return;
            };
            let _ = reply.send(ack_outcome(message_id, timestamp, error));
        }
        other => {
            match &other {
                wire::TransportEvent::Ready => ready.store(true, Ordering::SeqCst),
                wire::TransportEvent::Disconnected { .. }
                | wire::TransportEvent::AuthFailure { .. } => {
                    ready.store(false, Ordering::SeqCst);
                }
                _ => {}
            }
            if let Some(event) = map_event(other) {
                let _ = events.send(event).await;
            }
        }
    }
}

fn map_event(event: wire::TransportEvent) -> Option<TransportEvent> {
    match event {
        wire::TransportEvent::Qr { payload } => Some(TransportEvent::Qr { payload }),
        wire::TransportEvent::Authenticated => Some(TransportEvent::Authenticated),
        wire::TransportEvent::Ready => Some(TransportEvent::Ready),
        wire::TransportEvent::AuthFailure { reason } => {
            Some(TransportEvent::AuthFailure { reason })
        }
        wire::TransportEvent::Disconnected { reason } => {
            Some(TransportEvent::Disconnected { reason })
        }
        wire::TransportEvent::Error { detail } => Some(TransportEvent::Error { detail }),
        wire::TransportEvent::Ack { .. } => None,
    }
}

fn ack_outcome(
    message_id: Option<String>,
    timestamp: Option<chrono::DateTime<Utc>>,
    error: Option<wire::AckError>,
) -> Result<SendReceipt, TransportError> {
    match error {
        Some(err) => Err(match err.kind {
            wire::AckErrorKind::RecipientNotFound => TransportError::RecipientNotFound(err.detail),
            wire::AckErrorKind::NotReady => TransportError::NotReady,
            wire::AckErrorKind::Crashed => TransportError::Crashed(err.detail),
            wire::AckErrorKind::Transient => TransportError::Failed(err.detail),
        }),
        None => Ok(SendReceipt {
            id: message_id.unwrap_or_else(|| format!("msg_{}", Ulid::new())),
            timestamp: timestamp.unwrap_or_else(Utc::now),
        }),
    }
}

/// Ask the bridge to destroy its child and wait for it to wind down.
async fn shutdown_bridge(handle: BridgeHandle, pending: &PendingAcks) {
    let _ = handle
        .cmd_tx
        .send(wire::TransportCommand::Destroy {
            request_id: Ulid::new().to_string(),
        })
        .await;
    drop(handle.cmd_tx);

    let mut task = handle.task;
    if tokio::time::timeout(BRIDGE_JOIN_TIMEOUT, &mut task)
        .await
        .is_err()
    {
        warn!("bridge task did not stop in time, aborting");
        task.abort();
    }
    drain_pending(pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn id(s: &str) -> Identity {
        Identity::sanitize(s)
    }

    fn test_config() -> SubprocessConfig {
        SubprocessConfig {
            command: "true".to_string(),
            args: vec![],
            env: HashMap::new(),
            state_dir: PathBuf::from("/tmp/chatrelay-test"),
        }
    }

    #[tokio::test]
    async fn destroy_without_initialize_is_noop() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SubprocessTransport::new(test_config(), id("user1"), tx);

        transport.destroy().await.unwrap();
        transport.destroy().await.unwrap();
        assert!(!transport.is_ready().await);
    }

    #[tokio::test]
    async fn send_without_initialize_fails_closed() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = SubprocessTransport::new(test_config(), id("user1"), tx);

        let result = transport.send_message("15551234567@c.us", "hi").await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(transport.pending.is_empty());
    }

    #[test]
    fn ack_outcome_maps_error_kinds() {
        let err = |kind| {
            ack_outcome(
                None,
                None,
                Some(wire::AckError {
                    kind,
                    detail: "detail".to_string(),
                }),
            )
            .unwrap_err()
        };

        assert!(matches!(
            err(wire::AckErrorKind::RecipientNotFound),
            TransportError::RecipientNotFound(_)
        ));
        assert!(matches!(
            err(wire::AckErrorKind::NotReady),
            TransportError::NotReady
        ));
        assert!(matches!(
            err(wire::AckErrorKind::Crashed),
            TransportError::Crashed(_)
        ));
        assert!(matches!(
            err(wire::AckErrorKind::Transient),
            TransportError::Failed(_)
        ));
    }

    #[test]
    fn ack_outcome_fills_missing_receipt_fields() {
        let receipt = ack_outcome(None, None, None).unwrap();
        assert!(receipt.id.starts_with("msg_"));

        let receipt = ack_outcome(Some("m1".to_string()), None, None).unwrap();
        assert_eq!(receipt.id, "m1");
    }

    #[test]
    fn map_event_covers_lifecycle_events() {
        assert!(matches!(
            map_event(wire::TransportEvent::Qr {
                payload: "p".to_string()
            }),
            Some(TransportEvent::Qr { .. })
        ));
        assert!(matches!(
            map_event(wire::TransportEvent::Ready),
            Some(TransportEvent::Ready)
        ));
        assert!(map_event(wire::TransportEvent::Ack {
            request_id: "r".to_string(),
            message_id: None,
            timestamp: None,
            error: None,
        })
        .is_none());
    }

    #[tokio::test]
    async fn resolving_ack_completes_pending_send() {
        let pending: PendingAcks = Arc::new(DashMap::new());
        let (events_tx, _events_rx) = mpsc::channel(8);
        let ready = Arc::new(AtomicBool::new(false));

        let (ack_tx, ack_rx) = oneshot::channel();
        pending.insert("req_1".to_string(), ack_tx);

        handle_wire_event(
            &id("user1"),
            wire::TransportEvent::Ack {
                request_id: "req_1".to_string(),
                message_id: Some("m1".to_string()),
                timestamp: None,
                error: None,
            },
            &events_tx,
            &ready,
            &pending,
        )
        .await;

        let receipt = ack_rx.await.unwrap().unwrap();
        assert_eq!(receipt.id, "m1");
        assert!(pending.is_empty());
    }
}
