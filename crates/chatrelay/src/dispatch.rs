//! Retrying message dispatch.
//!
//! The dispatcher takes a Ready session, normalizes the recipient into the
//! canonical address form, and attempts delivery with bounded retries. One
//! retry policy covers the whole path: attempt count, per-attempt timeout,
//! cooldowns, and the crash-signature table. Only terminal outcomes reach
//! the caller; intermediate attempts are observable via logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::SessionState;
use crate::session::{SessionError, SessionHandle, TransportLease};
use crate::transport::TransportError;

// ============================================================================
// Retry Policy
// ============================================================================

/// Configuration for the dispatch path.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum delivery attempts per send.
    pub max_attempts: u32,
    /// Deadline for a single transport send call.
    pub attempt_timeout: Duration,
    /// Cooldown after a transient failure.
    pub retry_delay: Duration,
    /// Cooldown after a crash-triggered re-initialization.
    pub reinit_delay: Duration,
    /// Canonical suffix appended to normalized recipients.
    pub address_suffix: String,
    /// Substrings of error details that indicate a crashed transport
    /// session. Matching errors trigger destroy + re-initialize.
    pub crash_signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
            reinit_delay: Duration::from_secs(4),
            address_suffix: "@c.us".to_string(),
            crash_signatures: vec![
                "Evaluation failed".to_string(),
                "Session closed".to_string(),
                "Target closed".to_string(),
            ],
        }
    }
}

// ============================================================================
// Errors and Results
// ============================================================================

/// Terminal dispatch outcomes surfaced to the caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The session is not in `Ready` state; no transport call was made.
    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),

    /// The recipient could not be normalized to a canonical address.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The recipient does not exist on the messaging network.
    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    /// Every attempt failed; carries the last underlying cause.
    #[error("delivery failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The session was torn down while dispatch was in flight.
    #[error("dispatch cancelled by session teardown")]
    Cancelled,
}

/// A successfully dispatched message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    /// Canonical address the message went to.
    pub recipient: String,
    pub accepted_at: DateTime<Utc>,
}

/// How a failed attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Surface immediately, no retry.
    Terminal,
    /// Destroy + re-initialize the transport, then retry after the longer
    /// cooldown.
    Crash,
    /// Retry as-is after the short cooldown.
    Transient,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Dispatches messages through Ready sessions with bounded retries.
#[derive(Clone)]
pub struct MessageDispatcher {
    policy: Arc<RetryPolicy>,
}

impl MessageDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// Normalize a recipient into canonical address form.
    ///
    /// Formatting characters are stripped; the remainder must be 5–20
    /// digits, to which the canonical suffix is appended. Input already
    /// carrying the suffix with a digits-only local part passes through.
    pub fn normalize_recipient(&self, raw: &str) -> Result<String, DispatchError> {
        let trimmed = raw.trim();

        if let Some(local) = trimmed.strip_suffix(&self.policy.address_suffix) {
            if !local.is_empty() && local.chars().all(|c| c.is_ascii_digit()) {
                return Ok(trimmed.to_string());
            }
            return Err(DispatchError::InvalidRecipient(raw.to_string()));
        }

        let acceptable = trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.' | ' '));
        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

        if !acceptable || !(5..=20).contains(&digits.len()) {
            return Err(DispatchError::InvalidRecipient(raw.to_string()));
        }

        Ok(format!("{}{}", digits, self.policy.address_suffix))
    }

    /// Send `body` to `recipient` through the given session.
    ///
    /// Fails fast with `NotReady` (zero transport calls) unless the session
    /// is Ready. Retries transient failures up to the configured maximum;
    /// only terminal outcomes are returned.
    pub async fn send(
        &self,
        session: &SessionHandle,
        recipient: &str,
        body: &str,
    ) -> Result<Delivery, DispatchError> {
        let address = self.normalize_recipient(recipient)?;

        let lease = match session.lease().await {
            Ok(lease) => lease,
            Err(SessionError::NotReady(state)) => return Err(DispatchError::NotReady(state)),
            Err(_) => return Err(DispatchError::NotReady(SessionState::Disconnected)),
        };

        self.deliver(&lease, session.identity().as_str(), &address, body)
            .await
    }

    /// Run the attempt loop against a leased transport.
    async fn deliver(
        &self,
        lease: &TransportLease,
        identity: &str,
        address: &str,
        body: &str,
    ) -> Result<Delivery, DispatchError> {
        let mut last_error = TransportError::NotReady;

        for attempt in 1..=self.policy.max_attempts {
            if lease.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            // Query readiness explicitly rather than probing transport
            // internals; a transport that lost readiness counts as a failed
            // attempt.
            if !lease.transport.is_ready().await {
                debug!(identity, attempt, "transport not ready, backing off");
                last_error = TransportError::NotReady;
                self.cooldown(lease, attempt, self.policy.retry_delay).await?;
                continue;
            }

            let outcome = tokio::select! {
                _ = lease.cancel.cancelled() => return Err(DispatchError::Cancelled),
                result = tokio::time::timeout(
                    self.policy.attempt_timeout,
                    lease.transport.send_message(address, body),
                ) => result,
            };

            match outcome {
                Ok(Ok(receipt)) => {
                    info!(
                        identity,
                        attempt,
                        message_id = %receipt.id,
                        recipient = %address,
                        "message delivered"
                    );
                    return Ok(Delivery {
                        message_id: receipt.id,
                        recipient: address.to_string(),
                        accepted_at: receipt.timestamp,
                    });
                }
                Ok(Err(error)) => match self.classify(&error) {
                    ErrorClass::Terminal => {
                        warn!(identity, attempt, error = %error, "terminal send failure");
                        return Err(DispatchError::RecipientNotFound(address.to_string()));
                    }
                    ErrorClass::Crash => {
                        warn!(
                            identity,
                            attempt,
                            error = %error,
                            "crash signature detected, reinitializing transport"
                        );
                        self.reinitialize(lease, identity).await;
                        last_error = error;
                        self.cooldown(lease, attempt, self.policy.reinit_delay).await?;
                    }
                    ErrorClass::Transient => {
                        warn!(identity, attempt, error = %error, "send attempt failed");
                        last_error = error;
                        self.cooldown(lease, attempt, self.policy.retry_delay).await?;
                    }
                },
                Err(_elapsed) => {
                    warn!(identity, attempt, "send attempt timed out");
                    last_error = TransportError::Timeout;
                    self.cooldown(lease, attempt, self.policy.retry_delay).await?;
                }
            }
        }

        Err(DispatchError::DeliveryFailed {
            attempts: self.policy.max_attempts,
            source: last_error,
        })
    }

    /// Classify a failed attempt.
    ///
    /// The transport may self-report a crash; independently, the error
    /// detail is matched against the configured signature list.
    fn classify(&self, error: &TransportError) -> ErrorClass {
        match error {
            TransportError::RecipientNotFound(_) => ErrorClass::Terminal,
            TransportError::Crashed(_) => ErrorClass::Crash,
            other => {
                let detail = other.to_string();
                if self
                    .policy
                    .crash_signatures
                    .iter()
                    .any(|signature| detail.contains(signature.as_str()))
                {
                    ErrorClass::Crash
                } else {
                    ErrorClass::Transient
                }
            }
        }
    }

    /// Destroy and re-initialize the leased transport, best-effort.
    async fn reinitialize(&self, lease: &TransportLease, identity: &str) {
        if let Err(e) = tokio::time::timeout(self.policy.attempt_timeout, async {
            if let Err(e) = lease.transport.destroy().await {
                warn!(identity, error = %e, "destroy before reinitialize failed");
            }
            if let Err(e) = lease.transport.initialize().await {
                warn!(identity, error = %e, "transport reinitialize failed");
            }
        })
        .await
        {
            warn!(identity, error = %e, "transport reinitialize timed out");
        }
    }

    /// Wait out a cooldown unless it is the last attempt or the lease is
    /// revoked meanwhile.
    async fn cooldown(
        &self,
        lease: &TransportLease,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        if attempt >= self.policy.max_attempts {
            return Ok(());
        }
        tokio::select! {
            _ = lease.cancel.cancelled() => Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::transport::{
        LoopbackFactory, LoopbackTransport, SendReceipt, TransportFactory,
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(5),
            reinit_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    async fn leased_transport() -> (TransportLease, Arc<LoopbackTransport>) {
        let identity = Identity::sanitize("user1");
        let factory = LoopbackFactory::manual();
        let (tx, _rx) = mpsc::channel(8);
        let transport = factory.create(&identity, tx).await.unwrap();
        let loopback = factory.get(&identity).unwrap();
        loopback.set_ready(true);

        let lease = TransportLease {
            transport,
            cancel: CancellationToken::new(),
        };
        (lease, loopback)
    }

    // ------------------------------------------------------------------------
    // Recipient normalization
    // ------------------------------------------------------------------------

    #[test]
    fn normalizes_formatted_numbers() {
        let dispatcher = MessageDispatcher::new(RetryPolicy::default());

        assert_eq!(
            dispatcher.normalize_recipient("15551234567").unwrap(),
            "15551234567@c.us"
        );
        assert_eq!(
            dispatcher.normalize_recipient("+1 (555) 123-4567").unwrap(),
            "15551234567@c.us"
        );
    }

    #[test]
    fn passes_through_canonical_addresses() {
        let dispatcher = MessageDispatcher::new(RetryPolicy::default());
        assert_eq!(
            dispatcher.normalize_recipient("15551234567@c.us").unwrap(),
            "15551234567@c.us"
        );
    }

    #[test]
    fn rejects_unnormalizable_recipients() {
        let dispatcher = MessageDispatcher::new(RetryPolicy::default());

        for raw in ["", "abc", "123", "not-a-number@c.us", "555x123x4567"] {
            assert!(
                matches!(
                    dispatcher.normalize_recipient(raw),
                    Err(DispatchError::InvalidRecipient(_))
                ),
                "expected InvalidRecipient for {:?}",
                raw
            );
        }
    }

    // ------------------------------------------------------------------------
    // Retry loop
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let (lease, loopback) = leased_transport().await;
        let dispatcher = MessageDispatcher::new(fast_policy());

        let delivery = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap();

        assert!(delivery.message_id.starts_with("msg_"));
        assert_eq!(delivery.recipient, "15551234567@c.us");
        assert_eq!(loopback.send_calls().len(), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::Failed("flaky".to_string())));
        loopback.script_send(Err(TransportError::Failed("flaky".to_string())));

        let dispatcher = MessageDispatcher::new(fast_policy());
        let delivery = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap();

        assert!(!delivery.message_id.is_empty());
        assert_eq!(loopback.send_calls().len(), 3);
        assert_eq!(loopback.init_calls(), 0);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_delivery_failed() {
        let (lease, loopback) = leased_transport().await;
        for _ in 0..5 {
            loopback.script_send(Err(TransportError::Failed("flaky".to_string())));
        }

        let dispatcher = MessageDispatcher::new(fast_policy());
        let error = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap_err();

        match error {
            DispatchError::DeliveryFailed { attempts, source } => {
                assert_eq!(attempts, 5);
                assert!(matches!(source, TransportError::Failed(_)));
            }
            other => panic!("expected DeliveryFailed, got {:?}", other),
        }
        assert_eq!(loopback.send_calls().len(), 5);
    }

    #[tokio::test]
    async fn recipient_not_found_short_circuits() {
        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::RecipientNotFound(
            "15551234567@c.us".to_string(),
        )));
        // A success queued behind the terminal failure must never be reached.
        loopback.script_send(Ok(SendReceipt {
            id: "msg_unreachable".to_string(),
            timestamp: Utc::now(),
        }));

        let dispatcher = MessageDispatcher::new(fast_policy());
        let error = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap_err();

        assert!(matches!(error, DispatchError::RecipientNotFound(_)));
        assert_eq!(loopback.send_calls().len(), 1);
    }

    #[tokio::test]
    async fn crash_variant_triggers_reinitialize() {
        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::Crashed("page gone".to_string())));

        let dispatcher = MessageDispatcher::new(fast_policy());
        let delivery = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await;

        // The loopback clears readiness on destroy; manual mode never
        // restores it, so delivery ends in DeliveryFailed. What matters is
        // that the crash caused exactly one destroy + initialize cycle.
        assert!(delivery.is_err());
        assert_eq!(loopback.destroy_calls(), 1);
        assert_eq!(loopback.init_calls(), 1);
    }

    #[tokio::test]
    async fn crash_signature_in_detail_triggers_reinitialize() {
        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::Failed(
            "Evaluation failed: Protocol error".to_string(),
        )));

        let dispatcher = MessageDispatcher::new(fast_policy());
        let _ = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await;

        assert_eq!(loopback.destroy_calls(), 1);
        assert_eq!(loopback.init_calls(), 1);
    }

    #[tokio::test]
    async fn custom_signatures_are_honored() {
        let policy = RetryPolicy {
            crash_signatures: vec!["custom boom".to_string()],
            ..fast_policy()
        };
        let dispatcher = MessageDispatcher::new(policy);

        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::Failed("custom boom today".to_string())));

        let _ = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await;
        assert_eq!(loopback.destroy_calls(), 1);

        // The stock signatures are gone from this policy.
        let (lease2, loopback2) = leased_transport().await;
        loopback2.script_send(Err(TransportError::Failed(
            "Evaluation failed".to_string(),
        )));
        let _ = dispatcher
            .deliver(&lease2, "user1", "15551234567@c.us", "hi")
            .await;
        assert_eq!(loopback2.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn timed_out_attempt_counts_as_failed() {
        let (lease, loopback) = leased_transport().await;
        loopback.set_send_delay(Duration::from_millis(100));

        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(10),
            retry_delay: Duration::from_millis(5),
            reinit_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let dispatcher = MessageDispatcher::new(policy);

        let error = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap_err();

        match error {
            DispatchError::DeliveryFailed { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, TransportError::Timeout));
            }
            other => panic!("expected DeliveryFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_lease_stops_dispatch() {
        let (lease, loopback) = leased_transport().await;
        loopback.script_send(Err(TransportError::Failed("flaky".to_string())));

        let policy = RetryPolicy {
            retry_delay: Duration::from_secs(60),
            ..fast_policy()
        };
        let dispatcher = MessageDispatcher::new(policy);

        let cancel = lease.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let error = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap_err();

        assert!(matches!(error, DispatchError::Cancelled));
        assert_eq!(loopback.send_calls().len(), 1);
    }

    #[tokio::test]
    async fn unready_transport_consumes_attempts_without_sending() {
        let (lease, loopback) = leased_transport().await;
        loopback.set_ready(false);

        let policy = RetryPolicy {
            max_attempts: 2,
            ..fast_policy()
        };
        let dispatcher = MessageDispatcher::new(policy);

        let error = dispatcher
            .deliver(&lease, "user1", "15551234567@c.us", "hi")
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DispatchError::DeliveryFailed {
                attempts: 2,
                source: TransportError::NotReady,
            }
        ));
        assert!(loopback.send_calls().is_empty());
    }
}
