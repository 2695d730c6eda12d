//! Pending authentication challenges.
//!
//! While a session sits in `AwaitingScan` it has exactly one challenge: the
//! opaque payload the transport asked the end user to scan, optionally
//! rendered into image bytes by the [`ChallengeRenderer`] collaborator.
//! Challenges are superseded on re-issue, cleared when the session leaves
//! `AwaitingScan`, and removed by the janitor's TTL sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::identity::Identity;

/// Default challenge lifetime (10 minutes).
pub fn default_ttl() -> Duration {
    Duration::minutes(10)
}

// ============================================================================
// Challenge
// ============================================================================

/// A time-boxed authentication challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub identity: Identity,
    /// Opaque scan-code payload issued by the transport.
    pub payload: String,
    /// Rendered artifact (image bytes), absent when rendering failed.
    pub artifact: Option<Vec<u8>>,
    pub issued_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Challenge {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > self.ttl
    }
}

// ============================================================================
// Challenge Store
// ============================================================================

/// Holds the pending challenge per identity.
///
/// Thread-safe and cheap to clone. Mutated only through this API; expiry
/// removal happens exclusively in [`ChallengeStore::sweep_expired`].
#[derive(Clone)]
pub struct ChallengeStore {
    entries: Arc<DashMap<Identity, Challenge>>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Store a challenge for `identity`, replacing any previous one.
    pub fn put(&self, identity: &Identity, payload: String, artifact: Option<Vec<u8>>) {
        let challenge = Challenge {
            identity: identity.clone(),
            payload,
            artifact,
            issued_at: Utc::now(),
            ttl: self.ttl,
        };
        let replaced = self.entries.insert(identity.clone(), challenge).is_some();
        debug!(identity = %identity, replaced, "challenge stored");
    }

    pub fn get(&self, identity: &Identity) -> Option<Challenge> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove the challenge for `identity`. Returns true if one existed.
    pub fn clear(&self, identity: &Identity) -> bool {
        self.entries.remove(identity).is_some()
    }

    /// Remove every challenge older than its TTL at `now`.
    ///
    /// Returns the identities whose challenges expired; the caller is
    /// expected to tear down the owning sessions.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Identity> {
        let expired: Vec<Identity> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for identity in &expired {
            self.entries.remove(identity);
            debug!(identity = %identity, "challenge expired");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Renderer
// ============================================================================

/// Renders a challenge payload into a presentable artifact.
///
/// Rendering is an external concern; the core never encodes images itself.
/// A failed render is logged by the caller and the challenge is stored
/// without an artifact.
#[async_trait]
pub trait ChallengeRenderer: Send + Sync {
    async fn render(&self, payload: &str) -> Result<Vec<u8>, RenderError>;
}

/// Error from a renderer implementation.
#[derive(Debug, Error)]
#[error("challenge rendering failed: {0}")]
pub struct RenderError(pub String);

/// Renderer that returns the payload bytes verbatim.
///
/// Used when clients render the scan code themselves.
pub struct PassthroughRenderer;

#[async_trait]
impl ChallengeRenderer for PassthroughRenderer {
    async fn render(&self, payload: &str) -> Result<Vec<u8>, RenderError> {
        Ok(payload.as_bytes().to_vec())
    }
}
