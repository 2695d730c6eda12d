//! Session handle for communicating with a lifecycle task.
//!
//! `SessionHandle` is a thin wrapper around an `mpsc::Sender<SessionCommand>`.
//! It is cheap to clone; all methods are async and communicate with the
//! lifecycle task via message passing.

use tokio::sync::{mpsc, oneshot};

use crate::identity::Identity;

use super::lifecycle::{SessionCommand, SessionError, SessionSnapshot, TransportLease};

/// Handle for interacting with a session's lifecycle task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    identity: Identity,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::Sender<SessionCommand>, identity: Identity) -> Self {
        Self { tx, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Get a point-in-time view of the session.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;

        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Borrow the transport for dispatch.
    ///
    /// Granted only in `Ready` state; the lease's token is cancelled when
    /// the session is torn down or reset.
    pub async fn lease(&self) -> Result<TransportLease, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Lease { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;

        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Tear the session down: revoke leases, clear the challenge, release
    /// the transport. Idempotent.
    pub async fn teardown(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Teardown { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Closed)?;

        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity)
            .finish()
    }
}
