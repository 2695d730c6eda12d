//! Session management for chatrelay.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────────┐        ┌──────────────────┐
//!  │ SessionRegistry │──owns──▶ SessionLifecycle │  (one per identity, runs in a tokio task)
//!  │ (Identity → H)  │        │ owns state + the │
//!  └────────┬────────┘        │ Transport, plays │
//!           │                 │ events in order  │
//!           │ clone           └────────▲─────────┘
//!           ▼                          │ mpsc commands / transport events
//!  ┌─────────────────┐                 │
//!  │  SessionHandle  │─────────────────┘  (cheap cloneable sender)
//!  └─────────────────┘
//! ```
//!
//! - **SessionLifecycle** — owns the mutable session state and the transport
//!   instance; consumes transport events strictly in arrival order and
//!   applies the lifecycle state machine. No locks are held across awaits.
//! - **SessionHandle** — cloneable reference that sends commands to a
//!   lifecycle task. All external code interacts with sessions through
//!   handles.
//! - **SessionRegistry** — maps identities to handles; enforces one live
//!   session per identity via per-identity locks; manages task lifecycle
//!   (create, replace failed, reset, shutdown).
//!
//! The dispatcher never touches the transport directly: it asks the
//! lifecycle for a [`TransportLease`], which is granted only in `Ready`
//! state and revoked (cancelled) on teardown.

mod handle;
mod lifecycle;
mod registry;

pub use handle::SessionHandle;
pub use lifecycle::{
    LifecycleTimeouts, SessionError, SessionSnapshot, TransportLease,
};
pub use registry::{RegistryConfig, SessionRegistry};
