//! Wire protocol for communication between chatrelay and transport processes.
//!
//! A transport process owns the actual connection to the messaging network
//! for exactly one identity, including its authentication flow and credential
//! persistence. Chatrelay spawns one process per identity and speaks this
//! protocol with it.
//!
//! # Protocol Overview
//!
//! The protocol is bidirectional with JSON Lines (newline-delimited JSON)
//! over stdio:
//!
//! - **Commands** (chatrelay → transport): instructions to the transport
//! - **Events** (transport → chatrelay): lifecycle notifications and command
//!   acknowledgements
//!
//! Commands that produce a result carry a `request_id`; the transport answers
//! with an `ack` event echoing the same id. Lifecycle events carry no id and
//! may be emitted at any time.
//!
//! # Example: Minimal Transport
//!
//! ```ignore
//! use chatrelay_transport_protocol::{TransportCommand, TransportEvent};
//!
//! // Read commands from stdin
//! let line = read_line_from_stdin();
//! let command: TransportCommand = serde_json::from_str(&line)?;
//!
//! // Send events to stdout
//! let event = TransportEvent::Qr { payload: "2@AbCdEf...".to_string() };
//! println!("{}", serde_json::to_string(&event)?);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (chatrelay → transport)
// ============================================================================

/// Commands sent from chatrelay to a transport process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportCommand {
    /// Connect to the messaging network and begin authentication.
    ///
    /// The transport answers with lifecycle events (`qr`, `authenticated`,
    /// `ready`, ...) as the flow progresses, and an `ack` once the connection
    /// attempt has been started.
    Initialize { request_id: String },

    /// Deliver a message to a canonical address.
    SendMessage {
        request_id: String,
        address: String,
        body: String,
    },

    /// Tear down the connection and release its resources.
    ///
    /// Credentials persisted by the transport survive destruction so a later
    /// `initialize` can re-authenticate without a fresh scan.
    Destroy { request_id: String },

    /// Request graceful process exit.
    Shutdown,
}

// ============================================================================
// Events (transport → chatrelay)
// ============================================================================

/// Events sent from a transport process to chatrelay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A fresh challenge payload that must be scanned to authenticate.
    Qr { payload: String },

    /// The challenge was scanned and credentials are established.
    Authenticated,

    /// The connection is fully usable for sending messages.
    Ready,

    /// Authentication was rejected by the messaging network.
    AuthFailure { reason: String },

    /// The connection to the messaging network was lost.
    Disconnected { reason: String },

    /// The transport hit a fault without a confirmed disconnect.
    Error { detail: String },

    /// Completion of a command identified by `request_id`.
    Ack {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
    },
}

/// Failure detail attached to a negative `ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckError {
    pub kind: AckErrorKind,
    pub detail: String,
}

/// Classification of a failed command, as reported by the transport itself.
///
/// Chatrelay treats `recipient_not_found` as terminal and `crashed` as a
/// signal to destroy and re-initialize; everything else is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckErrorKind {
    /// The recipient does not exist on the messaging network.
    RecipientNotFound,
    /// The transport is not (yet) connected.
    NotReady,
    /// The transport's internal session crashed and needs re-initialization.
    Crashed,
    /// Any other failure that may succeed on retry.
    Transient,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd = TransportCommand::SendMessage {
            request_id: "req_1".to_string(),
            address: "15551234567@c.us".to_string(),
            body: "hi".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"send_message""#));
        assert!(json.contains(r#""request_id":"req_1""#));

        let parsed: TransportCommand = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, TransportCommand::SendMessage { .. }));
    }

    #[test]
    fn lifecycle_event_roundtrip() {
        let event = TransportEvent::Qr {
            payload: "2@AbC".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"qr","payload":"2@AbC"}"#);

        let parsed: TransportEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(parsed, TransportEvent::Ready));
    }

    #[test]
    fn ack_optional_fields_are_omitted() {
        let event = TransportEvent::Ack {
            request_id: "req_2".to_string(),
            message_id: None,
            timestamp: None,
            error: Some(AckError {
                kind: AckErrorKind::RecipientNotFound,
                detail: "no such account".to_string(),
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("message_id"));
        assert!(json.contains(r#""kind":"recipient_not_found""#));
    }

    #[test]
    fn ack_parses_without_error_field() {
        let parsed: TransportEvent =
            serde_json::from_str(r#"{"type":"ack","request_id":"req_3","message_id":"m1"}"#)
                .unwrap();
        match parsed {
            TransportEvent::Ack {
                request_id,
                message_id,
                error,
                ..
            } => {
                assert_eq!(request_id, "req_3");
                assert_eq!(message_id.as_deref(), Some("m1"));
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
