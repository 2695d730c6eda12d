//! Version 1 API handlers.

mod sessions;

pub use sessions::{
    list_sessions, reset_session, send_message, session_challenge, session_status,
};
