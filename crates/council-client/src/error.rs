//! Error taxonomy shared by the sync engine and the post controller.

use thiserror::Error;

/// Failures talking to, or believing, the remote session log.
///
/// `Clone` so the latest one can sit in a published
/// [`SessionSnapshot`](crate::sync::SessionSnapshot) as the consumer-visible
/// "last error".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transport failure (`status = None`) or a non-success HTTP status.
    /// Retried by the next poll tick.
    #[error("{}", network_message(.status, .message))]
    Network { status: Option<u16>, message: String },

    /// The server does not know this session. Terminal for the session.
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// An append was rejected because the log moved past the expected cursor.
    #[error("new events arrived since the expected cursor; review them before posting")]
    ConcurrencyConflict,

    /// The server returned data inconsistent with the cursor (gap, duplicate,
    /// count mismatch, wrong session, undecodable body).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The engine was torn down before the request completed.
    #[error("sync engine shut down")]
    TornDown,
}

fn network_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("server returned {code}: {message}"),
        None => format!("network error: {message}"),
    }
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Network {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the next poll tick may clear this error on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network { .. } | SyncError::ProtocolViolation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::ConcurrencyConflict)
    }
}
