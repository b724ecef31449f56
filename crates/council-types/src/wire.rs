//! Request and response bodies of the council HTTP API.
//!
//! ```text
//! GET  /api/status?session={id}&after={cursor}  -> StatusResponse
//! POST /api/post  PostRequest                   -> PostResponse   (409 = stale cursor)
//! GET  /api/participants?session={id}           -> ParticipantsResponse
//! any non-success status                        -> ErrorResponse
//! ```

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Events after a cursor plus the authoritative aggregates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub session_id: String,
    /// Active participants, sorted, moderator excluded.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Total number of events in the session (= last event number).
    pub event_count: u64,
    /// Events with `number > after`, ascending.
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Optimistic append. Accepted only if `after` equals the server's last
/// event number at commit time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    pub session: String,
    pub content: String,
    pub after: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostResponse {
    pub event_number: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsResponse {
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
