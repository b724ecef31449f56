//! Shared event and wire types for council sessions.
//!
//! A council session is an append-only, numbered log of events held by a
//! server. This crate is the leaf every other crate builds on: it has **no
//! internal council dependencies** and no I/O.
//!
//! # Key Types
//!
//! |---------------------------|------------------------------------------------|
//! | Type                      | Purpose                                        |
//! |---------------------------|------------------------------------------------|
//! | [`Event`]                 | One immutable, numbered log record             |
//! | [`EventKind`]             | session_created / joined / left / message      |
//! | [`StatusResponse`]        | `GET /api/status` payload                      |
//! | [`PostRequest`]           | `POST /api/post` body (optimistic append)      |
//! | [`PostResponse`]          | Number assigned to an accepted append          |
//! | [`ParticipantsResponse`]  | `GET /api/participants` payload                |
//! | [`ErrorResponse`]         | Body carried by non-success responses          |
//! |---------------------------|------------------------------------------------|

pub mod event;
pub mod wire;

pub use event::{Event, EventKind};
pub use wire::{ErrorResponse, ParticipantsResponse, PostRequest, PostResponse, StatusResponse};

/// Participant name the server posts on behalf of. Hidden from participant lists.
pub const MODERATOR: &str = "Moderator";

/// Whether `name` is reserved and cannot be used by a joining participant.
pub fn is_reserved_name(name: &str) -> bool {
    name == MODERATOR
}

/// Current time as Unix milliseconds. Used by the event constructors.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
