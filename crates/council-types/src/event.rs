//! Session events.
//!
//! The wire shape is flat: every event carries `number`, `type` and
//! `timestamp_millis`, and the kind decides which of the optional fields are
//! present. Optional fields are omitted from JSON when absent.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// What an event records.
///
/// Closed set. Adding a variant is a protocol change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    /// First event of every session.
    SessionCreated,
    /// A participant joined.
    Joined,
    /// A participant left.
    Left,
    /// A participant posted a message.
    Message,
}

impl EventKind {
    /// Parse from the wire string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session_created",
            EventKind::Joined => "joined",
            EventKind::Left => "left",
            EventKind::Message => "message",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable record in a session log.
///
/// `number` is 1-based, gapless and unique within a session. It is both the
/// event's identity and the cursor unit used for fetching and appending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub number: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Assigned by the server when the event was accepted.
    pub timestamp_millis: i64,
    /// Actor for joined / left / message events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    /// Opaque message payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Who the author expects to speak next. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Session id, carried by `session_created`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Event {
    fn bare(number: u64, kind: EventKind) -> Self {
        Self {
            number,
            kind,
            timestamp_millis: crate::now_millis(),
            participant: None,
            content: None,
            next: None,
            id: None,
        }
    }

    pub fn session_created(number: u64, session_id: impl Into<String>) -> Self {
        Self {
            id: Some(session_id.into()),
            ..Self::bare(number, EventKind::SessionCreated)
        }
    }

    pub fn joined(number: u64, participant: impl Into<String>) -> Self {
        Self {
            participant: Some(participant.into()),
            ..Self::bare(number, EventKind::Joined)
        }
    }

    pub fn left(number: u64, participant: impl Into<String>) -> Self {
        Self {
            participant: Some(participant.into()),
            ..Self::bare(number, EventKind::Left)
        }
    }

    pub fn message(
        number: u64,
        participant: impl Into<String>,
        content: impl Into<String>,
        next: Option<String>,
    ) -> Self {
        Self {
            participant: Some(participant.into()),
            content: Some(content.into()),
            next,
            ..Self::bare(number, EventKind::Message)
        }
    }

    /// Override the timestamp (tests and fakes that need fixed values).
    pub fn at(mut self, timestamp_millis: i64) -> Self {
        self.timestamp_millis = timestamp_millis;
        self
    }

    pub fn is_message(&self) -> bool {
        self.kind == EventKind::Message
    }

    /// The `next` designation, only meaningful on messages.
    pub fn next_hint(&self) -> Option<&str> {
        if self.is_message() {
            self.next.as_deref()
        } else {
            None
        }
    }

    pub fn participant(&self) -> Option<&str> {
        self.participant.as_deref()
    }
}

// ============================================================================
// Tests
// ============================================================================
