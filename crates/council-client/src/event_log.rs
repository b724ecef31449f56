//! Append-only event log with derived participant state.
//!
//! The log is the client's copy of a session's history. It only grows:
//! existing events are never mutated or removed, and a batch is accepted only
//! when it continues the tail exactly (`cursor + 1, cursor + 2, ...`). Because
//! the first event of a session is `#1`, the log always starts there and an
//! event's index is `number - 1`.
//!
//! Participants are derived by replaying `joined` / `left` events in order:
//! a duplicate join is idempotent, and a `left` for an absent name is a no-op.
//! No membership validation happens here; that is the server's job.

use std::collections::BTreeSet;
use std::sync::Arc;

use council_types::{Event, EventKind};
use thiserror::Error;

use crate::error::SyncError;

/// Precondition failures of [`EventLog::append`] and [`EventLog::initialize`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Event is at or below the cursor (already present).
    #[error("event #{number} is already in the log (cursor {cursor})")]
    Duplicate { number: u64, cursor: u64 },

    /// Event skips past the next expected number.
    #[error("gap after #{previous}: expected #{expected}, got #{got}")]
    Gap { previous: u64, expected: u64, got: u64 },

    /// Batch goes backwards or repeats itself after the cursor.
    #[error("batch not ascending: #{got} follows #{previous}")]
    NotAscending { previous: u64, got: u64 },

    /// A full log must begin with the session's first event.
    #[error("full log must start at #1, got #{got}")]
    NotStartingAtOne { got: u64 },
}

impl From<LogError> for SyncError {
    fn from(e: LogError) -> Self {
        SyncError::ProtocolViolation(e.to_string())
    }
}

/// Ordered, gapless, append-only sequence of events for one session.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    /// Shared so snapshots can hold the history without copying it.
    /// `Arc::make_mut` copies only while an old snapshot is still alive.
    events: Arc<Vec<Event>>,
    participants: BTreeSet<String>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest event number present, or 0 when empty.
    pub fn cursor(&self) -> u64 {
        self.events.last().map(|e| e.number).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Cheap handle to the current history.
    pub fn shared(&self) -> Arc<Vec<Event>> {
        Arc::clone(&self.events)
    }

    /// Events with `number > after`.
    pub fn events_after(&self, after: u64) -> &[Event] {
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(self.events.len());
        &self.events[start..]
    }

    /// Participants derived by replay, sorted.
    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    pub fn is_participant(&self, name: &str) -> bool {
        self.participants.contains(name)
    }

    /// `next` of the most recent message, if that message named one.
    pub fn latest_next_hint(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find(|e| e.is_message())
            .and_then(|e| e.next_hint())
    }

    /// Clear everything back to the empty state.
    pub fn reset(&mut self) {
        self.events = Arc::new(Vec::new());
        self.participants.clear();
    }

    /// Replace the log with a complete history in one shot.
    ///
    /// Used by the initial load, where there is no prior state to continue.
    /// The batch must be `#1..=#n` with no gaps; on error nothing changes.
    pub fn initialize(&mut self, events: Vec<Event>) -> Result<(), LogError> {
        if let Some(first) = events.first() {
            if first.number != 1 {
                return Err(LogError::NotStartingAtOne { got: first.number });
            }
        }
        check_contiguous(&events, 0)?;

        let mut participants = BTreeSet::new();
        replay(&mut participants, &events);
        self.events = Arc::new(events);
        self.participants = participants;
        Ok(())
    }

    /// Append a batch that continues the tail.
    ///
    /// The whole batch is validated before anything is applied, so a rejected
    /// batch leaves the log untouched. Re-applying an already merged batch is
    /// rejected as [`LogError::Duplicate`], which makes merges idempotent.
    ///
    /// Returns the number of events appended.
    pub fn append(&mut self, events: &[Event]) -> Result<usize, LogError> {
        if events.is_empty() {
            return Ok(0);
        }
        check_contiguous(events, self.cursor())?;

        replay(&mut self.participants, events);
        Arc::make_mut(&mut self.events).extend_from_slice(events);
        Ok(events.len())
    }
}

/// Verify `events` is exactly `cursor + 1, cursor + 2, ...`.
fn check_contiguous(events: &[Event], cursor: u64) -> Result<(), LogError> {
    let mut previous = cursor;
    for event in events {
        let expected = previous + 1;
        if event.number == expected {
            previous = event.number;
            continue;
        }
        if event.number <= cursor {
            return Err(LogError::Duplicate { number: event.number, cursor });
        }
        if event.number < expected {
            return Err(LogError::NotAscending { previous, got: event.number });
        }
        return Err(LogError::Gap { previous, expected, got: event.number });
    }
    Ok(())
}

fn replay(participants: &mut BTreeSet<String>, events: &[Event]) {
    for event in events {
        let Some(name) = event.participant() else {
            continue;
        };
        match event.kind {
            EventKind::Joined => {
                participants.insert(name.to_string());
            }
            EventKind::Left => {
                participants.remove(name);
            }
            EventKind::SessionCreated | EventKind::Message => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
