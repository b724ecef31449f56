//! Cursor-based session sync, independent of any runtime.
//!
//! [`SyncManager`] owns the local replica of one session and decides what to
//! fetch next and how to merge what comes back. It performs no I/O: the async
//! driver in [`crate::engine`] asks it for a [`FetchTicket`], runs the request,
//! and hands the result back through [`SyncManager::apply`]. That keeps every
//! protocol decision unit-testable.
//!
//! # Sync Protocol
//!
//! - `Uninitialized` -> full fetch (`after` omitted), replica built in one shot
//! - `Settled` -> incremental fetch after the cursor, merged by append
//! - every successful response refreshes the authoritative participants and
//!   event count, even when it carries no events
//! - a response inconsistent with the cursor is a protocol violation: it is
//!   rejected whole, recorded, and the next tick tries again
//! - at most one fetch is outstanding; results from an older generation
//!   (before a session switch or tear-down) are discarded
//!
//! # State Machine
//!
//! ```text
//!   +---------------+  begin_fetch   +---------+   ok    +---------+
//!   | Uninitialized | -------------> | Loading | ------> | Settled | <-+ tick / refetch
//!   +---------------+                +---------+         +---------+ --+
//!                                     |  |   ^ refetch        |
//!                               error |  |   |                | 404
//!                                     v  |   |                v
//!                              +------------+ |  404     +----------+
//!                              | LoadFailed | +--------> | NotFound |
//!                              +------------+            +----------+
//!
//!   any state --tear_down--> TornDown        any state --reset(id)--> Uninitialized
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use council_types::{is_reserved_name, Event, StatusResponse};
use tracing::{debug, error, info, trace, warn};

use crate::error::SyncError;
use crate::event_log::EventLog;

/// Lifecycle of one session replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing fetched yet.
    Uninitialized,
    /// Initial full fetch outstanding.
    Loading,
    /// Initial fetch failed. No polling; `refetch` retries the full load.
    LoadFailed,
    /// Replica populated; polling incrementally.
    Settled,
    /// Server does not know the session. Terminal.
    NotFound,
    /// Stopped. Terminal.
    TornDown,
}

impl SyncPhase {
    /// Whether the initial load has reached an outcome (success or failure).
    pub fn is_resolved(&self) -> bool {
        !matches!(self, SyncPhase::Uninitialized | SyncPhase::Loading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::NotFound | SyncPhase::TornDown)
    }
}

/// Whether a fetch rebuilds the replica or extends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Full,
    Incremental,
}

/// What asked for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTrigger {
    /// The polling timer.
    Tick,
    /// An explicit request (e.g. after an append was accepted or rejected).
    Refetch,
}

/// Permission to run one fetch. Must be handed back to [`SyncManager::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub cursor: u64,
    pub kind: FetchKind,
}

/// Why [`SyncManager::begin_fetch`] refused to start a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another fetch is outstanding.
    InFlight,
    /// Timer tick while the initial load has failed; waits for a refetch.
    NotLoaded,
    /// Session unknown to the server.
    NotFound,
    /// Replica torn down.
    TornDown,
}

/// Outcome of applying a fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// Replica built from a full fetch.
    Loaded { event_count: u64 },
    /// Incremental fetch merged (`added` may be 0; aggregates still refreshed).
    Merged { added: usize },
    /// Result belonged to an older generation and was dropped.
    Discarded,
    /// Fetch failed or the response was rejected; recorded as last error.
    Failed(SyncError),
}

/// Consumer-facing copy of the replica, cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: SyncPhase,
    /// Confirmed history, ascending by number.
    pub events: Arc<Vec<Event>>,
    /// Highest confirmed event number (0 when empty).
    pub cursor: u64,
    /// Authoritative event count from the latest response.
    pub event_count: u64,
    /// Authoritative participants from the latest response.
    pub participants: Vec<String>,
    pub last_error: Option<SyncError>,
    /// Bumped on every state change.
    pub version: u64,
    /// Changes on session switch and tear-down, never otherwise.
    pub generation: u64,
}

impl SessionSnapshot {
    pub fn is_settled(&self) -> bool {
        self.phase == SyncPhase::Settled
    }

    /// Events with `number > after`.
    pub fn events_after(&self, after: u64) -> &[Event] {
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(self.events.len());
        &self.events[start..]
    }

    /// `next` of the most recent message, if it named one.
    pub fn latest_next_hint(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find(|e| e.is_message())
            .and_then(|e| e.next_hint())
    }
}

/// Manages the replica and fetch decisions for a single session.
#[derive(Debug, Clone)]
pub struct SyncManager {
    session_id: String,
    phase: SyncPhase,
    log: EventLog,
    /// Authoritative aggregates, replaced by every successful response.
    event_count: u64,
    participants: Vec<String>,
    last_error: Option<SyncError>,
    /// Outstanding fetch, if any. At most one.
    in_flight: Option<FetchTicket>,
    /// Bumped by `reset` and `tear_down`; tickets from older generations are stale.
    generation: u64,
    version: u64,
}

impl SyncManager {
    /// Create a manager for `session_id` in the `Uninitialized` state.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            phase: SyncPhase::Uninitialized,
            log: EventLog::new(),
            event_count: 0,
            participants: Vec::new(),
            last_error: None,
            in_flight: None,
            generation: 0,
            version: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn cursor(&self) -> u64 {
        self.log.cursor()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn in_flight(&self) -> Option<&FetchTicket> {
        self.in_flight.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            events: self.log.shared(),
            cursor: self.log.cursor(),
            event_count: self.event_count,
            participants: self.participants.clone(),
            last_error: self.last_error.clone(),
            version: self.version,
            generation: self.generation,
        }
    }

    /// Discard the replica and start over for `session_id`.
    ///
    /// Any outstanding ticket becomes stale; its result will be discarded.
    pub fn reset(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        info!(from = %self.session_id, to = %session_id, "resetting session replica");
        self.session_id = session_id;
        self.phase = SyncPhase::Uninitialized;
        self.log.reset();
        self.event_count = 0;
        self.participants.clear();
        self.last_error = None;
        self.in_flight = None;
        self.generation = self.generation.wrapping_add(1);
        self.bump();
    }

    /// Stop for good. Later results are discarded and no fetch is started.
    pub fn tear_down(&mut self) {
        if self.phase == SyncPhase::TornDown {
            return;
        }
        debug!(session = %self.session_id, "tearing down session replica");
        self.phase = SyncPhase::TornDown;
        self.in_flight = None;
        self.generation = self.generation.wrapping_add(1);
        self.bump();
    }

    /// Decide whether a fetch may start now and, if so, what it fetches.
    pub fn begin_fetch(&mut self, trigger: FetchTrigger) -> Result<FetchTicket, SkipReason> {
        match self.phase {
            SyncPhase::TornDown => return Err(SkipReason::TornDown),
            SyncPhase::NotFound => return Err(SkipReason::NotFound),
            _ => {}
        }
        if self.in_flight.is_some() {
            return Err(SkipReason::InFlight);
        }

        let kind = match (self.phase, trigger) {
            (SyncPhase::Settled, _) => FetchKind::Incremental,
            (SyncPhase::LoadFailed, FetchTrigger::Tick) => return Err(SkipReason::NotLoaded),
            _ => FetchKind::Full,
        };

        if kind == FetchKind::Full && self.phase != SyncPhase::Loading {
            info!(session = %self.session_id, "loading session");
            self.phase = SyncPhase::Loading;
            self.bump();
        }

        let ticket = FetchTicket {
            generation: self.generation,
            cursor: match kind {
                FetchKind::Full => 0,
                FetchKind::Incremental => self.log.cursor(),
            },
            kind,
        };
        trace!(?trigger, ?ticket, "fetch started");
        self.in_flight = Some(ticket);
        Ok(ticket)
    }

    /// Apply the result of the fetch `ticket` was issued for.
    pub fn apply(
        &mut self,
        ticket: FetchTicket,
        result: Result<StatusResponse, SyncError>,
    ) -> SyncResult {
        if ticket.generation != self.generation || self.phase == SyncPhase::TornDown {
            debug!(
                ticket_generation = ticket.generation,
                generation = self.generation,
                "discarding result from a previous generation"
            );
            return SyncResult::Discarded;
        }
        self.in_flight = None;

        let outcome = result.and_then(|response| match ticket.kind {
            FetchKind::Full => self.apply_full(response),
            FetchKind::Incremental => self.apply_incremental(ticket.cursor, response),
        });

        match outcome {
            Ok(result) => {
                self.last_error = None;
                self.bump();
                result
            }
            Err(e) => {
                self.record_failure(ticket.kind, &e);
                SyncResult::Failed(e)
            }
        }
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn apply_full(&mut self, response: StatusResponse) -> Result<SyncResult, SyncError> {
        self.check_session(&response)?;

        // Build aside so a rejected response leaves the replica untouched.
        let mut log = EventLog::new();
        log.initialize(response.events)?;
        if log.cursor() != response.event_count {
            return Err(SyncError::ProtocolViolation(format!(
                "server reports {} events but the full log ends at #{}",
                response.event_count,
                log.cursor()
            )));
        }

        self.log = log;
        self.event_count = response.event_count;
        self.participants = response.participants;
        self.phase = SyncPhase::Settled;
        self.check_participants();

        info!(
            session = %self.session_id,
            count = self.event_count,
            participants = self.participants.len(),
            "session loaded"
        );
        Ok(SyncResult::Loaded { event_count: self.event_count })
    }

    fn apply_incremental(
        &mut self,
        cursor: u64,
        response: StatusResponse,
    ) -> Result<SyncResult, SyncError> {
        self.check_session(&response)?;

        let last = response.events.last().map(|e| e.number).unwrap_or(cursor);
        if last != response.event_count {
            return Err(SyncError::ProtocolViolation(format!(
                "server reports {} events but the batch after #{} ends at #{}",
                response.event_count, cursor, last
            )));
        }

        let added = self.log.append(&response.events)?;
        self.event_count = response.event_count;
        self.participants = response.participants;
        if added > 0 {
            self.check_participants();
            debug!(session = %self.session_id, added, cursor = self.log.cursor(), "merged events");
        } else {
            trace!(session = %self.session_id, cursor, "no new events");
        }
        Ok(SyncResult::Merged { added })
    }

    fn check_session(&self, response: &StatusResponse) -> Result<(), SyncError> {
        if response.session_id != self.session_id {
            return Err(SyncError::ProtocolViolation(format!(
                "response is for session '{}', expected '{}'",
                response.session_id, self.session_id
            )));
        }
        Ok(())
    }

    /// The replayed set and the server's list can differ legitimately (the
    /// server hides the moderator), so a mismatch is only logged. The
    /// server's list is what consumers see.
    fn check_participants(&self) {
        let replayed: BTreeSet<&str> = self
            .log
            .participants()
            .iter()
            .map(String::as_str)
            .filter(|name| !is_reserved_name(name))
            .collect();
        let reported: BTreeSet<&str> = self.participants.iter().map(String::as_str).collect();
        if replayed != reported {
            warn!(
                session = %self.session_id,
                ?replayed,
                ?reported,
                "replayed participants differ from server aggregate"
            );
        }
    }

    fn record_failure(&mut self, kind: FetchKind, e: &SyncError) {
        match e {
            SyncError::SessionNotFound { .. } => {
                warn!(session = %self.session_id, "session not found, polling stopped");
                self.phase = SyncPhase::NotFound;
            }
            SyncError::ProtocolViolation(msg) => {
                error!(session = %self.session_id, "rejected server response: {msg}");
            }
            _ if e.is_transient() => {
                warn!(session = %self.session_id, "fetch failed, retrying on next tick: {e}");
            }
            _ => {
                warn!(session = %self.session_id, "fetch failed: {e}");
            }
        }
        if kind == FetchKind::Full && self.phase == SyncPhase::Loading {
            self.phase = SyncPhase::LoadFailed;
        }
        self.last_error = Some(e.clone());
        self.bump();
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

// ============================================================================
// TESTS
// ============================================================================
