//! Async driver for [`SyncManager`].
//!
//! One task owns the manager and the single outstanding fetch. Consumers hold
//! a cheap, cloneable [`EngineHandle`]: reads come from a `watch` channel of
//! [`SessionSnapshot`]s, control requests go over an mpsc channel and get a
//! oneshot reply.
//!
//! ```text
//!   EngineHandle (Clone)        mpsc       SyncEngine task
//!   ┌──────────────────┐  ──────────────▶  ┌────────────────────────────┐
//!   │ .refetch()       │                   │ SyncManager                │
//!   │ .switch_session()│  ◀──────────────  │ interval ticker            │
//!   │ .snapshot()      │      oneshot      │ one in-flight fetch        │
//!   │ .subscribe()     │  ◀──────────────  │                            │
//!   └──────────────────┘       watch       └────────────────────────────┘
//! ```
//!
//! The task ends on [`EngineHandle::shutdown`] or when every handle is dropped.
//! Either way the in-flight fetch is dropped unapplied and the final snapshot
//! reports [`SyncPhase::TornDown`].

use std::sync::Arc;
use std::time::Duration;

use council_types::StatusResponse;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ClientConfig;
use crate::constants::POLL_INTERVAL;
use crate::error::SyncError;
use crate::remote::RemoteLog;
use crate::sync::{
    FetchTicket, FetchTrigger, SessionSnapshot, SkipReason, SyncManager, SyncPhase, SyncResult,
};

/// Tuning for the engine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fixed period between poll ticks.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { poll_interval: POLL_INTERVAL }
    }
}

impl From<&ClientConfig> for EngineConfig {
    fn from(config: &ClientConfig) -> Self {
        Self { poll_interval: config.poll_interval() }
    }
}

// ============================================================================
// Commands (internal)
// ============================================================================

type Reply = oneshot::Sender<Result<SessionSnapshot, SyncError>>;

enum EngineCommand {
    Refetch { reply: Reply },
    SwitchSession { session_id: String, reply: oneshot::Sender<()> },
}

type FetchOutput = (FetchTicket, Result<StatusResponse, SyncError>);
type InFlight = BoxFuture<'static, FetchOutput>;

// ============================================================================
// EngineHandle
// ============================================================================

/// Handle to a running sync engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.state.borrow();
        f.debug_struct("EngineHandle")
            .field("session_id", &snap.session_id)
            .field("phase", &snap.phase)
            .field("cursor", &snap.cursor)
            .finish()
    }
}

impl EngineHandle {
    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// A receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn session_id(&self) -> String {
        self.state.borrow().session_id.clone()
    }

    /// Fetch now instead of waiting for the next tick.
    ///
    /// If a fetch is already outstanding, one more runs after it completes,
    /// so the returned snapshot always reflects a fetch that started after
    /// this call.
    pub async fn refetch(&self) -> Result<SessionSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Refetch { reply })
            .map_err(|_| SyncError::TornDown)?;
        rx.await.map_err(|_| SyncError::TornDown)?
    }

    /// Wait until the initial load of the current session has an outcome.
    pub async fn wait_settled(&self) -> Result<SessionSnapshot, SyncError> {
        let mut rx = self.state.clone();
        let snap = rx
            .wait_for(|s| s.phase.is_resolved())
            .await
            .map_err(|_| SyncError::TornDown)?
            .clone();
        match snap.phase {
            SyncPhase::Settled => Ok(snap),
            _ => Err(phase_error(&snap)),
        }
    }

    /// Discard the replica and start syncing `session_id` from scratch.
    ///
    /// Returns once the engine has reset; results of fetches issued for the
    /// previous session are never applied.
    pub async fn switch_session(&self, session_id: impl Into<String>) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::SwitchSession {
                session_id: session_id.into(),
                reply,
            })
            .map_err(|_| SyncError::TornDown)?;
        rx.await.map_err(|_| SyncError::TornDown)
    }

    /// Block until an event after `after` arrives and the most recent message
    /// names `participant` as next speaker.
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn wait_for_turn(
        &self,
        participant: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<SessionSnapshot>, SyncError> {
        let wait = turn_reached(self.state.clone(), participant, after);
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                debug!(participant, after, "timed out waiting for turn");
                Ok(None)
            }
        }
    }

    /// Stop the engine. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn turn_reached(
    mut rx: watch::Receiver<SessionSnapshot>,
    participant: &str,
    after: u64,
) -> Result<SessionSnapshot, SyncError> {
    loop {
        let snap = rx.borrow_and_update().clone();
        match snap.phase {
            SyncPhase::Settled => {
                if snap.cursor > after && snap.latest_next_hint() == Some(participant) {
                    return Ok(snap);
                }
            }
            SyncPhase::LoadFailed | SyncPhase::NotFound | SyncPhase::TornDown => {
                return Err(phase_error(&snap));
            }
            SyncPhase::Uninitialized | SyncPhase::Loading => {}
        }
        rx.changed().await.map_err(|_| SyncError::TornDown)?;
    }
}

fn phase_error(snap: &SessionSnapshot) -> SyncError {
    match snap.phase {
        SyncPhase::NotFound => SyncError::SessionNotFound {
            session_id: snap.session_id.clone(),
        },
        SyncPhase::TornDown => SyncError::TornDown,
        _ => snap
            .last_error
            .clone()
            .unwrap_or_else(|| SyncError::transport("initial load failed")),
    }
}

/// Start syncing `session_id`. The initial full fetch begins immediately.
///
/// Must be called from within a tokio runtime.
pub fn spawn_engine(
    remote: Arc<dyn RemoteLog>,
    session_id: impl Into<String>,
    config: EngineConfig,
) -> EngineHandle {
    let manager = SyncManager::new(session_id);
    let (state_tx, state_rx) = watch::channel(manager.snapshot());
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let engine = SyncEngine {
        remote,
        manager,
        config,
        state_tx,
        attached: Vec::new(),
        queued: Vec::new(),
    };
    tokio::spawn(engine.run(rx, cancel.clone()));

    EngineHandle {
        tx,
        state: state_rx,
        cancel,
    }
}

// ============================================================================
// SyncEngine (task-owned)
// ============================================================================

struct SyncEngine {
    remote: Arc<dyn RemoteLog>,
    manager: SyncManager,
    config: EngineConfig,
    state_tx: watch::Sender<SessionSnapshot>,
    /// Refetch callers answered by the fetch currently in flight.
    attached: Vec<Reply>,
    /// Refetch callers that arrived while a fetch was already in flight.
    queued: Vec<Reply>,
}

impl SyncEngine {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<EngineCommand>,
        cancel: CancellationToken,
    ) {
        info!(
            session = %self.manager.session_id(),
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "sync engine started"
        );

        let mut in_flight: Option<InFlight> = None;
        let _ = self.start_fetch(FetchTrigger::Tick, &mut in_flight);

        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut in_flight),
                    None => {
                        debug!("all engine handles dropped");
                        break;
                    }
                },
                (ticket, result) = next_result(&mut in_flight) => {
                    in_flight = None;
                    self.finish_fetch(ticket, result, &mut in_flight);
                }
                _ = ticker.tick() => {
                    let _ = self.start_fetch(FetchTrigger::Tick, &mut in_flight);
                }
            }
        }

        // Dropping the future abandons the request; its result is never applied.
        drop(in_flight);
        self.manager.tear_down();
        self.fail_waiters(SyncError::TornDown);
        self.publish();
        info!(session = %self.manager.session_id(), "sync engine stopped");
    }

    fn handle_command(&mut self, cmd: EngineCommand, in_flight: &mut Option<InFlight>) {
        match cmd {
            EngineCommand::Refetch { reply } => {
                if in_flight.is_some() {
                    trace!("refetch queued behind in-flight fetch");
                    self.queued.push(reply);
                    return;
                }
                match self.start_fetch(FetchTrigger::Refetch, in_flight) {
                    Ok(()) => self.attached.push(reply),
                    Err(reason) => {
                        let _ = reply.send(Err(self.skip_error(reason)));
                    }
                }
            }
            EngineCommand::SwitchSession { session_id, reply } => {
                *in_flight = None;
                self.fail_waiters(SyncError::TornDown);
                self.manager.reset(session_id);
                self.publish();
                let _ = self.start_fetch(FetchTrigger::Tick, in_flight);
                let _ = reply.send(());
            }
        }
    }

    fn start_fetch(
        &mut self,
        trigger: FetchTrigger,
        in_flight: &mut Option<InFlight>,
    ) -> Result<(), SkipReason> {
        let ticket = match self.manager.begin_fetch(trigger) {
            Ok(ticket) => ticket,
            Err(reason) => {
                trace!(?trigger, ?reason, "fetch skipped");
                return Err(reason);
            }
        };

        let remote = Arc::clone(&self.remote);
        let session_id = self.manager.session_id().to_string();
        *in_flight = Some(Box::pin(async move {
            let result = remote.fetch_since(&session_id, ticket.cursor).await;
            (ticket, result)
        }));
        self.publish();
        Ok(())
    }

    fn finish_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<StatusResponse, SyncError>,
        in_flight: &mut Option<InFlight>,
    ) {
        let outcome = self.manager.apply(ticket, result);
        self.publish();

        let reply = match outcome {
            SyncResult::Loaded { .. } | SyncResult::Merged { .. } => Ok(self.manager.snapshot()),
            SyncResult::Failed(e) => Err(e),
            SyncResult::Discarded => Err(SyncError::TornDown),
        };
        for waiter in self.attached.drain(..) {
            let _ = waiter.send(reply.clone());
        }

        if self.queued.is_empty() {
            return;
        }
        match self.start_fetch(FetchTrigger::Refetch, in_flight) {
            Ok(()) => self.attached = std::mem::take(&mut self.queued),
            Err(reason) => {
                let err = self.skip_error(reason);
                for waiter in self.queued.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    fn skip_error(&self, reason: SkipReason) -> SyncError {
        match reason {
            SkipReason::NotFound => SyncError::SessionNotFound {
                session_id: self.manager.session_id().to_string(),
            },
            SkipReason::TornDown => SyncError::TornDown,
            SkipReason::InFlight | SkipReason::NotLoaded => self
                .manager
                .last_error()
                .cloned()
                .unwrap_or_else(|| SyncError::transport("fetch could not start")),
        }
    }

    fn fail_waiters(&mut self, err: SyncError) {
        for waiter in self.attached.drain(..).chain(self.queued.drain(..)) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.manager.snapshot());
    }
}

/// Resolve the in-flight fetch, or never if there is none.
async fn next_result(in_flight: &mut Option<InFlight>) -> FetchOutput {
    match in_flight.as_mut() {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
