//! Optimistic append with conflict recovery.
//!
//! A submission carries the cursor the author was looking at. The server
//! rejects it if anything landed since; the controller then pulls the new
//! events so the author can read them before trying again. Nothing is ever
//! resubmitted automatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::EngineHandle;
use crate::error::SyncError;
use crate::remote::RemoteLog;
use crate::sync::{SessionSnapshot, SyncPhase};

/// Why a submission did not go through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    #[error("message is empty")]
    EmptyContent,

    #[error("a message is already being posted")]
    InFlight,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl PostError {
    /// The log moved on; new events were fetched and should be read first.
    pub fn is_stale(&self) -> bool {
        matches!(self, PostError::Sync(SyncError::ConcurrencyConflict))
    }
}

/// An accepted submission.
#[derive(Debug, Clone)]
pub struct PostOutcome {
    /// Number the server assigned to the message.
    pub event_number: u64,
    /// State after the follow-up refetch (or the last known state if that
    /// refetch failed).
    pub snapshot: SessionSnapshot,
}

/// Text being composed, plus the optional next-speaker hint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub next: Option<String>,
}

/// Submits messages to whatever session the engine is syncing.
pub struct PostController {
    remote: Arc<dyn RemoteLog>,
    engine: EngineHandle,
    draft: Mutex<Draft>,
    in_flight: AtomicBool,
    last_error: Mutex<Option<PostError>>,
}

impl PostController {
    pub fn new(remote: Arc<dyn RemoteLog>, engine: EngineHandle) -> Self {
        Self {
            remote,
            engine,
            draft: Mutex::new(Draft::default()),
            in_flight: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn draft(&self) -> Draft {
        self.draft.lock().clone()
    }

    pub fn set_draft(&self, content: impl Into<String>) {
        self.draft.lock().content = content.into();
    }

    pub fn set_next(&self, next: Option<String>) {
        self.draft.lock().next = next;
    }

    pub fn is_posting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Error from the most recent submission, cleared by the next success.
    pub fn last_error(&self) -> Option<PostError> {
        self.last_error.lock().clone()
    }

    /// Submit the current draft. The draft is kept on failure.
    pub async fn submit_draft(&self) -> Result<PostOutcome, PostError> {
        let draft = self.draft();
        self.submit(&draft.content, draft.next.as_deref()).await
    }

    /// Post `content` against the engine's current cursor.
    ///
    /// Content and `next` are trimmed; a blank `next` means none. The draft
    /// is cleared once the server accepts the message.
    ///
    /// Fails with [`SyncError::TornDown`] once the engine is shut down, and
    /// when the engine switched sessions or shut down while the append was
    /// outstanding. In the latter case the result is dropped: no refetch, no
    /// recorded error, draft untouched.
    pub async fn submit(
        &self,
        content: &str,
        next: Option<&str>,
    ) -> Result<PostOutcome, PostError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PostError::EmptyContent);
        }
        let next = next.map(str::trim).filter(|n| !n.is_empty());

        let _guard = InFlightGuard::acquire(&self.in_flight).ok_or(PostError::InFlight)?;

        let snap = self.engine.snapshot();
        if snap.phase == SyncPhase::TornDown || self.engine.is_shut_down() {
            return Err(PostError::Sync(SyncError::TornDown));
        }
        let expected = snap.cursor;

        let result = self.remote.append(&snap.session_id, content, expected, next).await;
        if self.replica_replaced(&snap) {
            debug!(
                session = %snap.session_id,
                ?result,
                "dropping post result for a replaced replica"
            );
            return Err(PostError::Sync(SyncError::TornDown));
        }

        match result {
            Ok(event_number) => {
                info!(session = %snap.session_id, event_number, "message posted");
                *self.last_error.lock() = None;
                *self.draft.lock() = Draft::default();
                let snapshot = match self.engine.refetch().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("refetch after post failed: {e}");
                        self.engine.snapshot()
                    }
                };
                Ok(PostOutcome { event_number, snapshot })
            }
            Err(SyncError::ConcurrencyConflict) => {
                warn!(session = %snap.session_id, after = expected, "post rejected as stale");
                let err = PostError::Sync(SyncError::ConcurrencyConflict);
                *self.last_error.lock() = Some(err.clone());
                if let Err(e) = self.engine.refetch().await {
                    warn!("refetch after stale post failed: {e}");
                }
                Err(err)
            }
            Err(e) => {
                warn!(session = %snap.session_id, "post failed: {e}");
                let err = PostError::Sync(e);
                *self.last_error.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    /// The engine switched sessions or shut down since `before` was taken.
    fn replica_replaced(&self, before: &SessionSnapshot) -> bool {
        self.engine.is_shut_down() || self.engine.snapshot().generation != before.generation
    }
}

/// Holds the single-flight flag for the duration of a submission.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
