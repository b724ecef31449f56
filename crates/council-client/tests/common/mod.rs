//! Test fixtures: an in-memory council server usable directly as a
//! [`RemoteLog`] or served over HTTP with axum.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use council_client::{RemoteLog, SyncError};
use council_types::{
    ErrorResponse, Event, EventKind, ParticipantsResponse, PostRequest, PostResponse,
    StatusResponse, MODERATOR,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;

/// Poll period long enough that tests only advance via explicit refetches.
pub const QUIET: Duration = Duration::from_secs(3600);

/// Failure the fake should return from the next `fetch_since` calls.
#[derive(Debug, Clone)]
pub enum Fault {
    Error(SyncError),
    /// Return this response verbatim.
    Response(StatusResponse),
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    faults: Vec<Fault>,
    fetches: Vec<u64>,
    appends: Vec<PostRequest>,
    gated: bool,
    appends_held: bool,
}

/// One session held in memory with the server's optimistic append rule.
#[derive(Clone)]
pub struct FakeCouncil {
    session_id: String,
    inner: Arc<Mutex<Inner>>,
    /// Each permit lets one gated fetch complete.
    gate: Arc<Semaphore>,
    /// Each permit lets one held append through.
    append_gate: Arc<Semaphore>,
}

impl FakeCouncil {
    /// A session containing only its creation event.
    pub fn new(session_id: &str) -> Self {
        let fake = Self {
            session_id: session_id.to_string(),
            inner: Arc::new(Mutex::new(Inner::default())),
            gate: Arc::new(Semaphore::new(0)),
            append_gate: Arc::new(Semaphore::new(0)),
        };
        fake.inner.lock().events.push(Event::session_created(1, session_id));
        fake
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote(&self) -> Arc<dyn RemoteLog> {
        Arc::new(self.clone())
    }

    pub fn join(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock();
        let number = inner.events.len() as u64 + 1;
        inner.events.push(Event::joined(number, name));
        number
    }

    pub fn leave(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock();
        let number = inner.events.len() as u64 + 1;
        inner.events.push(Event::left(number, name));
        number
    }

    /// Append a message as `author`, bypassing the cursor check.
    pub fn say(&self, author: &str, content: &str, next: Option<&str>) -> u64 {
        let mut inner = self.inner.lock();
        let number = inner.events.len() as u64 + 1;
        inner
            .events
            .push(Event::message(number, author, content, next.map(String::from)));
        number
    }

    pub fn event_count(&self) -> u64 {
        self.inner.lock().events.len() as u64
    }

    /// Cursors passed to `fetch_since`, in call order.
    pub fn fetches(&self) -> Vec<u64> {
        self.inner.lock().fetches.clone()
    }

    pub fn appends(&self) -> Vec<PostRequest> {
        self.inner.lock().appends.clone()
    }

    /// Queue a fault for an upcoming fetch (FIFO).
    pub fn inject(&self, fault: Fault) {
        self.inner.lock().faults.push(fault);
    }

    /// Make fetches wait for [`release`](Self::release) before answering.
    pub fn set_gated(&self, gated: bool) {
        self.inner.lock().gated = gated;
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Make appends wait for [`release_append`](Self::release_append)
    /// before reaching the log.
    pub fn hold_appends(&self, held: bool) {
        self.inner.lock().appends_held = held;
    }

    pub fn release_append(&self) {
        self.append_gate.add_permits(1);
    }

    /// Status as the server computes it.
    pub fn status(&self, after: u64) -> StatusResponse {
        let inner = self.inner.lock();
        status_of(&self.session_id, &inner.events, after)
    }

    fn post_as_moderator(&self, req: &PostRequest) -> Result<u64, SyncError> {
        let mut inner = self.inner.lock();
        inner.appends.push(req.clone());
        if req.session != self.session_id {
            return Err(SyncError::SessionNotFound {
                session_id: req.session.clone(),
            });
        }
        let count = inner.events.len() as u64;
        if req.after != count {
            return Err(SyncError::ConcurrencyConflict);
        }
        let active = active_participants(&inner.events);
        let next = req.next.clone().unwrap_or_else(|| MODERATOR.to_string());
        if next != MODERATOR && !active.contains(&next) {
            return Err(SyncError::Network {
                status: Some(400),
                message: format!("invalid next participant: {next}"),
            });
        }
        let number = count + 1;
        inner
            .events
            .push(Event::message(number, MODERATOR, req.content.clone(), Some(next)));
        Ok(number)
    }
}

fn active_participants(events: &[Event]) -> BTreeSet<String> {
    let mut active = BTreeSet::new();
    for e in events {
        match (e.kind, e.participant()) {
            (EventKind::Joined, Some(name)) => {
                active.insert(name.to_string());
            }
            (EventKind::Left, Some(name)) => {
                active.remove(name);
            }
            _ => {}
        }
    }
    active.remove(MODERATOR);
    active
}

fn status_of(session_id: &str, events: &[Event], after: u64) -> StatusResponse {
    StatusResponse {
        session_id: session_id.to_string(),
        participants: active_participants(events).into_iter().collect(),
        event_count: events.len() as u64,
        events: events.iter().filter(|e| e.number > after).cloned().collect(),
    }
}

#[async_trait]
impl RemoteLog for FakeCouncil {
    async fn fetch_since(
        &self,
        session_id: &str,
        cursor: u64,
    ) -> Result<StatusResponse, SyncError> {
        let gated = {
            let mut inner = self.inner.lock();
            inner.fetches.push(cursor);
            inner.gated
        };
        if gated {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        let mut inner = self.inner.lock();
        if !inner.faults.is_empty() {
            return match inner.faults.remove(0) {
                Fault::Error(e) => Err(e),
                Fault::Response(r) => Ok(r),
            };
        }
        if session_id != self.session_id {
            return Err(SyncError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(status_of(&self.session_id, &inner.events, cursor))
    }

    async fn append(
        &self,
        session_id: &str,
        content: &str,
        expected_cursor: u64,
        next: Option<&str>,
    ) -> Result<u64, SyncError> {
        let held = self.inner.lock().appends_held;
        if held {
            if let Ok(permit) = self.append_gate.acquire().await {
                permit.forget();
            }
        }
        self.post_as_moderator(&PostRequest {
            session: session_id.to_string(),
            content: content.to_string(),
            after: expected_cursor,
            next: next.map(String::from),
        })
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<String>, SyncError> {
        if session_id != self.session_id {
            return Err(SyncError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(active_participants(&self.inner.lock().events).into_iter().collect())
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

#[derive(Deserialize)]
struct StatusQuery {
    session: String,
    after: Option<u64>,
}

#[derive(Deserialize)]
struct SessionQuery {
    session: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { error: message.to_string() })).into_response()
}

fn error_response(err: SyncError) -> Response {
    match err {
        SyncError::SessionNotFound { .. } => json_error(StatusCode::NOT_FOUND, "session not found"),
        SyncError::ConcurrencyConflict => json_error(StatusCode::CONFLICT, "stale state"),
        SyncError::Network { status: Some(code), message } => json_error(
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            &message,
        ),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
    }
}

async fn handle_status(State(fake): State<FakeCouncil>, Query(q): Query<StatusQuery>) -> Response {
    match fake.fetch_since(&q.session, q.after.unwrap_or(0)).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_post(State(fake): State<FakeCouncil>, Json(req): Json<PostRequest>) -> Response {
    if req.content.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "content field required");
    }
    match fake.post_as_moderator(&req) {
        Ok(event_number) => Json(PostResponse { event_number }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_participants(
    State(fake): State<FakeCouncil>,
    Query(q): Query<SessionQuery>,
) -> Response {
    match fake.participants(&q.session).await {
        Ok(participants) => Json(ParticipantsResponse { participants }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Serve `fake` on an ephemeral localhost port; returns the base URL.
pub async fn serve(fake: FakeCouncil) -> String {
    let app = Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/post", post(handle_post))
        .route("/api/participants", get(handle_participants))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
