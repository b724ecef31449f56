//! Council session client library
//!
//! Keeps a local replica of a council session's append-only event log in sync
//! with the server by cursor-based polling, and posts messages with optimistic
//! concurrency against the cursor the author last saw.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod post;
pub mod remote;
pub mod sync;

use std::sync::Arc;

pub use config::{ClientConfig, ConfigError};
pub use engine::{spawn_engine, EngineConfig, EngineHandle};
pub use error::SyncError;
pub use event_log::{EventLog, LogError};
pub use post::{Draft, PostController, PostError, PostOutcome};
pub use remote::{HttpRemote, RemoteLog};
pub use sync::{
    FetchKind, FetchTicket, FetchTrigger, SessionSnapshot, SkipReason, SyncManager, SyncPhase,
    SyncResult,
};

/// A running engine plus a post controller bound to it.
pub struct SessionClient {
    pub engine: EngineHandle,
    pub post: PostController,
}

impl SessionClient {
    /// Start syncing `session_id` over `remote`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        remote: Arc<dyn RemoteLog>,
        session_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let engine = spawn_engine(Arc::clone(&remote), session_id, config);
        let post = PostController::new(remote, engine.clone());
        Self { engine, post }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// Connect to the HTTP server named in `config` and start syncing `session_id`.
pub fn connect_http(
    config: &ClientConfig,
    session_id: impl Into<String>,
) -> Result<SessionClient, url::ParseError> {
    let remote = HttpRemote::new(&config.server)?;
    Ok(SessionClient::start(Arc::new(remote), session_id, EngineConfig::from(config)))
}
