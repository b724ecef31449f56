//! Access to the authoritative session log.
//!
//! [`RemoteLog`] is the seam between the sync core and the network: the
//! engine and the post controller only ever talk to a `dyn RemoteLog`, so
//! tests can substitute an in-memory server. [`HttpRemote`] is the real
//! implementation against the council HTTP API.

use async_trait::async_trait;
use council_types::{ErrorResponse, ParticipantsResponse, PostRequest, PostResponse, StatusResponse};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::error::SyncError;

/// The two operations the session log needs, plus the ancillary
/// participant listing.
#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// All events with `number > cursor`, ascending, plus the authoritative
    /// participant set and event count. Idempotent and side-effect free.
    /// `cursor == 0` asks for the full history.
    async fn fetch_since(&self, session_id: &str, cursor: u64) -> Result<StatusResponse, SyncError>;

    /// Propose a message. Accepted only if `expected_cursor` equals the
    /// server's last event number at commit time, otherwise
    /// [`SyncError::ConcurrencyConflict`] and nothing is recorded.
    ///
    /// Returns the number the server assigned.
    async fn append(
        &self,
        session_id: &str,
        content: &str,
        expected_cursor: u64,
        next: Option<&str>,
    ) -> Result<u64, SyncError>;

    /// Active participants, as the server sees them.
    async fn participants(&self, session_id: &str) -> Result<Vec<String>, SyncError>;
}

/// [`RemoteLog`] over the council HTTP API.
#[derive(Clone, Debug)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
}

impl HttpRemote {
    /// Create a client for the server at `base_url` (e.g. `http://localhost:3000`).
    pub fn new(base_url: &str) -> Result<Self, url::ParseError> {
        Self::with_client(Client::new(), base_url)
    }

    /// Create a client sharing an existing `reqwest::Client`.
    pub fn with_client(http: Client, base_url: &str) -> Result<Self, url::ParseError> {
        // A trailing slash keeps any path prefix when joining endpoints.
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::transport(format!("invalid endpoint {path}: {e}")))
    }

    /// `GET /api/status` URL; `after` is omitted for a full fetch.
    pub fn status_url(&self, session_id: &str, cursor: u64) -> Result<Url, SyncError> {
        let mut url = self.endpoint("api/status")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session", session_id);
            if cursor > 0 {
                query.append_pair("after", &cursor.to_string());
            }
        }
        Ok(url)
    }

    fn participants_url(&self, session_id: &str) -> Result<Url, SyncError> {
        let mut url = self.endpoint("api/participants")?;
        url.query_pairs_mut().append_pair("session", session_id);
        Ok(url)
    }
}

#[async_trait]
impl RemoteLog for HttpRemote {
    async fn fetch_since(
        &self,
        session_id: &str,
        cursor: u64,
    ) -> Result<StatusResponse, SyncError> {
        let url = self.status_url(session_id, cursor)?;
        trace!(%url, "fetching status");

        let res = self.http.get(url).send().await.map_err(to_transport_error)?;
        read_json(res, session_id).await
    }

    async fn append(
        &self,
        session_id: &str,
        content: &str,
        expected_cursor: u64,
        next: Option<&str>,
    ) -> Result<u64, SyncError> {
        let url = self.endpoint("api/post")?;
        let body = PostRequest {
            session: session_id.to_string(),
            content: content.to_string(),
            after: expected_cursor,
            next: next.map(String::from),
        };
        debug!(session = %session_id, after = expected_cursor, "posting message");

        let res = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(to_transport_error)?;

        if res.status() == StatusCode::CONFLICT {
            return Err(SyncError::ConcurrencyConflict);
        }
        let posted: PostResponse = read_json(res, session_id).await?;
        Ok(posted.event_number)
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<String>, SyncError> {
        let url = self.participants_url(session_id)?;
        let res = self.http.get(url).send().await.map_err(to_transport_error)?;
        let body: ParticipantsResponse = read_json(res, session_id).await?;
        Ok(body.participants)
    }
}

/// Decode a success body, or map the failure status onto [`SyncError`].
async fn read_json<T: DeserializeOwned>(res: Response, session_id: &str) -> Result<T, SyncError> {
    let status = res.status();
    if status == StatusCode::NOT_FOUND {
        return Err(SyncError::SessionNotFound {
            session_id: session_id.to_string(),
        });
    }

    let bytes = res.bytes().await.map_err(to_transport_error)?;
    if !status.is_success() {
        return Err(SyncError::Network {
            status: Some(status.as_u16()),
            message: error_message(status, &bytes),
        });
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::ProtocolViolation(format!("undecodable response body: {e}")))
}

/// Prefer the server's `{error}` field, then the raw body, then the reason phrase.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
        return parsed.error;
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if !text.is_empty() {
        return text;
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

fn to_transport_error(err: reqwest::Error) -> SyncError {
    SyncError::transport(err.to_string())
}
