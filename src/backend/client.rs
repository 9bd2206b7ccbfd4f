// =============================================================================
// Backend REST client — shared request helper
// =============================================================================
//
// Every call attaches the cached bearer token (when present) and a fresh
// X-Request-Id, and runs under a client-side deadline that covers both the
// send and the body read. Failures come back as typed `SyncError`s:
//
//   transport failure        → Network
//   deadline exceeded        → Timeout
//   non-2xx                  → Http { status, body }   (401 also invalidates
//                                                      the cached token)
//   undecodable 2xx body     → Parse
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backend::credentials::CredentialProvider;
use crate::error::{SyncError, SyncResult};

/// Transport-level timeout, kept above the client-side deadline so the typed
/// `Timeout` error is the one callers see.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for the dashboard backend.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl ApiClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// # Arguments
    /// * `base_url`    — backend root, e.g. `https://api.example.com/api`.
    /// * `credentials` — token source for the `Authorization` header.
    /// * `timeout`     — client-side deadline per request.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::network(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, timeout_ms = timeout.as_millis() as u64, "ApiClient initialised");

        Ok(Self {
            base_url,
            client,
            credentials,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // -------------------------------------------------------------------------
    // Verbs
    // -------------------------------------------------------------------------

    /// GET `path` with query parameters, decoding the JSON body as `T`.
    #[instrument(skip(self, query), name = "backend::get")]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<T> {
        let req = self.client.request(Method::GET, self.url(path)).query(query);
        self.execute(req, "GET", path).await
    }

    /// POST a JSON body to `path`, decoding the JSON response as `T`.
    #[instrument(skip(self, body), name = "backend::post")]
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> SyncResult<T> {
        let req = self.client.request(Method::POST, self.url(path)).json(body);
        self.execute(req, "POST", path).await
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn execute<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        method: &str,
        path: &str,
    ) -> SyncResult<T> {
        let request_id = Uuid::new_v4();
        let mut req = req.header("X-Request-Id", request_id.to_string());
        if let Some(token) = self.credentials.token() {
            req = req.bearer_auth(token);
        }

        let deadline = Instant::now() + self.timeout;
        let timeout_ms = self.timeout.as_millis() as u64;

        let resp = tokio::time::timeout_at(deadline, req.send())
            .await
            .map_err(|_| SyncError::Timeout { timeout_ms })?
            .map_err(|e| SyncError::network(format!("{method} {path} failed: {e}")))?;

        let status = resp.status();
        let text = tokio::time::timeout_at(deadline, resp.text())
            .await
            .map_err(|_| SyncError::Timeout { timeout_ms })?
            .map_err(|e| SyncError::network(format!("{method} {path} body read failed: {e}")))?;

        if !status.is_success() {
            let body = serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text));
            if status == StatusCode::UNAUTHORIZED {
                self.credentials.invalidate();
            }
            warn!(%request_id, method, path, status = status.as_u16(), "backend returned error status");
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }

        debug!(%request_id, method, path, status = status.as_u16(), bytes = text.len(), "backend response");

        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(body)
            .map_err(|e| SyncError::parse(format!("failed to decode {method} {path} response: {e}")))
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
