//! HTTP client for the remote memory service.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mnem_core::api::{CredentialSource, HttpMemoryApi, MemoryApi};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mnem_core::Result<()> {
//!     let source = CredentialSource::new(Some("sk_live_123".into()));
//!     let api = HttpMemoryApi::new("http://localhost:3000", Duration::from_secs(30), source)?;
//!     let record = api.get_memory("mem_1").await?;
//!     println!("{} is {}", record.id, record.state);
//!     Ok(())
//! }
//! ```

use super::{CredentialSource, CredentialVerifier, MemoryApi};
use crate::error::{Error, Result};
use crate::retry::with_timeout;
use crate::types::{MemoryListFilter, MemoryRecord, MemoryState};
use async_trait::async_trait;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const MEMORY_PATH: &[&str] = &["api", "v1", "memory"];
const VERIFY_PATH: &[&str] = &["api", "v1", "auth", "verify"];
const HEALTH_PATH: &[&str] = &["health"];

/// API client for the memory service
#[derive(Clone)]
pub struct HttpMemoryApi {
    base_url: String,
    timeout: Duration,
    credential: CredentialSource,
    client: reqwest::Client,
}

impl HttpMemoryApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration, credential: CredentialSource) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| Error::Config(format!("Invalid API url {}: {}", base_url, e)))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            timeout,
            credential,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the service is reachable
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get(self.url(HEALTH_PATH, None)?, &[]).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // HTTP Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a URL under the base; `id` is pushed as one escaped path segment.
    fn url(&self, path: &[&str], id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid API url {}: {}", self.base_url, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("API url cannot be a base: {}", self.base_url)))?;
            segments.pop_if_empty().extend(path);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn memory_url(&self, id: &str) -> Result<Url> {
        self.url(MEMORY_PATH, Some(id))
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T> {
        self.request(reqwest::Method::GET, url, query, Option::<&()>::None)
            .await
    }

    async fn patch<T: DeserializeOwned, B: Serialize>(&self, url: Url, body: &B) -> Result<T> {
        self.request(reqwest::Method::PATCH, url, &[], Some(body)).await
    }

    /// Send a request and decode the JSON body of a successful reply.
    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: reqwest::Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T> {
        let operation = format!("{} {}", method, url.path());
        let resp = self.send(method, url, query, body, None).await?;

        with_timeout(self.timeout, &operation, async move {
            resp.json::<T>().await.map_err(Error::from)
        })
        .await
    }

    /// Send a request and classify the status line. The body is left unread.
    ///
    /// The status is classified before the body is read, so an auth rejection
    /// that arrives before the deadline is reported as `Error::Auth` even if the
    /// body read would have timed out.
    async fn send<B: Serialize>(
        &self,
        method: reqwest::Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&B>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response> {
        let path = url.path().to_string();
        let operation = format!("{} {}", method, path);
        debug!("API request: {} {}", method, url);

        let mut req = self.client.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }

        let token = bearer.map(str::to_string).or_else(|| self.credential.get());
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = with_timeout(self.timeout, &operation, async move {
            req.send().await.map_err(Error::from)
        })
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = match status.as_u16() {
                404 => path,
                _ => operation,
            };
            return Err(Error::from_status(status.as_u16(), detail));
        }
        Ok(resp)
    }
}

#[async_trait]
impl MemoryApi for HttpMemoryApi {
    async fn get_memory(&self, id: &str) -> Result<MemoryRecord> {
        self.get(self.memory_url(id)?, &[]).await
    }

    async fn update_state(
        &self,
        id: &str,
        state: MemoryState,
        reason: Option<&str>,
    ) -> Result<MemoryRecord> {
        let req = UpdateStateRequest {
            state,
            reason: reason.map(String::from),
        };
        self.patch(self.memory_url(id)?, &req).await
    }

    async fn list_memories(&self, filter: &MemoryListFilter) -> Result<Vec<MemoryRecord>> {
        let mut query = Vec::new();
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        if let Some(before) = filter.created_before {
            query.push(("created_before", before.to_rfc3339()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        let resp: MemoryListResponse = self.get(self.url(MEMORY_PATH, None)?, &query).await?;
        Ok(resp.memories)
    }
}

#[async_trait]
impl CredentialVerifier for HttpMemoryApi {
    /// Any 2xx accepts the credential, whatever the body holds.
    async fn verify(&self, credential: &str) -> Result<()> {
        self.send(
            reqwest::Method::GET,
            self.url(VERIFY_PATH, None)?,
            &[],
            Option::<&()>::None,
            Some(credential),
        )
        .await?;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, VERIFY_PATH.join("/"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Health check response
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Update state request
#[derive(Debug, Serialize)]
pub struct UpdateStateRequest {
    pub state: MemoryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// List response
#[derive(Debug, Deserialize)]
pub struct MemoryListResponse {
    #[serde(default)]
    pub memories: Vec<MemoryRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_normalizes_base_url() {
        let api = HttpMemoryApi::new(
            "http://localhost:3000/",
            Duration::from_secs(5),
            CredentialSource::default(),
        )
        .unwrap();
        assert_eq!(api.base_url(), "http://localhost:3000");
        assert_eq!(api.endpoint(), "http://localhost:3000/api/v1/auth/verify");
    }

    #[test]
    fn test_update_request_serialization() {
        let req = UpdateStateRequest {
            state: MemoryState::Archived,
            reason: None,
        };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"state":"archived"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_class() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let api = HttpMemoryApi::new(
            "http://127.0.0.1:9",
            Duration::from_secs(2),
            CredentialSource::new(Some("sk_test".into())),
        )
        .unwrap();

        let err = api.get_memory("m1").await.unwrap_err();
        assert!(err.is_network(), "unexpected error: {:?}", err);

        let err = api.health().await.unwrap_err();
        assert!(err.is_network(), "unexpected error: {:?}", err);
    }

    /// Answer one request with a canned reply, then hold the socket open.
    async fn serve_once(reply: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("http://{}", addr)
    }

    fn api(base: &str, timeout: Duration) -> HttpMemoryApi {
        HttpMemoryApi::new(base, timeout, CredentialSource::new(Some("sk_test".into()))).unwrap()
    }

    #[tokio::test]
    async fn test_verify_accepts_empty_success_body() {
        let base = serve_once("HTTP/1.1 204 No Content\r\n\r\n").await;
        api(&base, Duration::from_secs(2)).verify("sk_live_1").await.unwrap();

        let base = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        api(&base, Duration::from_secs(2)).verify("sk_live_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_rejection_is_auth() {
        let base = serve_once("HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n").await;
        let err = api(&base, Duration::from_secs(2)).verify("sk_bad").await.unwrap_err();
        assert!(err.is_auth(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_as_network() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = api(&base, Duration::from_millis(200)).get_memory("m1").await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {:?}", err);
        assert!(err.is_network());
        assert!(!err.is_auth());
    }

    #[tokio::test]
    async fn test_auth_status_seen_before_deadline_stays_auth() {
        // Headers promise a body that never arrives
        let base =
            serve_once("HTTP/1.1 401 Unauthorized\r\nContent-Length: 100\r\n\r\n").await;
        let err = api(&base, Duration::from_millis(200)).get_memory("m1").await.unwrap_err();
        assert!(err.is_auth(), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_memory_id_is_one_escaped_segment() {
        let api = api("http://localhost:3000/", Duration::from_secs(5));
        let url = api.memory_url("a/b?c#d").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/api/v1/memory/a%2Fb%3Fc%23d");

        let prefixed = HttpMemoryApi::new(
            "http://localhost:3000/svc",
            Duration::from_secs(5),
            CredentialSource::default(),
        )
        .unwrap();
        assert_eq!(
            prefixed.memory_url("m1").unwrap().as_str(),
            "http://localhost:3000/svc/api/v1/memory/m1"
        );
    }

    #[test]
    fn test_rejects_unparseable_base_url() {
        let result = HttpMemoryApi::new("not a url", Duration::from_secs(5), CredentialSource::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
