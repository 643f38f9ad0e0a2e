//! Remote protocol endpoint over HTTP.
//!
//! Each `send` is a POST to `/rpc`; its reply is queued for the next
//! `receive`. `ws://` and `wss://` URIs are mapped to `http://`/`https://`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::ProtocolTransport;
use crate::error::{Error, Result};

const HEALTH_PATH: &str = "/health";
const RPC_PATH: &str = "/rpc";

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    credential: Option<String>,
    replies: Mutex<VecDeque<serde_json::Value>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the transport and confirm the endpoint answers a health check.
    pub async fn connect(
        client: reqwest::Client,
        uri: &str,
        credential: Option<&str>,
    ) -> Result<Self> {
        let transport = Self {
            base_url: http_base(uri),
            client,
            credential: credential.map(str::to_string),
            replies: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        };
        transport.heartbeat().await?;
        debug!(url = %transport.base_url, "HTTP transport ready");
        Ok(transport)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Network("Transport closed".into()))
        } else {
            Ok(())
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn replies(&self) -> std::sync::MutexGuard<'_, VecDeque<serde_json::Value>> {
        match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Normalize an endpoint URI to an HTTP base URL without trailing slash.
fn http_base(uri: &str) -> String {
    let mapped = if let Some(rest) = uri.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = uri.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        uri.to_string()
    };
    mapped.trim_end_matches('/').to_string()
}

#[async_trait]
impl ProtocolTransport for HttpTransport {
    async fn send(&self, message: serde_json::Value) -> Result<()> {
        self.ensure_open()?;
        let url = format!("{}{}", self.base_url, RPC_PATH);
        let resp = self
            .authorize(self.client.post(&url))
            .json(&message)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), format!("POST {}", RPC_PATH)));
        }

        let reply: serde_json::Value = resp.json().await?;
        self.replies().push_back(reply);
        Ok(())
    }

    async fn receive(&self) -> Result<serde_json::Value> {
        self.ensure_open()?;
        self.replies()
            .pop_front()
            .ok_or_else(|| Error::Other("No reply pending".into()))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.ensure_open()?;
        let url = format!("{}{}", self.base_url, HEALTH_PATH);
        let resp = self.authorize(self.client.get(&url)).send().await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::from_status(status.as_u16(), format!("GET {}", HEALTH_PATH)))
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.replies().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base_mapping() {
        assert_eq!(http_base("wss://mcp.mnem.dev/"), "https://mcp.mnem.dev");
        assert_eq!(http_base("ws://localhost:3001"), "http://localhost:3001");
        assert_eq!(http_base("https://mcp.mnem.dev"), "https://mcp.mnem.dev");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let err = HttpTransport::connect(reqwest::Client::new(), "http://127.0.0.1:9", None)
            .await
            .err()
            .unwrap();
        assert!(err.is_network());
    }
}
