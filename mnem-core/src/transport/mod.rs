//! Transport selection for the tool-invocation protocol endpoint.
//!
//! The channel itself is opaque: the connection manager only needs
//! connect/send/receive/heartbeat/close. It picks an endpoint, keeps it
//! healthy and falls back to the direct memory API when every endpoint is
//! exhausted.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!                             │  ▲                │ heartbeat fail
//!                 fail, more  │  │                ▼
//!                 endpoints   └──┘             Degraded ──N fails──▶ Disconnected
//!                             │                                     (reconnect scheduled)
//!                 fail, none  ▼
//!                           Failed
//! ```

mod connector;
mod manager;
#[cfg(unix)]
mod local;
#[cfg(feature = "client")]
mod remote;

pub use connector::DefaultConnector;
pub use manager::ConnectionManager;
#[cfg(unix)]
pub use local::UnixSocketTransport;
#[cfg(feature = "client")]
pub use remote::HttpTransport;

use crate::error::Result;
use crate::types::{ConnectionState, Endpoint, EndpointKind};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// An established duplex channel to a protocol endpoint.
#[async_trait]
pub trait ProtocolTransport: Send + Sync {
    /// Send one opaque message.
    async fn send(&self, message: serde_json::Value) -> Result<()>;

    /// Receive the next message.
    async fn receive(&self) -> Result<serde_json::Value>;

    /// Liveness probe.
    async fn heartbeat(&self) -> Result<()>;

    /// Release the channel. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens transports for endpoints.
///
/// Implementations classify failures: auth rejections as `Error::Auth`,
/// refused/unresolvable endpoints as `Error::Network`.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: Option<&str>,
    ) -> Result<Arc<dyn ProtocolTransport>>;
}

/// Options for [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Try remote endpoints before local ones
    pub prefer_remote: bool,
}

/// Result of a connect call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub mode: EndpointKind,
    /// False means "use the direct API"
    pub transport_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ConnectOutcome {
    pub fn uses_direct_api(&self) -> bool {
        !self.transport_active
    }
}

/// Where a foreground request should go.
#[derive(Clone)]
pub enum Route {
    Transport {
        endpoint: Endpoint,
        transport: Arc<dyn ProtocolTransport>,
    },
    DirectApi,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { endpoint, .. } => write!(f, "Transport({})", endpoint.uri),
            Self::DirectApi => write!(f, "DirectApi"),
        }
    }
}

/// Outcome of a foreground invocation.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Reply received over the protocol transport
    Response(serde_json::Value),
    /// No transport; the caller should use the memory API for this request
    DirectApi(serde_json::Value),
}

/// Connection status for display.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub consecutive_heartbeat_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
