//! Connector that dispatches on endpoint kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProtocolTransport, TransportConnector};
use crate::error::{Error, Result};
use crate::types::{Endpoint, EndpointKind};

/// Opens Unix socket transports for local endpoints and HTTP transports for
/// remote ones.
#[derive(Clone)]
pub struct DefaultConnector {
    #[cfg(feature = "client")]
    client: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        #[cfg(feature = "client")]
        {
            let client = reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
            Ok(Self { client })
        }
        #[cfg(not(feature = "client"))]
        {
            let _ = request_timeout;
            Ok(Self {})
        }
    }

    async fn connect_local(&self, endpoint: &Endpoint) -> Result<Arc<dyn ProtocolTransport>> {
        #[cfg(unix)]
        {
            let path = super::UnixSocketTransport::socket_path(&endpoint.uri).ok_or_else(|| {
                Error::Config(format!("Invalid local endpoint: {}", endpoint.uri))
            })?;
            let transport = super::UnixSocketTransport::connect(path).await?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(unix))]
        {
            Err(Error::Config(format!(
                "Local endpoints are not supported on this platform: {}",
                endpoint.uri
            )))
        }
    }

    async fn connect_remote(
        &self,
        endpoint: &Endpoint,
        credential: Option<&str>,
    ) -> Result<Arc<dyn ProtocolTransport>> {
        #[cfg(feature = "client")]
        {
            let transport =
                super::HttpTransport::connect(self.client.clone(), &endpoint.uri, credential)
                    .await?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "client"))]
        {
            let _ = credential;
            Err(Error::Config(format!(
                "Remote endpoint {} requires the `client` feature",
                endpoint.uri
            )))
        }
    }
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: Option<&str>,
    ) -> Result<Arc<dyn ProtocolTransport>> {
        match endpoint.kind {
            EndpointKind::Local => self.connect_local(endpoint).await,
            EndpointKind::Remote => self.connect_remote(endpoint, credential).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_local_socket_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("unix:{}", dir.path().join("mcp.sock").display());
        let connector = DefaultConnector::new(Duration::from_secs(1)).unwrap();

        let err = connector
            .connect(&Endpoint::local(uri, 0), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_local_uri_is_config_error() {
        let connector = DefaultConnector::new(Duration::from_secs(1)).unwrap();
        let err = connector
            .connect(&Endpoint::local("unix:", 0), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }
}
