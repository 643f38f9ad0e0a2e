//! Error types for mnem-core.
//!
//! Every component translates low-level transport failures into this
//! taxonomy before returning, so callers only ever branch on [`Error`].

use thiserror::Error;

use crate::types::MemoryState;

/// Result type alias using mnem-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for mnem operations
#[derive(Error, Debug)]
pub enum Error {
    // Auth errors
    #[error("Authentication rejected: {0}. Run `mnem auth login` to re-authenticate.")]
    Auth(String),

    #[error("No credential stored. Run `mnem auth login` first.")]
    NoCredential,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // Lifecycle errors
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: MemoryState, to: MemoryState },

    #[error("Not found: {0}")]
    NotFound(String),

    // Ambient errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a timeout error for an operation
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Map an HTTP status code into the taxonomy.
    ///
    /// 401/403 are terminal auth failures, 404 is a caller error, 408/429 and
    /// server errors are transient.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            401 | 403 => Self::Auth(format!("{} (HTTP {})", context, status)),
            404 => Self::NotFound(context),
            408 | 429 | 500..=599 => Self::Network(format!("{} (HTTP {})", context, status)),
            _ => Self::Other(format!("{} (HTTP {})", context, status)),
        }
    }

    /// Retryable failures are the network class: connection errors and timeouts.
    pub fn is_retryable(&self) -> bool {
        self.is_network()
    }

    /// Check if this error is a network-class failure (timeouts included)
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }

    /// Check if this error requires a new credential
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::NoCredential)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(feature = "client")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Error::from_status(status.as_u16(), e.to_string());
        }
        if e.is_timeout() {
            Error::Timeout {
                operation: "HTTP request".to_string(),
                after_ms: 0,
            }
        } else if e.is_connect() || e.is_request() {
            Error::Network(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Error::Serialization(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Error::from_status(401, "verify").is_auth());
        assert!(Error::from_status(403, "verify").is_auth());
        assert!(Error::from_status(404, "memory m1").is_not_found());
        assert!(Error::from_status(503, "list").is_retryable());
        assert!(Error::from_status(429, "list").is_retryable());
        assert!(!Error::from_status(400, "update").is_retryable());
    }

    #[test]
    fn test_timeout_is_network_class() {
        let err = Error::timeout("heartbeat", std::time::Duration::from_millis(1500));
        assert!(err.is_network());
        assert!(err.is_retryable());
        assert!(!err.is_auth());
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        let err = Error::InvalidTransition {
            from: MemoryState::Deleted,
            to: MemoryState::Active,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid transition: deleted -> active");

        assert!(!Error::Auth("revoked".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Auth("revoked".into()).to_string().contains("mnem auth login"));
    }
}
