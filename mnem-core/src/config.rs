//! Configuration management for mnem.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (MNEM_*)
//! 2. Config file (`<data_dir>/config.toml`, or `$MNEM_CONFIG`)
//! 3. Default values

use crate::credentials::CredentialBackend;
use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;
use crate::types::Endpoint;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MnemConfig {
    /// Memory API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Credential validation settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Protocol endpoint settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Paths
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL for the memory API
    #[serde(default = "default_api_url")]
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Allow falling back to the direct API when no protocol endpoint is reachable
    #[serde(default = "default_true")]
    pub allow_direct_api: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a successful verification is trusted
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Timeout for one verification call
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    #[serde(default = "default_session_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_session_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_session_backoff_jitter")]
    pub backoff_jitter_ms: u64,

    /// Where the credential is kept
    #[serde(default)]
    pub credential_backend: CredentialBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Candidate protocol endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<Endpoint>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_endpoint: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive heartbeat failures before dropping the connection
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_failure_threshold: u32,

    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Maximum bulk operations in flight
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,

    /// Actor recorded on every transition
    #[serde(default = "default_actor_id")]
    pub actor_id: String,

    /// JSONL file mirroring the transition history across runs
    #[serde(default = "default_history_file")]
    pub history_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for mnem data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Credential file used by the file backend
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
}

// Default value functions
fn default_api_url() -> String {
    std::env::var("MNEM_API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn default_api_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_verify_timeout() -> u64 {
    10
}

fn default_session_backoff_base() -> u64 {
    1000
}

fn default_session_backoff_max() -> u64 {
    30_000
}

fn default_session_backoff_jitter() -> u64 {
    250
}

fn default_endpoints() -> Vec<Endpoint> {
    let socket = default_data_dir().join("run").join("mcp.sock");
    vec![
        Endpoint::local(format!("unix:{}", socket.display()), 0),
        Endpoint::remote("https://mcp.mnem.dev", 10),
    ]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_threshold() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_max() -> u64 {
    8000
}

fn default_retry_jitter() -> u64 {
    100
}

fn default_bulk_concurrency() -> usize {
    5
}

fn default_actor_id() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}

fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "mnem", "mnem") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mnem")
    }
}

fn default_credentials_file() -> PathBuf {
    default_data_dir().join("credentials.json")
}

fn default_history_file() -> PathBuf {
    default_data_dir().join("history.jsonl")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            timeout_secs: default_api_timeout(),
            allow_direct_api: default_true(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            verify_timeout_secs: default_verify_timeout(),
            backoff_base_ms: default_session_backoff_base(),
            backoff_max_ms: default_session_backoff_max(),
            backoff_jitter_ms: default_session_backoff_jitter(),
            credential_backend: CredentialBackend::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            max_attempts_per_endpoint: default_max_attempts(),
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_failure_threshold: default_heartbeat_threshold(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            retry_jitter_ms: default_retry_jitter(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            bulk_concurrency: default_bulk_concurrency(),
            actor_id: default_actor_id(),
            history_path: default_history_file(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            credentials_file: default_credentials_file(),
        }
    }
}

impl Default for MnemConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            session: SessionConfig::default(),
            connection: ConnectionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl MnemConfig {
    /// Load configuration from file and environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, falling back to defaults when absent.
    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            MnemConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save_to(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MNEM_CONFIG") {
            PathBuf::from(path)
        } else {
            default_data_dir().join("config.toml")
        }
    }

    /// Reject values that would make the managers misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_attempts_per_endpoint == 0 {
            return Err(Error::Config(
                "connection.max_attempts_per_endpoint must be at least 1".into(),
            ));
        }
        if self.connection.heartbeat_failure_threshold == 0 {
            return Err(Error::Config(
                "connection.heartbeat_failure_threshold must be at least 1".into(),
            ));
        }
        if self.lifecycle.bulk_concurrency == 0 {
            return Err(Error::Config("lifecycle.bulk_concurrency must be at least 1".into()));
        }
        if self.session.backoff_base_ms > self.session.backoff_max_ms {
            return Err(Error::Config(
                "session.backoff_base_ms must not exceed session.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.paths.data_dir)?;
        if let Some(parent) = self.paths.credentials_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.lifecycle.history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Runtime policy for the session manager.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            cache_ttl: Duration::from_secs(self.session.cache_ttl_secs),
            verify_timeout: Duration::from_secs(self.session.verify_timeout_secs),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.session.backoff_base_ms),
                Duration::from_millis(self.session.backoff_max_ms),
            )
            .with_jitter(Duration::from_millis(self.session.backoff_jitter_ms)),
        }
    }

    /// Runtime policy for the connection manager.
    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            endpoints: self.connection.endpoints.clone(),
            max_attempts_per_endpoint: self.connection.max_attempts_per_endpoint,
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.connection.heartbeat_interval_secs),
            heartbeat_failure_threshold: self.connection.heartbeat_failure_threshold,
            allow_direct_api: self.api.allow_direct_api,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.connection.retry_base_ms),
                Duration::from_millis(self.connection.retry_max_ms),
            )
            .with_jitter(Duration::from_millis(self.connection.retry_jitter_ms)),
        }
    }
}

/// Session manager tuning, derived from [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub cache_ttl: Duration,
    pub verify_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        MnemConfig::default().session_policy()
    }
}

/// Connection manager tuning, derived from [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub endpoints: Vec<Endpoint>,
    pub max_attempts_per_endpoint: u32,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_failure_threshold: u32,
    pub allow_direct_api: bool,
    pub backoff: BackoffPolicy,
}
