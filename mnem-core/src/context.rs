//! Composition root.
//!
//! Every collaborator is built once here and handed to the component that
//! needs it. Nothing in the crate keeps process-global state.

use std::sync::Arc;

use tracing::debug;

use crate::api::{CredentialSource, CredentialVerifier, MemoryApi};
use crate::config::{ConnectionPolicy, MnemConfig, SessionPolicy};
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::lifecycle::{HistoryStore, LifecycleManager};
use crate::session::{AuthStatus, SessionManager};
use crate::transport::{ConnectOptions, ConnectOutcome, ConnectionManager, TransportConnector};
use crate::types::{BulkOperation, BulkOperationResult, MemoryState, StateTransition};

/// Collaborators and tuning for [`MnemContext::new`].
pub struct ContextParts {
    pub credentials: Arc<dyn CredentialStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub memory_api: Arc<dyn MemoryApi>,
    pub connector: Arc<dyn TransportConnector>,
    /// Shared with whatever issues authenticated requests (`memory_api`, `verifier`)
    pub credential_source: CredentialSource,
    pub session_policy: SessionPolicy,
    pub connection_policy: ConnectionPolicy,
    pub history: HistoryStore,
    pub actor_id: String,
    pub bulk_concurrency: usize,
}

pub struct MnemContext {
    session: SessionManager,
    connection: ConnectionManager,
    lifecycle: LifecycleManager,
}

impl MnemContext {
    /// Build the production wiring: configured credential backend, HTTP memory
    /// API (also used as the verifier) and the default transport connector.
    #[cfg(feature = "client")]
    pub fn from_config(config: &MnemConfig) -> Result<Self> {
        use crate::api::HttpMemoryApi;
        use crate::transport::DefaultConnector;

        config.ensure_dirs()?;

        let credentials = config
            .session
            .credential_backend
            .open(config.paths.credentials_file.clone())?;
        let credential_source = CredentialSource::default();
        let api = Arc::new(HttpMemoryApi::new(
            config.api.url.clone(),
            config.api_timeout(),
            credential_source.clone(),
        )?);
        let connection_policy = config.connection_policy();
        let connector = Arc::new(DefaultConnector::new(connection_policy.connect_timeout)?);
        let history = HistoryStore::open(config.lifecycle.history_path.clone())?;

        debug!(api = %config.api.url, endpoints = connection_policy.endpoints.len(), "Building context");

        Ok(Self::new(ContextParts {
            credentials,
            verifier: api.clone(),
            memory_api: api,
            connector,
            credential_source,
            session_policy: config.session_policy(),
            connection_policy,
            history,
            actor_id: config.lifecycle.actor_id.clone(),
            bulk_concurrency: config.lifecycle.bulk_concurrency,
        }))
    }

    pub fn new(parts: ContextParts) -> Self {
        let session = SessionManager::new(
            parts.credentials,
            parts.verifier,
            parts.session_policy,
            parts.credential_source.clone(),
        );
        let connection = ConnectionManager::new(
            parts.connection_policy,
            parts.connector,
            parts.credential_source,
        );
        let lifecycle = LifecycleManager::new(
            parts.memory_api,
            parts.history,
            parts.actor_id,
            parts.bulk_concurrency,
        );

        Self {
            session,
            connection,
            lifecycle,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub async fn is_authenticated(&self) -> AuthStatus {
        self.session.is_authenticated().await
    }

    /// Connect under the current session; logout abandons the attempt.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectOutcome> {
        self.connection
            .connect(options, self.session.session_token())
            .await
    }

    pub async fn update_memory_state(
        &self,
        id: &str,
        state: MemoryState,
        reason: Option<&str>,
    ) -> Result<StateTransition> {
        self.lifecycle.update_state(id, state, reason).await
    }

    /// Bulk transition, abandoned on logout.
    pub async fn bulk_update_state(
        &self,
        ids: &[String],
        operation: BulkOperation,
    ) -> Vec<BulkOperationResult> {
        let cancel = self.session.session_token();
        self.lifecycle
            .bulk_update_state_with_cancel(ids, operation, &cancel)
            .await
    }

    pub fn get_history(&self, id: &str) -> Vec<StateTransition> {
        self.lifecycle.get_history(id)
    }

    /// Stop background connection tasks and close the transport.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialBackend, MemoryCredentialStore, CREDENTIAL_KEY};
    use crate::error::Error;
    use crate::retry::BackoffPolicy;
    use crate::session::AuthState;
    use crate::transport::ProtocolTransport;
    use crate::types::{Endpoint, MemoryListFilter, MemoryRecord};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AcceptingVerifier;

    #[async_trait]
    impl CredentialVerifier for AcceptingVerifier {
        async fn verify(&self, _credential: &str) -> Result<()> {
            Ok(())
        }

        fn endpoint(&self) -> String {
            "http://verifier.test".into()
        }
    }

    struct EmptyApi;

    #[async_trait]
    impl MemoryApi for EmptyApi {
        async fn get_memory(&self, id: &str) -> Result<MemoryRecord> {
            Err(Error::NotFound(format!("memory {}", id)))
        }

        async fn update_state(
            &self,
            id: &str,
            _state: MemoryState,
            _reason: Option<&str>,
        ) -> Result<MemoryRecord> {
            Err(Error::NotFound(format!("memory {}", id)))
        }

        async fn list_memories(&self, _filter: &MemoryListFilter) -> Result<Vec<MemoryRecord>> {
            Ok(Vec::new())
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl TransportConnector for HangingConnector {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
            _credential: Option<&str>,
        ) -> Result<Arc<dyn ProtocolTransport>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(Error::Network("unreachable".into()))
        }
    }

    fn test_context() -> MnemContext {
        let config = MnemConfig::default();
        MnemContext::new(ContextParts {
            credentials: Arc::new(MemoryCredentialStore::with_value(CREDENTIAL_KEY, "sk_test")),
            verifier: Arc::new(AcceptingVerifier),
            memory_api: Arc::new(EmptyApi),
            connector: Arc::new(HangingConnector),
            credential_source: CredentialSource::default(),
            session_policy: config.session_policy(),
            connection_policy: ConnectionPolicy {
                endpoints: vec![Endpoint::local("unix:/tmp/never.sock", 0)],
                max_attempts_per_endpoint: 3,
                connect_timeout: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(30),
                heartbeat_failure_threshold: 3,
                allow_direct_api: true,
                backoff: BackoffPolicy::default(),
            },
            history: HistoryStore::in_memory(),
            actor_id: "tester".into(),
            bulk_concurrency: 5,
        })
    }

    #[tokio::test]
    async fn test_logout_abandons_connect() {
        let ctx = Arc::new(test_context());
        assert!(ctx.is_authenticated().await.authenticated);

        let pending = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.connect(ConnectOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.session().logout().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("connect should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        let status = ctx.is_authenticated().await;
        assert_eq!(status.state, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_bulk_through_context_reports_per_id() {
        let ctx = test_context();
        let results = ctx
            .bulk_update_state(&["x".to_string(), "y".to_string()], BulkOperation::Pause)
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.as_deref() == Some("not found")));
        assert!(ctx.get_history("x").is_empty());
    }

    #[tokio::test]
    async fn test_from_config_without_credential() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MnemConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.paths.credentials_file = dir.path().join("credentials.json");
        config.lifecycle.history_path = dir.path().join("history.jsonl");
        config.session.credential_backend = CredentialBackend::File;

        let ctx = MnemContext::from_config(&config).unwrap();
        let status = ctx.is_authenticated().await;

        assert!(!status.authenticated);
        assert!(status.needs_login());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_reloads_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MnemConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.paths.credentials_file = dir.path().join("credentials.json");
        config.lifecycle.history_path = dir.path().join("audit").join("history.jsonl");

        // Written by an earlier run
        let earlier = HistoryStore::open(config.lifecycle.history_path.clone()).unwrap();
        earlier
            .append(StateTransition {
                id: "t1".into(),
                memory_id: "m1".into(),
                from_state: MemoryState::Active,
                to_state: MemoryState::Archived,
                reason: Some("stale".into()),
                timestamp: chrono::Utc::now(),
                actor_id: "tester".into(),
            })
            .unwrap();

        let ctx = MnemContext::from_config(&config).unwrap();
        assert_eq!(
            ctx.lifecycle().history().path(),
            Some(config.lifecycle.history_path.as_path())
        );

        let history = ctx.get_history("m1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_state, MemoryState::Archived);
        ctx.shutdown().await;
    }
}
