//! Remote memory API collaborator.
//!
//! The lifecycle manager and the session manager only see the traits in this
//! module. The HTTP implementation lives behind the `client` feature.

#[cfg(feature = "client")]
mod http;

#[cfg(feature = "client")]
pub use http::{HealthResponse, HttpMemoryApi, MemoryListResponse, UpdateStateRequest};

use crate::error::Result;
use crate::types::{MemoryListFilter, MemoryRecord, MemoryState};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Storage operations the lifecycle manager needs from the remote service.
#[async_trait]
pub trait MemoryApi: Send + Sync {
    /// Load one record. Missing records yield `Error::NotFound`.
    async fn get_memory(&self, id: &str) -> Result<MemoryRecord>;

    /// Persist a new lifecycle state.
    async fn update_state(
        &self,
        id: &str,
        state: MemoryState,
        reason: Option<&str>,
    ) -> Result<MemoryRecord>;

    /// List records matching a filter.
    async fn list_memories(&self, filter: &MemoryListFilter) -> Result<Vec<MemoryRecord>>;
}

/// Remote verification of a credential.
///
/// `Ok(())` means accepted; `Error::Auth` an explicit rejection; network-class
/// errors mean the answer is unknown.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<()>;

    /// URL reported alongside validation results.
    fn endpoint(&self) -> String;
}

/// Shared, swappable bearer credential used by outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct CredentialSource {
    inner: Arc<RwLock<Option<String>>>,
}

impl CredentialSource {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn set(&self, credential: Option<String>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = credential,
            Err(poisoned) => *poisoned.into_inner() = credential,
        }
    }

    pub fn get(&self) -> Option<String> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
