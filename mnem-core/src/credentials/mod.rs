//! Credential storage.
//!
//! The session manager only needs three operations from its host
//! environment: `store`, `get` and `delete`. Backends are picked once, at
//! composition time, through [`CredentialBackend`].

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Key under which the API credential is kept.
pub const CREDENTIAL_KEY: &str = "api_key";

/// Opaque key-value persistence for auth material.
pub trait CredentialStore: Send + Sync {
    /// Store (or overwrite) a value.
    fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Retrieve a value, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Supported credential backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBackend {
    /// File under the data directory
    #[default]
    Auto,
    /// Explicit file store
    File,
    /// In-memory only (for testing)
    Memory,
}

impl CredentialBackend {
    /// Build the store for this backend.
    pub fn open(self, credentials_file: PathBuf) -> Result<Arc<dyn CredentialStore>> {
        info!(backend = ?self, "Initializing credential store");
        match self {
            Self::Auto | Self::File => Ok(Arc::new(FileCredentialStore::new(credentials_file))),
            Self::Memory => Ok(Arc::new(MemoryCredentialStore::new())),
        }
    }
}

pub(crate) fn lock_poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::Credential(format!("Lock poisoned: {}", e))
}
