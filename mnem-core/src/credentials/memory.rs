//! In-process credential store.

use super::{lock_poisoned, CredentialStore};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a store, mostly for tests.
    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().map_err(lock_poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().map_err(lock_poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().map_err(lock_poisoned)?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CREDENTIAL_KEY;

    #[test]
    fn test_store_get_delete() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get(CREDENTIAL_KEY).unwrap(), None);

        store.store(CREDENTIAL_KEY, "sk_live_123").unwrap();
        assert_eq!(store.get(CREDENTIAL_KEY).unwrap().as_deref(), Some("sk_live_123"));

        store.delete(CREDENTIAL_KEY).unwrap();
        store.delete(CREDENTIAL_KEY).unwrap();
        assert_eq!(store.get(CREDENTIAL_KEY).unwrap(), None);
    }
}
