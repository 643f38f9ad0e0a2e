//! File-backed credential store.
//!
//! Values are kept base64-encoded in a small JSON map. The file is written
//! with `0600` permissions on unix.

use super::{lock_poisoned, CredentialStore};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct FileCredentialStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within the process
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(map)?)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl CredentialStore for FileCredentialStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(lock_poisoned)?;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), STANDARD.encode(value));
        self.write_map(&map)?;
        debug!(path = %self.path.display(), key, "Stored credential");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.read_map()?;
        let Some(encoded) = map.get(key) else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Credential(format!("Invalid credential encoding: {}", e)))?;
        String::from_utf8(decoded)
            .map(Some)
            .map_err(|e| Error::Credential(format!("Credential is not UTF-8: {}", e)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(lock_poisoned)?;
        let mut map = self.read_map()?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        if map.is_empty() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove credentials file");
            }
            return Ok(());
        }
        self.write_map(&map)
    }
}
