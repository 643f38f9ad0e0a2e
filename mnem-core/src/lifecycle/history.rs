//! Append-only transition log, optionally mirrored to a JSONL file.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::StateTransition;

#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: RwLock<HashMap<String, Vec<StateTransition>>>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading any transitions already recorded.
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries: HashMap<String, Vec<StateTransition>> = HashMap::new();

        if path.exists() {
            let file = fs::File::open(&path)?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StateTransition>(&line) {
                    Ok(t) => entries.entry(t.memory_id.clone()).or_default().push(t),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed history entry"
                    ),
                }
            }
            debug!(path = %path.display(), memories = entries.len(), "Loaded transition history");
        }

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a transition. The in-memory log is always updated; the returned
    /// error only concerns the file mirror.
    pub fn append(&self, transition: StateTransition) -> Result<()> {
        let line = serde_json::to_string(&transition)?;

        match self.entries.write() {
            Ok(mut guard) => guard.entry(transition.memory_id.clone()).or_default().push(transition),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(transition.memory_id.clone())
                .or_default()
                .push(transition),
        }

        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Transitions for one memory, most recent first.
    pub fn for_memory(&self, memory_id: &str) -> Vec<StateTransition> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(memory_id)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of recorded transitions.
    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.values().map(Vec::len).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
