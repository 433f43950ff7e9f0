//! Local persisted key/value storage with per-entry expiry.
//!
//! DESIGN
//! ======
//! Stands in for the browser storage layer shared across tabs. There is no
//! locking across processes: last write wins, and every reader re-checks
//! expiry against the injected clock. Expired entries are dropped lazily on
//! read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, unix_millis};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value`; with `ttl` set the entry disappears once it elapses.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    /// Unix millis after which the entry is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>, now_ms: i64) -> Self {
        let expires_at_ms =
            ttl.map(|ttl| now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));
        Self { value: value.to_owned(), expires_at_ms }
    }

    fn live_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|at| now_ms < at)
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Process-local store. Clones share the same map, like tabs sharing storage.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn now_ms(&self) -> i64 {
        unix_millis(self.clock.now())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now_ms = self.now_ms();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.live_at(now_ms) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let entry = Entry::new(value, ttl, self.now_ms());
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_owned(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON-file store so identity artifacts survive process restarts.
///
/// The whole map is re-read on every call; another process writing the same
/// file is picked up on the next access.
pub struct FileStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    guard: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self { path: path.into(), clock, guard: Mutex::new(()) }
    }

    fn load(&self) -> Result<HashMap<String, Entry>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &HashMap<String, Entry>) -> Result<(), StorageError> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now_ms = unix_millis(self.clock.now());
        let mut entries = self.load()?;
        match entries.get(key) {
            Some(entry) if entry.live_at(now_ms) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                self.save(&entries)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries = self.load()?;
        entries.insert(key.to_owned(), Entry::new(value, ttl, unix_millis(self.clock.now())));
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
