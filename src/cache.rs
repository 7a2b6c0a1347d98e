//! ==============================================================================
//! cache.rs - durable last-known state per garden
//! ==============================================================================
//!
//! purpose:
//!     keeps the last accepted sensor, device and analysis state of every
//!     garden so a restarted view can paint immediately, before the network
//!     answers. entries never expire; fresher data always replaces them.
//!
//! keys:
//!     sensorData_<garden>     SensorSnapshot
//!     deviceStates_<garden>   DeviceStateSet
//!     analysis_<garden>       analysis json
//!     selectedGardenId        last selected garden (plain string)
//!
//! relationships:
//!     - used by: view.rs (hydrate on select, persist on every accepted write)
//!     - backends: MemoryStore (tests), FileStore (daemon)
//!
//! ==============================================================================

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::LiveError;

pub const SELECTION_KEY: &str = "selectedGardenId";

// ==============================================================================
// key/value backends
// ==============================================================================

/// a string key/value store with localStorage semantics
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str);
}

/// process-local store, lost on exit
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// one file per key inside a directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// percent-escape everything but `[A-Za-z0-9_-]`, so distinct keys never
/// share a file
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        std::fs::write(&path, value)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

// ==============================================================================
// typed cache
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Sensor,
    Device,
    Analysis,
}

impl CacheKind {
    pub fn key(self, garden_id: &str) -> String {
        let prefix = match self {
            Self::Sensor => "sensorData",
            Self::Device => "deviceStates",
            Self::Analysis => "analysis",
        };
        format!("{}_{}", prefix, garden_id)
    }
}

#[derive(Clone)]
pub struct DurableCache {
    store: Arc<dyn KeyValueStore>,
}

impl DurableCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// write failures are logged and swallowed; the cache is best-effort
    pub fn persist<T: Serialize>(&self, garden_id: &str, kind: CacheKind, value: &T) {
        let key = kind.key(garden_id);
        let result = serde_json::to_string(value)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&key, &json));
        if let Err(e) = result {
            tracing::warn!(key = %key, "cache write failed: {:#}", e);
        }
    }

    /// read an entry, removing it if it does not parse
    pub fn try_hydrate<T: DeserializeOwned>(
        &self,
        garden_id: &str,
        kind: CacheKind,
    ) -> Result<Option<T>, LiveError> {
        let key = kind.key(garden_id);
        let Some(raw) = self.store.get(&key) else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                self.store.remove(&key);
                Err(LiveError::CorruptCache { key })
            }
        }
    }

    pub fn hydrate<T: DeserializeOwned>(&self, garden_id: &str, kind: CacheKind) -> Option<T> {
        match self.try_hydrate(garden_id, kind) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("{}; entry dropped", e);
                None
            }
        }
    }

    pub fn selected_garden(&self) -> Option<String> {
        self.store.get(SELECTION_KEY).filter(|id| !id.is_empty())
    }

    pub fn persist_selection(&self, garden_id: &str) {
        if let Err(e) = self.store.set(SELECTION_KEY, garden_id) {
            tracing::warn!("failed to persist garden selection: {:#}", e);
        }
    }
}
