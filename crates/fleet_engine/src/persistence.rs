//! Durable key/value storage for station configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_PERSISTENCE_PATH: &str = "./data/evfleet.json";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Could not access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Synchronous key/value store. A successful `put` is durable.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    fn put(&self, key: &str, value: Value) -> Result<(), PersistenceError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn entries(&self, prefix: &str) -> Result<Vec<(String, Value)>, PersistenceError>;
}

/// All entries kept in one pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents).map_err(|source| PersistenceError::Corrupt {
                path: path.clone(),
                source,
            })?
        } else {
            info!("Store {} not found, starting empty", path.display());
            BTreeMap::new()
        };
        info!("Opened store {} with {} entries", path.display(), entries.len());
        Ok(JsonFileStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic write using a temp file and a rename.
    fn write(&self, entries: &BTreeMap<String, Value>) -> Result<(), PersistenceError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let json = serde_json::to_string_pretty(entries).map_err(|source| {
            PersistenceError::Encode {
                key: self.path.display().to_string(),
                source,
            }
        })?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(io_error(&temp_path))?;
        fs::rename(&temp_path, &self.path).map_err(io_error(&self.path))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        // Memory follows the file, never the other way round
        self.write(&next)?;
        *entries = next;
        debug!("Saved {} to {}", key, self.path.display());
        Ok(())
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, Value)>, PersistenceError> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Store that forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, Value)>, PersistenceError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
