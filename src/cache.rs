// src/cache.rs
//! Persistent cache layer
//!
//! Wraps a durable key/value store with versioned, TTL-bound entries.
//! Expired or malformed entries are evicted lazily when they are read;
//! there is no background sweep.

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::time::SharedClock;

/// Errors raised by the key/value backends
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Durable string key/value storage. Values are always written whole.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove(&mut self, key: &str) -> Result<(), CacheError>;
}

/// In-process store, used for ephemeral sessions and tests
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
            && !key.starts_with('.');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        // Write to a sibling file first so readers never see a half-written value
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Envelope written for every versioned cache value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Write time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub version: u32,
}

/// Versioned, expiring cache over a `KeyValueStore`.
///
/// Storage failures are logged and swallowed: callers get `false` from the
/// write paths and the default value from the read paths.
pub struct Cache {
    store: Box<dyn KeyValueStore>,
    clock: SharedClock,
}

impl Cache {
    pub fn new(store: Box<dyn KeyValueStore>, clock: SharedClock) -> Self {
        Cache { store, clock }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Wrap `data` in a `CacheEntry` stamped with the current time and write it
    pub fn save<T: Serialize>(&mut self, key: &str, data: &T, version: u32) -> bool {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_ms(),
            version,
        };
        match serde_json::to_string(&entry) {
            Ok(json) => self.write(key, &json),
            Err(e) => {
                error!("Failed to serialize cache entry '{}': {}", key, e);
                false
            }
        }
    }

    /// Read an entry of any version, see `load_versioned`
    pub fn load<T: DeserializeOwned>(&mut self, key: &str, default: T, ttl: Duration) -> T {
        self.load_entry(key, ttl, None).unwrap_or(default)
    }

    /// Read an entry written with exactly `version`.
    ///
    /// Absent, malformed, expired and mismatched entries are evicted and
    /// `default` is returned.
    pub fn load_versioned<T: DeserializeOwned>(
        &mut self,
        key: &str,
        default: T,
        ttl: Duration,
        version: u32,
    ) -> T {
        self.load_entry(key, ttl, Some(version)).unwrap_or(default)
    }

    fn load_entry<T: DeserializeOwned>(
        &mut self,
        key: &str,
        ttl: Duration,
        version: Option<u32>,
    ) -> Option<T> {
        let raw = self.read(key)?;
        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Evicting malformed cache entry '{}': {}", key, e);
                self.remove(key);
                return None;
            }
        };

        let age = self.clock.now_ms().saturating_sub(entry.timestamp);
        if age > ttl.as_millis() as i64 {
            debug!("Evicting expired cache entry '{}' (age {}ms)", key, age);
            self.remove(key);
            return None;
        }

        if let Some(expected) = version {
            if entry.version != expected {
                info!(
                    "Evicting cache entry '{}' with schema version {} (expected {})",
                    key, entry.version, expected
                );
                self.remove(key);
                return None;
            }
        }

        Some(entry.data)
    }

    /// Write a plain JSON value without the versioned envelope
    pub fn save_raw<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.write(key, &json),
            Err(e) => {
                error!("Failed to serialize cache value '{}': {}", key, e);
                false
            }
        }
    }

    /// Read a plain JSON value. Malformed values are evicted.
    pub fn load_raw<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Evicting malformed cache value '{}': {}", key, e);
                self.remove(key);
                None
            }
        }
    }

    /// Whether anything is stored under `key`, valid or not
    pub fn contains(&self, key: &str) -> bool {
        self.read(key).is_some()
    }

    pub fn remove(&mut self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            error!("Failed to remove cache key '{}': {}", key, e);
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to read cache key '{}': {}", key, e);
                None
            }
        }
    }

    fn write(&mut self, key: &str, json: &str) -> bool {
        match self.store.set(key, json) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write cache key '{}': {}", key, e);
                false
            }
        }
    }
}
