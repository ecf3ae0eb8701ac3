//! Persistent key-value storage for client state that must survive restarts.
//!
//! The only value the notifier keeps is the last-seen notification marker.
//! Two backends are provided:
//! - [`FileStore`]: JSON files in the platform-appropriate config directory:
//!   - Linux: `~/.config/notifier/`
//!   - macOS: `~/Library/Application Support/notifier/`
//!   - Windows: `%APPDATA%\notifier\`
//! - [`MemoryStore`]: an in-process map, for tests and ephemeral clients.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

/// Simple string key-value store.
pub trait MarkerStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Returns `true` if the value was persisted.
    fn set(&self, key: &str, value: &str) -> bool;
}

/// Stores each key as a JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `<config dir>/notifier`, created if missing.
    pub fn platform_default() -> Option<Self> {
        let dir = dirs::config_dir()?.join("notifier");
        Self::with_dir(dir)
    }

    /// Store rooted at `dir`, created if missing.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Option<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).ok()?;
        }
        Some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value as JSON. Returns `true` if the write succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => std::fs::write(self.file_path(key), json).is_ok(),
            Err(_) => false,
        }
    }

    /// Load a JSON value. Returns `None` if the key doesn't exist or decoding fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = std::fs::read_to_string(self.file_path(key)).ok()?;
        serde_json::from_str(&json).ok()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }
}

impl MarkerStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.load(key)
    }

    fn set(&self, key: &str, value: &str) -> bool {
        self.save(key, &value)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        true
    }
}
