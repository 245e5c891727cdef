//! Durable local key/value storage.
//!
//! A single JSON object on disk, keyed by fixed names. Each value is a plain
//! serialized structure. Every call reads the file fresh, so separate
//! `LocalStore` handles pointing at the same file observe each other's writes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

pub const LOCAL_STORAGE_FILE: &str = "local_storage.json";

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("local storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local storage contains invalid data: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store file inside `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::open(data_dir.as_ref().join(LOCAL_STORAGE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LocalStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let map = self.load()?;
        match map.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, LocalStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.contains_key(key))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LocalStoreError> {
        let value = serde_json::to_value(value)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        map.insert(key.to_string(), value);
        self.save(&map)
    }

    /// Remove all `keys` in a single rewrite of the file.
    pub fn remove(&self, keys: &[&str]) -> Result<(), LocalStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        let before = map.len();
        for key in keys {
            map.remove(*key);
        }
        if map.len() == before {
            return Ok(());
        }
        self.save(&map)
    }

    fn load(&self) -> Result<Map<String, Value>, LocalStoreError> {
        let content = match fs::read_to_string(self.path.as_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, map: &Map<String, Value>) -> Result<(), LocalStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename keeps the previous file intact if we die midway.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        fs::rename(&tmp, self.path.as_path())?;
        debug!(path = %self.path.display(), keys = map.len(), "local storage saved");
        Ok(())
    }
}
