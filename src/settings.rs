use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::warn;

use crate::db::write_atomic;
use crate::{AppError, AppResult};

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Key-value settings that live outside the database file, so they survive its recreation.
pub trait SettingsBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn save(&self) -> AppResult<()>;
}

/// JSON object persisted next to the database.
pub struct JsonFileSettings {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_settings(&path) {
            Ok(map) => map,
            Err(err) => {
                warn!(
                    target: "pantry",
                    event = "settings_load_failed",
                    path = %path.display(),
                    error = %err
                );
                Map::new()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_settings(path: &Path) -> AppResult<Map<String, Value>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(AppError::from(err).with_context("path", path.display().to_string()))
        }
    };
    match serde_json::from_slice::<Value>(&bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::new(
            "SETTINGS/NOT_OBJECT",
            "Settings file does not contain a JSON object",
        )
        .with_context("path", path.display().to_string())),
    }
}

impl SettingsBackend for JsonFileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    fn save(&self) -> AppResult<()> {
        let payload = {
            let guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*guard)?
        };
        write_atomic(&self.path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "save_settings")
                .with_context("path", self.path.display().to_string())
        })
    }
}

#[derive(Default)]
pub struct MemorySettings {
    data: Mutex<HashMap<String, Value>>,
}

impl SettingsBackend for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value);
        }
    }

    fn save(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<dyn SettingsBackend>,
}

impl SettingsHandle {
    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JsonFileSettings::load(path)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemorySettings::default()),
        }
    }

    pub fn schema_version(&self) -> Option<u32> {
        self.inner
            .get(SCHEMA_VERSION_KEY)
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok())
    }

    pub fn set_schema_version(&self, version: u32) -> AppResult<()> {
        self.inner.set(SCHEMA_VERSION_KEY, Value::from(version));
        self.inner.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trips_schema_version() {
        let settings = SettingsHandle::in_memory();
        assert_eq!(settings.schema_version(), None);
        settings.set_schema_version(2).unwrap();
        assert_eq!(settings.schema_version(), Some(2));
    }

    #[test]
    fn json_store_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        SettingsHandle::json_file(&path)
            .set_schema_version(3)
            .unwrap();

        let reloaded = SettingsHandle::json_file(&path);
        assert_eq!(reloaded.schema_version(), Some(3));
    }

    #[test]
    fn corrupt_json_store_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{not json").unwrap();

        let settings = SettingsHandle::json_file(&path);
        assert_eq!(settings.schema_version(), None);
        settings.set_schema_version(1).unwrap();
        assert_eq!(SettingsHandle::json_file(&path).schema_version(), Some(1));
    }
}
