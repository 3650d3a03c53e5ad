use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AppError, AppResult};

pub const APP_DIR_NAME: &str = "pantry";
pub const DB_FILE_NAME: &str = "pantry.sqlite3";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

pub const FAKE_APPDATA_ENV: &str = "PANTRY_FAKE_APPDATA";
pub const BUSY_TIMEOUT_ENV: &str = "PANTRY_BUSY_TIMEOUT_MS";

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 1_500;
const MIN_BUSY_TIMEOUT_MS: u64 = 250;
const MAX_BUSY_TIMEOUT_MS: u64 = 2_000;

/// Where the storage core keeps its files and how long it waits on a locked database.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub busy_timeout: Duration,
}

impl StorageConfig {
    /// Place the database and settings file directly inside `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join(DB_FILE_NAME),
            settings_path: dir.join(SETTINGS_FILE_NAME),
            busy_timeout: load_busy_timeout(),
        }
    }

    /// Resolve the application-data directory the way the desktop host does.
    pub fn from_env() -> AppResult<Self> {
        Ok(Self::in_dir(resolve_data_dir()?))
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = clamp_busy_timeout(timeout.as_millis() as u64);
        self
    }

    pub fn data_dir(&self) -> &Path {
        self.db_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

pub fn resolve_data_dir() -> AppResult<PathBuf> {
    if let Ok(fake) = env::var(FAKE_APPDATA_ENV) {
        return Ok(PathBuf::from(fake));
    }

    dirs::data_dir()
        .map(|base| base.join(APP_DIR_NAME))
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "CONFIG/NO_DATA_DIR",
                "Failed to resolve application data directory",
            )
        })
}

fn load_busy_timeout() -> Duration {
    let millis = env::var(BUSY_TIMEOUT_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
    clamp_busy_timeout(millis)
}

fn clamp_busy_timeout(millis: u64) -> Duration {
    Duration::from_millis(millis.clamp(MIN_BUSY_TIMEOUT_MS, MAX_BUSY_TIMEOUT_MS))
}
