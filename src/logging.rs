use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{AppError, AppResult};

pub const LOG_ENV: &str = "PANTRY_LOG";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_NAME: &str = "pantry.log";

const DEFAULT_FILTER: &str = "pantry=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// JSON lines on stderr. Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr)
        .try_init();
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Stderr plus a daily-rolling file under `<data_dir>/logs/`.
///
/// Keep the returned guard alive for as long as events should reach the file.
pub fn init_file_logging(data_dir: &Path) -> AppResult<WorkerGuard> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_log_dir")
            .with_context("path", dir.display().to_string())
    })?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr);
    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| AppError::new("LOGGING/INIT", err.to_string()))?;
    Ok(guard)
}
