use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::StorageConfig;
use crate::db::backup::{self, BackupOutcome};
use crate::db::faults::FaultInjector;
use crate::db::fatal::{error_code, is_fatal_storage};
use crate::db::handle::StorageHandle;
use crate::db::health::{run_health_checks, DbHealthReport};
use crate::db::recovery::{
    RecoveryContext, RuntimeReport, RuntimeTrigger, SalvageOutcome, StartupReport,
};
use crate::db::schema::MigrationOutcome;
use crate::db::serializer::AccessSerializer;
use crate::error::StorageError;
use crate::settings::SettingsHandle;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum StorageStatus {
    Ready,
    /// Startup or recovery could not produce a working file; reads return
    /// nothing and writes report failure until the process restarts.
    Unavailable(AppError),
}

impl StorageStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, StorageStatus::Ready)
    }
}

/// What happened to the database during this process lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub recovered_at_open: bool,
    pub startup_quarantine: Vec<std::path::PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_salvage: Option<SalvageOutcome>,
    pub runtime_recoveries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_runtime_recovery: Option<RuntimeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<BackupOutcome>,
}

/// Sole owner of the database connection and everything that guards it.
///
/// Construct one per process with [`StorageCore::open`] and hand the `Arc`
/// to whatever needs storage.
pub struct StorageCore {
    config: StorageConfig,
    serializer: AccessSerializer,
    handle: StorageHandle,
    settings: SettingsHandle,
    faults: FaultInjector,
    pending_recovery: Mutex<Option<RuntimeTrigger>>,
    recovering: Arc<AtomicBool>,
    backup_pending: AtomicBool,
    status: Mutex<StorageStatus>,
    session: Mutex<SessionReport>,
}

impl StorageCore {
    pub fn open(config: StorageConfig) -> AppResult<Arc<Self>> {
        let settings = SettingsHandle::json_file(&config.settings_path);
        Self::open_with(config, settings, FaultInjector::new())
    }

    /// Build the core and run the open-time protocol before returning.
    ///
    /// Only failing to start the worker thread is an error. A database that
    /// cannot be brought up leaves the core in [`StorageStatus::Unavailable`].
    pub fn open_with(
        config: StorageConfig,
        settings: SettingsHandle,
        faults: FaultInjector,
    ) -> AppResult<Arc<Self>> {
        let serializer = AccessSerializer::new("pantry-db").map_err(|err| {
            AppError::from(err).with_context("operation", "spawn_storage_worker")
        })?;
        if let Err(err) = fs::create_dir_all(config.data_dir()) {
            warn!(
                target: "pantry",
                event = "data_dir_create_failed",
                path = %config.data_dir().display(),
                error = %err
            );
        }

        let core = Arc::new(Self {
            handle: StorageHandle::new(&config.db_path, config.busy_timeout),
            config,
            serializer,
            settings,
            faults,
            pending_recovery: Mutex::new(None),
            recovering: Arc::new(AtomicBool::new(false)),
            backup_pending: AtomicBool::new(false),
            status: Mutex::new(StorageStatus::Unavailable(AppError::new(
                "DB/STARTING",
                "Storage is still starting",
            ))),
            session: Mutex::new(SessionReport::default()),
        });
        core.run_sync(|core| core.startup());
        Ok(core)
    }

    fn recovery_context(&self) -> RecoveryContext<'_> {
        RecoveryContext {
            handle: &self.handle,
            settings: &self.settings,
            faults: &self.faults,
        }
    }

    fn startup(&self) {
        match self.recovery_context().startup() {
            Ok(report) => {
                self.record_startup(&report);
                self.set_status(StorageStatus::Ready);
                info!(
                    target: "pantry",
                    event = "storage_ready",
                    path = %self.config.db_path.display(),
                    recovered = report.open.recovered
                );
            }
            Err(err) => {
                self.handle.close();
                error!(
                    target: "pantry",
                    event = "storage_unavailable",
                    path = %self.config.db_path.display(),
                    code = %err.code(),
                    error = %err
                );
                self.set_status(StorageStatus::Unavailable(err));
            }
        }
    }

    fn record_startup(&self, report: &StartupReport) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.recovered_at_open = report.open.recovered;
        session.startup_quarantine = report.open.quarantined.clone();
        session.migration = Some(report.migration);
        session.startup_salvage = report.salvage.clone();
        if report.backup.is_some() {
            session.last_backup = report.backup.clone();
        }
    }

    fn set_status(&self, status: StorageStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn status(&self) -> StorageStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn session(&self) -> SessionReport {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Blocking entry onto the storage worker, for code without an event loop.
    pub fn run_sync<T, F>(self: &Arc<Self>, work: F) -> T
    where
        F: FnOnce(&Arc<StorageCore>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let core = Arc::clone(self);
        self.serializer.run_sync(move || work(&core))
    }

    /// Async entry onto the storage worker; the caller suspends until it finishes.
    pub async fn run<T, F>(self: &Arc<Self>, work: F) -> T
    where
        F: FnOnce(&Arc<StorageCore>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let core = Arc::clone(self);
        self.serializer.run(move || work(&core)).await
    }

    /// Run one unit of live work on the connection. Must be called on the worker.
    ///
    /// Returns `None` when the unit failed. A fatal failure queues runtime
    /// recovery behind the current unit; anything else is only logged.
    pub(crate) fn execute<T, F>(self: &Arc<Self>, context: &'static str, work: F) -> Option<T>
    where
        F: FnOnce(&Connection, &FaultInjector) -> rusqlite::Result<T>,
    {
        debug_assert!(
            self.serializer.is_current(),
            "StorageCore::execute called off the storage worker"
        );
        self.recover_if_pending();
        let result = self
            .handle
            .with_connection(|conn| work(conn, &self.faults));
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report_failure(context, &err);
                None
            }
        }
    }

    fn report_failure(self: &Arc<Self>, context: &'static str, err: &StorageError) {
        let Some(sqlite_err) = err.sqlite() else {
            warn!(target: "pantry", event = "storage_closed", context);
            return;
        };
        let code = error_code(sqlite_err).unwrap_or(0);
        let fatal = is_fatal_storage(err);
        if fatal {
            error!(
                target: "pantry",
                event = "db_op_failed",
                context,
                code,
                fatal,
                error = %sqlite_err
            );
            self.schedule_recovery(RuntimeTrigger {
                context: context.to_string(),
                code,
            });
        } else {
            warn!(
                target: "pantry",
                event = "db_op_failed",
                context,
                code,
                fatal,
                error = %sqlite_err
            );
        }
    }

    /// Queue a runtime recovery pass. Triggers that arrive while one is
    /// already pending or running collapse into it.
    pub fn schedule_recovery(self: &Arc<Self>, trigger: RuntimeTrigger) {
        {
            let mut pending = self
                .pending_recovery
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if pending.is_some() || self.recovering.load(Ordering::SeqCst) {
                info!(
                    target: "pantry",
                    event = "recovery_trigger_coalesced",
                    context = %trigger.context,
                    code = trigger.code
                );
                return;
            }
            *pending = Some(trigger);
        }
        let core = Arc::clone(self);
        self.serializer.defer(move || core.recover_if_pending());
    }

    pub fn recovery_pending(&self) -> bool {
        self.pending_recovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn recover_if_pending(&self) {
        let trigger = self
            .pending_recovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(trigger) = trigger else {
            return;
        };
        let Ok(_guard) = RecoveryGuard::begin(self.recovering.clone()) else {
            return;
        };

        match self.recovery_context().recover_runtime(&trigger) {
            Ok(report) => {
                let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
                session.runtime_recoveries += 1;
                if report.backup.is_some() {
                    session.last_backup = report.backup.clone();
                }
                session.last_runtime_recovery = Some(report);
                drop(session);
                self.set_status(StorageStatus::Ready);
            }
            Err(err) => {
                error!(
                    target: "pantry",
                    event = "runtime_recovery_failed",
                    context = %trigger.context,
                    code = %err.code(),
                    error = %err
                );
                self.set_status(StorageStatus::Unavailable(err));
            }
        }
    }

    /// Queue a backup after the current unit. Writes that land before it runs
    /// are covered by the same backup.
    pub fn schedule_backup(self: &Arc<Self>) {
        if self.backup_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(self);
        self.serializer.defer(move || {
            core.backup_pending.store(false, Ordering::SeqCst);
            core.recover_if_pending();
            if core.handle.is_open() {
                core.backup_on_worker(backup::TAG_AFTER_WRITE).ok();
            }
        });
    }

    fn backup_on_worker(&self, tag: &str) -> AppResult<BackupOutcome> {
        let schema_version = self
            .settings
            .schema_version()
            .unwrap_or(crate::db::schema::CURRENT_SCHEMA_VERSION);
        let outcome = self.handle.try_with(|conn| {
            backup::backup_now(conn, self.db_path(), tag, schema_version, &self.faults)
        })?;
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_backup = Some(outcome.clone());
        Ok(outcome)
    }

    /// Take a backup now, after anything already queued. Blocks the caller.
    pub fn backup_now(self: &Arc<Self>, tag: &'static str) -> AppResult<BackupOutcome> {
        self.run_sync(move |core| {
            core.recover_if_pending();
            core.backup_on_worker(tag)
        })
    }

    pub fn health_report(self: &Arc<Self>) -> AppResult<DbHealthReport> {
        self.run_sync(|core| {
            core.recover_if_pending();
            core.handle.try_with(run_health_checks)
        })
    }

    /// Run the salvage step on demand, e.g. after restoring a quarantine file by hand.
    pub fn salvage_latest(self: &Arc<Self>) -> SalvageOutcome {
        self.run_sync(|core| {
            core.recover_if_pending();
            core.recovery_context().salvage_latest()
        })
    }

    /// Close the connection. Later operations behave as on an unavailable core.
    pub fn shutdown(self: &Arc<Self>) {
        self.run_sync(|core| {
            core.handle.close();
            core.set_status(StorageStatus::Unavailable(AppError::new(
                "DB/CLOSED",
                "Storage has been shut down",
            )));
            info!(
                target: "pantry",
                event = "recovery_phase",
                phase = "closed",
                path = %core.db_path().display()
            );
        });
    }
}

/// Marks a recovery pass as in flight; cleared on drop.
pub struct RecoveryGuard {
    flag: Arc<AtomicBool>,
}

impl RecoveryGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                "DB_RECOVERY/ACTIVE",
                "Database recovery is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
