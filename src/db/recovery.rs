//! Open-time verification, runtime recovery, and salvage from quarantined files.
//!
//! Everything here runs on the access serializer's worker. The open-time path
//! retries at most once: a failed open or quick check quarantines the file and
//! reopens a fresh one, and a second failure ends startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::backup::{self, BackupOutcome};
use crate::db::fatal;
use crate::db::faults::{FaultInjector, FaultPoint};
use crate::db::handle::{open_read_only, OpenFailure, StorageHandle};
use crate::db::health::try_quick_check;
use crate::db::quarantine::{self, Disposition, QuarantineReason};
use crate::db::schema::{self, MigrationOutcome, CURRENT_SCHEMA_VERSION};
use crate::error::StorageError;
use crate::model::{IngredientRecord, Recipe};
use crate::settings::SettingsHandle;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Closed,
    Opening,
    Verifying,
    Quarantining,
    Ready,
    Failed,
}

impl RecoveryPhase {
    fn as_str(self) -> &'static str {
        match self {
            RecoveryPhase::Closed => "closed",
            RecoveryPhase::Opening => "opening",
            RecoveryPhase::Verifying => "verifying",
            RecoveryPhase::Quarantining => "quarantining",
            RecoveryPhase::Ready => "ready",
            RecoveryPhase::Failed => "failed",
        }
    }
}

fn enter(phase: RecoveryPhase, path: &Path) {
    info!(
        target: "pantry",
        event = "recovery_phase",
        phase = phase.as_str(),
        path = %path.display()
    );
}

/// What the open-time protocol had to do to get a verified connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpenReport {
    pub recovered: bool,
    pub quarantined: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub open: OpenReport,
    pub migration: MigrationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salvage: Option<SalvageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupOutcome>,
}

/// The live operation whose fatal error started a runtime recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeTrigger {
    pub context: String,
    pub code: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    pub trigger: RuntimeTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<PathBuf>,
    pub salvage: SalvageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SalvageOutcome {
    /// No unprocessed quarantine file exists.
    NoCandidate,
    /// The live database already holds recipes; nothing was read.
    SkippedNotEmpty,
    NoRecipes {
        source: PathBuf,
    },
    Empty {
        source: PathBuf,
    },
    Recovered {
        source: PathBuf,
        from_backup: bool,
        restored: usize,
        ingredient_rows: usize,
        failed_ingredient_rows: usize,
    },
    /// Candidates existed but none were written; the source stays unmarked.
    Failed {
        source: PathBuf,
        candidates: usize,
        error: String,
    },
}

impl SalvageOutcome {
    pub fn restored(&self) -> usize {
        match self {
            SalvageOutcome::Recovered { restored, .. } => *restored,
            _ => 0,
        }
    }

    fn wants_backup_fallback(&self) -> bool {
        matches!(
            self,
            SalvageOutcome::NoRecipes { .. } | SalvageOutcome::Failed { .. }
        )
    }
}

/// Borrowed view of the pieces a recovery pass works with.
pub struct RecoveryContext<'a> {
    pub handle: &'a StorageHandle,
    pub settings: &'a SettingsHandle,
    pub faults: &'a FaultInjector,
}

impl RecoveryContext<'_> {
    fn db_path(&self) -> &Path {
        self.handle.path()
    }

    fn schema_version(&self) -> u32 {
        self.settings
            .schema_version()
            .unwrap_or(CURRENT_SCHEMA_VERSION)
    }

    fn open_once(&self) -> Result<(), OpenFailure> {
        self.faults
            .check(FaultPoint::Open)
            .map_err(OpenFailure::Connect)?;
        self.handle.open()
    }

    /// `Ok(false)` means the engine found damage; `Err` means the check could not run.
    fn verify(&self) -> Result<bool, StorageError> {
        self.faults.check(FaultPoint::QuickCheck)?;
        self.handle.with_connection(try_quick_check)
    }

    /// Give up on this startup without touching the file: it is busy, not broken.
    fn transient_failure(&self, stage: &'static str, cause: AppError) -> AppError {
        self.handle.close();
        enter(RecoveryPhase::Failed, self.db_path());
        warn!(
            target: "pantry",
            event = "db_open_transient",
            path = %self.db_path().display(),
            stage,
            error = %cause
        );
        AppError::new(
            "DB_OPEN/TRANSIENT",
            "Database is temporarily unavailable; the file was left in place",
        )
        .with_context("path", self.db_path().display().to_string())
        .with_context("stage", stage)
        .with_cause(cause)
    }

    fn quarantine_live(&self, reason: &QuarantineReason) -> AppResult<Option<PathBuf>> {
        enter(RecoveryPhase::Quarantining, self.db_path());
        self.handle.close();
        quarantine::quarantine(self.db_path(), reason).map_err(|err| {
            enter(RecoveryPhase::Failed, self.db_path());
            AppError::new("DB_RECOVERY/FAILED", "Could not quarantine the database file")
                .with_context("reason", reason.tag())
                .with_cause(err)
        })
    }

    /// Open, configure and quick-check the live file, quarantining and retrying once.
    ///
    /// Only a refused open, a fatal error class, or real quick-check findings move
    /// the file aside. Lock contention ends startup with `DB_OPEN/TRANSIENT`.
    pub fn open_verified(&self) -> AppResult<OpenReport> {
        let mut report = OpenReport::default();
        let mut retried = false;

        loop {
            enter(RecoveryPhase::Opening, self.db_path());
            if let Err(err) = self.open_once() {
                warn!(
                    target: "pantry",
                    event = "db_open_failed",
                    path = %self.db_path().display(),
                    retried,
                    error = %err
                );
                self.handle.close();
                let busy = matches!(&err, OpenFailure::Configure(cause) if !fatal::is_fatal(cause));
                if busy {
                    return Err(self.transient_failure("configure", err.into_sqlite().into()));
                }
                if retried {
                    enter(RecoveryPhase::Failed, self.db_path());
                    return Err(AppError::new("DB_OPEN/FAILED", "Database could not be opened")
                        .with_context("path", self.db_path().display().to_string())
                        .with_cause(err.into_sqlite()));
                }
                if let Some(moved) = self.quarantine_live(&QuarantineReason::OpenFailed)? {
                    report.quarantined.push(moved);
                }
                retried = true;
                continue;
            }

            enter(RecoveryPhase::Verifying, self.db_path());
            let failure = match self.verify() {
                Ok(true) => {
                    enter(RecoveryPhase::Ready, self.db_path());
                    report.recovered = retried;
                    return Ok(report);
                }
                Ok(false) => String::from("quick_check reported damage"),
                Err(err) if fatal::is_fatal_storage(&err) => err.to_string(),
                Err(err) => return Err(self.transient_failure("quick_check", err.into())),
            };

            warn!(
                target: "pantry",
                event = "db_quick_check_failed",
                path = %self.db_path().display(),
                retried,
                error = %failure
            );
            if retried {
                self.handle.close();
                enter(RecoveryPhase::Failed, self.db_path());
                return Err(AppError::new(
                    "DB_INTEGRITY/FAILED",
                    "Database failed its integrity check after recreation",
                )
                .with_context("path", self.db_path().display().to_string()));
            }
            if let Some(moved) = self.quarantine_live(&QuarantineReason::CheckFailed)? {
                report.quarantined.push(moved);
            }
            retried = true;
        }
    }

    /// The full open-time protocol: verify, migrate, salvage if recovery ran, then back up.
    pub fn startup(&self) -> AppResult<StartupReport> {
        let open = self.open_verified()?;

        let migration = self
            .handle
            .try_with(|conn| schema::migrate(conn, self.settings, CURRENT_SCHEMA_VERSION))
            .map_err(|err| {
                self.handle.close();
                err
            })?;

        let salvage = open.recovered.then(|| self.salvage_latest());
        let backup = self.backup(backup::TAG_STARTUP_OK);

        Ok(StartupReport {
            open,
            migration,
            salvage,
            backup,
        })
    }

    /// Replace the live file after a fatal error surfaced mid-session.
    pub fn recover_runtime(&self, trigger: &RuntimeTrigger) -> AppResult<RuntimeReport> {
        warn!(
            target: "pantry",
            event = "runtime_recovery_started",
            context = %trigger.context,
            code = trigger.code
        );

        let reason = QuarantineReason::runtime(&trigger.context, trigger.code);
        let moved = self.quarantine_live(&reason)?;

        enter(RecoveryPhase::Opening, self.db_path());
        let fail = |err: AppError| {
            self.handle.close();
            enter(RecoveryPhase::Failed, self.db_path());
            AppError::new("DB_RECOVERY/FAILED", "Could not recreate the database")
                .with_context("context", trigger.context.clone())
                .with_cause(err)
        };
        self.open_once()
            .map_err(|err| fail(err.into_sqlite().into()))?;

        enter(RecoveryPhase::Verifying, self.db_path());
        match self.verify() {
            Ok(true) => {}
            Ok(false) => {
                return Err(fail(AppError::new(
                    "DB_INTEGRITY/FAILED",
                    "Recreated database failed its integrity check",
                )))
            }
            Err(err) => return Err(fail(err.into())),
        }
        self.handle
            .try_with(|conn| {
                schema::migrate(conn, self.settings, CURRENT_SCHEMA_VERSION)?;
                schema::ensure_deleted_at_column(conn)?;
                Ok(())
            })
            .map_err(fail)?;
        enter(RecoveryPhase::Ready, self.db_path());

        let salvage = self.salvage_latest();
        let backup = self.backup(backup::TAG_RUNTIME_RECOVERED);

        info!(
            target: "pantry",
            event = "runtime_recovery_finished",
            context = %trigger.context,
            restored = salvage.restored()
        );
        Ok(RuntimeReport {
            trigger: trigger.clone(),
            quarantine: moved,
            salvage,
            backup,
        })
    }

    /// Take a backup; failures are logged by the rotator and never escalate.
    pub fn backup(&self, tag: &str) -> Option<BackupOutcome> {
        let schema_version = self.schema_version();
        self.handle
            .try_with(|conn| {
                backup::backup_now(conn, self.db_path(), tag, schema_version, self.faults)
            })
            .ok()
    }

    /// Salvage into an empty live database from the newest unprocessed quarantine
    /// file, falling back to the newest valid backup slot.
    pub fn salvage_latest(&self) -> SalvageOutcome {
        let outcome = self.salvage_from_quarantine();
        if outcome.wants_backup_fallback() && self.live_is_empty() {
            if let Some(slot) = backup::newest_valid_backup(self.db_path()) {
                info!(
                    target: "pantry",
                    event = "salvage_backup_fallback",
                    slot = %slot.display()
                );
                let fallback = self.salvage_from(&slot, true);
                if matches!(fallback, SalvageOutcome::Recovered { .. }) {
                    return fallback;
                }
            }
        }
        outcome
    }

    fn live_is_empty(&self) -> bool {
        self.handle
            .with_connection(live_recipe_count)
            .map(|count| count == 0)
            .unwrap_or(false)
    }

    fn salvage_from_quarantine(&self) -> SalvageOutcome {
        if !self.live_is_empty() {
            info!(target: "pantry", event = "salvage_skipped", reason = "live_not_empty");
            return SalvageOutcome::SkippedNotEmpty;
        }
        let candidate = match quarantine::latest_candidate(self.db_path()) {
            Ok(Some(path)) => path,
            Ok(None) => return SalvageOutcome::NoCandidate,
            Err(err) => {
                warn!(target: "pantry", event = "salvage_scan_failed", error = %err);
                return SalvageOutcome::NoCandidate;
            }
        };
        self.salvage_from(&candidate, false)
    }

    /// Restore recipes (and their ingredient rows) from `source` into the live database.
    ///
    /// Quarantine sources are renamed with their disposition afterwards; backup
    /// slots are only ever read.
    pub fn salvage_from(&self, source: &Path, from_backup: bool) -> SalvageOutcome {
        let outcome = match read_source(source) {
            Err(err) => SalvageOutcome::Failed {
                source: source.to_path_buf(),
                candidates: 0,
                error: err.to_string(),
            },
            Ok(SourceRows::NoRecipes) => SalvageOutcome::NoRecipes {
                source: source.to_path_buf(),
            },
            Ok(SourceRows::Rows { recipes, .. }) if recipes.is_empty() => SalvageOutcome::Empty {
                source: source.to_path_buf(),
            },
            Ok(SourceRows::Rows {
                recipes,
                ingredients,
            }) => self.restore(source, from_backup, &recipes, &ingredients),
        };

        let disposition = match &outcome {
            SalvageOutcome::Recovered { .. } => Some(Disposition::Recovered),
            SalvageOutcome::Empty { .. } => Some(Disposition::Empty),
            SalvageOutcome::NoRecipes { .. } => Some(Disposition::NoRecipes),
            _ => None,
        };
        if let (Some(disposition), false) = (disposition, from_backup) {
            if let Err(err) = quarantine::mark_processed(source, disposition) {
                warn!(
                    target: "pantry",
                    event = "quarantine_mark_failed",
                    path = %source.display(),
                    error = %err
                );
            }
        }

        match &outcome {
            SalvageOutcome::Failed { error: reason, .. } => error!(
                target: "pantry",
                event = "salvage_finished",
                source = %source.display(),
                outcome = "failed",
                error = %reason
            ),
            other => info!(
                target: "pantry",
                event = "salvage_finished",
                source = %source.display(),
                outcome = ?other
            ),
        }
        outcome
    }

    fn restore(
        &self,
        source: &Path,
        from_backup: bool,
        recipes: &[Recipe],
        ingredients: &[IngredientRecord],
    ) -> SalvageOutcome {
        let written = self
            .handle
            .with_connection(|conn| upsert_salvaged(conn, recipes, ingredients));
        match written {
            Ok(counts) if counts.restored > 0 => {
                self.backup(backup::TAG_RESTORE_OK);
                SalvageOutcome::Recovered {
                    source: source.to_path_buf(),
                    from_backup,
                    restored: counts.restored,
                    ingredient_rows: counts.ingredient_rows,
                    failed_ingredient_rows: counts.failed_ingredient_rows,
                }
            }
            Ok(_) => SalvageOutcome::Failed {
                source: source.to_path_buf(),
                candidates: recipes.len(),
                error: "no rows restored".to_string(),
            },
            Err(err) => SalvageOutcome::Failed {
                source: source.to_path_buf(),
                candidates: recipes.len(),
                error: err.to_string(),
            },
        }
    }
}

pub fn live_recipe_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM recipes", [], |row| row.get(0))
}

enum SourceRows {
    NoRecipes,
    Rows {
        recipes: Vec<Recipe>,
        ingredients: Vec<IngredientRecord>,
    },
}

/// Pick the select for live recipes in a source file.
///
/// Files from before the soft-delete column hold only live recipes. A column
/// list that cannot be read is an error, never a guess.
fn live_recipe_query(conn: &Connection) -> rusqlite::Result<&'static str> {
    if schema::has_column(conn, schema::RECIPES_TABLE, "deleted_at")? {
        Ok("SELECT id, title, notes, created_at, updated_at, deleted_at
            FROM recipes WHERE deleted_at IS NULL")
    } else {
        Ok("SELECT id, title, notes, created_at, updated_at, NULL FROM recipes")
    }
}

/// Read what is still readable from a suspect file, never writing to it.
fn read_source(path: &Path) -> AppResult<SourceRows> {
    let conn = open_read_only(path)
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;

    match schema::table_exists(&conn, schema::RECIPES_TABLE) {
        Ok(true) => {}
        Ok(false) => return Ok(SourceRows::NoRecipes),
        Err(err) => {
            warn!(
                target: "pantry",
                event = "salvage_schema_unreadable",
                path = %path.display(),
                error = %err
            );
            return Ok(SourceRows::NoRecipes);
        }
    }

    let sql = live_recipe_query(&conn)
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
    let recipes = read_until_error(&conn, sql, Recipe::from_row, path)?;

    let ingredients = if schema::table_exists(&conn, schema::INGREDIENTS_TABLE).unwrap_or(false) {
        read_until_error(
            &conn,
            "SELECT id, parent_id, kind, order_index, group_id, title, name, quantity, unit
             FROM ingredient_rows",
            IngredientRecord::from_sql_row,
            path,
        )
        .unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(SourceRows::Rows {
        recipes,
        ingredients,
    })
}

/// Collect rows until the first read error; damaged pages end the scan, not the salvage.
fn read_until_error<T>(
    conn: &Connection,
    sql: &str,
    map: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    path: &Path,
) -> AppResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    loop {
        match rows.next() {
            Ok(Some(row)) => match map(row) {
                Ok(value) => out.push(value),
                Err(err) => {
                    warn!(
                        target: "pantry",
                        event = "salvage_row_skipped",
                        path = %path.display(),
                        error = %err
                    );
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!(
                    target: "pantry",
                    event = "salvage_read_stopped",
                    path = %path.display(),
                    kept = out.len(),
                    error = %err
                );
                break;
            }
        }
    }
    Ok(out)
}

struct RestoreCounts {
    restored: usize,
    ingredient_rows: usize,
    failed_ingredient_rows: usize,
}

fn upsert_salvaged(
    conn: &Connection,
    recipes: &[Recipe],
    ingredients: &[IngredientRecord],
) -> rusqlite::Result<RestoreCounts> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut counts = RestoreCounts {
        restored: 0,
        ingredient_rows: 0,
        failed_ingredient_rows: 0,
    };
    let mut restored_ids = HashSet::new();

    {
        let mut insert = tx.prepare(
            "INSERT OR REPLACE INTO recipes (id, title, notes, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        )?;
        for recipe in recipes {
            match insert.execute((
                &recipe.id,
                &recipe.title,
                &recipe.notes,
                recipe.created_at,
                recipe.updated_at,
            )) {
                Ok(_) => {
                    counts.restored += 1;
                    restored_ids.insert(recipe.id.as_str());
                }
                Err(err) => warn!(
                    target: "pantry",
                    event = "salvage_recipe_skipped",
                    id = %recipe.id,
                    error = %err
                ),
            }
        }

        let mut insert_row = tx.prepare(
            "INSERT OR REPLACE INTO ingredient_rows
                (id, parent_id, kind, order_index, group_id, title, name, quantity, unit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for row in ingredients
            .iter()
            .filter(|row| restored_ids.contains(row.parent_id.as_str()))
        {
            match insert_row.execute((
                &row.id,
                &row.parent_id,
                row.kind,
                row.order_index,
                &row.group_id,
                &row.title,
                &row.name,
                &row.quantity,
                &row.unit,
            )) {
                Ok(_) => counts.ingredient_rows += 1,
                Err(_) => counts.failed_ingredient_rows += 1,
            }
        }
    }

    tx.commit()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handle::{configure, open_connection};
    use rusqlite::ffi;
    use std::fs;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        handle: StorageHandle,
        settings: SettingsHandle,
        faults: FaultInjector,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let handle = StorageHandle::new(dir.path().join("pantry.sqlite3"), Duration::from_secs(1));
            Self {
                dir,
                handle,
                settings: SettingsHandle::in_memory(),
                faults: FaultInjector::new(),
            }
        }

        fn ctx(&self) -> RecoveryContext<'_> {
            RecoveryContext {
                handle: &self.handle,
                settings: &self.settings,
                faults: &self.faults,
            }
        }

        fn live_titles(&self) -> Vec<String> {
            self.handle
                .with_connection(|conn| {
                    let mut stmt = conn.prepare("SELECT title FROM recipes ORDER BY title")?;
                    let rows = stmt.query_map([], |row| row.get(0))?;
                    rows.collect()
                })
                .unwrap()
        }
    }

    fn seeded_source(path: &Path) {
        let conn = open_connection(path).unwrap();
        configure(&conn, Duration::from_secs(1)).unwrap();
        schema::ensure_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO recipes VALUES ('a', 'Apple pie', '', 1, 1, NULL);
             INSERT INTO recipes VALUES ('b', 'Bread', '', 2, 2, NULL);
             INSERT INTO recipes VALUES ('c', 'Cake', '', 3, 3, 30);
             INSERT INTO ingredient_rows VALUES ('i1', 'a', 0, 0, NULL, NULL, 'Apple', '3', NULL);
             INSERT INTO ingredient_rows VALUES ('i2', 'c', 0, 0, NULL, NULL, 'Flour', '1', 'kg');",
        )
        .unwrap();
    }

    #[test]
    fn clean_open_needs_no_recovery() {
        let fx = Fixture::new();
        let report = fx.ctx().open_verified().unwrap();
        assert!(!report.recovered);
        assert!(report.quarantined.is_empty());
        assert!(fx.handle.is_open());
    }

    #[test]
    fn unopenable_file_is_quarantined_once() {
        let fx = Fixture::new();
        fs::write(fx.handle.path(), vec![0x5a; 8192]).unwrap();

        let report = fx.ctx().open_verified().unwrap();
        assert!(report.recovered);
        assert_eq!(report.quarantined.len(), 1);
        let name = report.quarantined[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_Corrupted_") && name.contains("open_failed"), "{name}");
    }

    #[test]
    fn failed_check_is_quarantined_with_check_reason() {
        let fx = Fixture::new();
        fx.faults.arm(FaultPoint::QuickCheck, ffi::SQLITE_CORRUPT);
        let report = fx.ctx().open_verified().unwrap();
        assert!(report.recovered);
        let name = report.quarantined[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_check_failed.sqlite3"), "{name}");
    }

    #[test]
    fn second_failure_ends_startup() {
        let fx = Fixture::new();
        fx.faults.arm(FaultPoint::Open, ffi::SQLITE_CANTOPEN);
        fx.faults.arm(FaultPoint::Open, ffi::SQLITE_CANTOPEN);
        let err = fx.ctx().open_verified().unwrap_err();
        assert_eq!(err.code(), "DB_OPEN/FAILED");
        assert!(!fx.handle.is_open());

        let fx = Fixture::new();
        fx.faults.arm(FaultPoint::QuickCheck, ffi::SQLITE_CORRUPT);
        fx.faults.arm(FaultPoint::QuickCheck, ffi::SQLITE_CORRUPT);
        let err = fx.ctx().open_verified().unwrap_err();
        assert_eq!(err.code(), "DB_INTEGRITY/FAILED");
    }

    #[test]
    fn locked_file_is_left_in_place() {
        let fx = Fixture::new();
        fx.ctx().startup().unwrap();
        fx.handle.close();

        let holder = Connection::open(fx.handle.path()).unwrap();
        holder
            .execute_batch("PRAGMA locking_mode=EXCLUSIVE; BEGIN EXCLUSIVE;")
            .unwrap();
        let _: i64 = holder
            .query_row("SELECT COUNT(*) FROM recipes", [], |row| row.get(0))
            .unwrap();

        let err = fx.ctx().open_verified().unwrap_err();
        assert_eq!(err.code(), "DB_OPEN/TRANSIENT");
        assert_eq!(err.context().get("stage").map(String::as_str), Some("configure"));
        assert!(!fx.handle.is_open());
        assert!(fx.handle.path().exists());
        assert!(quarantine::list_quarantine(fx.handle.path()).unwrap().is_empty());

        drop(holder);
        let report = fx.ctx().open_verified().unwrap();
        assert!(!report.recovered);
    }

    #[test]
    fn busy_quick_check_is_not_damage() {
        let fx = Fixture::new();
        fx.faults.arm(FaultPoint::QuickCheck, ffi::SQLITE_BUSY);
        let err = fx.ctx().open_verified().unwrap_err();
        assert_eq!(err.code(), "DB_OPEN/TRANSIENT");
        assert_eq!(err.context().get("stage").map(String::as_str), Some("quick_check"));
        assert!(quarantine::list_quarantine(fx.handle.path()).unwrap().is_empty());
    }

    #[test]
    fn legacy_source_selects_every_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE recipes (id TEXT, title TEXT, notes TEXT, created_at INTEGER, updated_at INTEGER);",
        )
        .unwrap();
        let sql = live_recipe_query(&conn).unwrap();
        assert!(!sql.contains("deleted_at"), "{sql}");
    }

    #[test]
    fn unreadable_column_list_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE base (x INTEGER);
             CREATE VIEW recipes AS SELECT x FROM base;
             DROP TABLE base;",
        )
        .unwrap();
        assert!(live_recipe_query(&conn).is_err());
    }

    #[test]
    fn salvage_skips_soft_deleted_and_copies_child_rows() {
        let fx = Fixture::new();
        let source = fx.dir.path().join("pantry_Corrupted_20240101_000000_check_failed.sqlite3");
        seeded_source(&source);
        fx.ctx().startup().unwrap();

        let outcome = fx.ctx().salvage_from(&source, false);
        match outcome {
            SalvageOutcome::Recovered {
                restored,
                ingredient_rows,
                from_backup,
                ..
            } => {
                assert_eq!(restored, 2);
                assert_eq!(ingredient_rows, 1);
                assert!(!from_backup);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fx.live_titles(), vec!["Apple pie", "Bread"]);
        assert!(!source.exists());
        assert!(quarantine::latest_candidate(fx.handle.path()).unwrap().is_none());
    }

    #[test]
    fn source_without_recipes_table_is_marked() {
        let fx = Fixture::new();
        let source = fx.dir.path().join("pantry_Corrupted_20240101_000000_open_failed.sqlite3");
        Connection::open(&source)
            .unwrap()
            .execute_batch("CREATE TABLE other(x);")
            .unwrap();
        fx.ctx().startup().unwrap();

        let outcome = fx.ctx().salvage_from(&source, false);
        assert!(matches!(outcome, SalvageOutcome::NoRecipes { .. }));
        let listed = quarantine::list_quarantine(fx.handle.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].disposition, Some(Disposition::NoRecipes));
    }

    #[test]
    fn salvage_never_touches_populated_database() {
        let fx = Fixture::new();
        let source = fx.dir.path().join("pantry_Corrupted_20240101_000000_check_failed.sqlite3");
        seeded_source(&source);
        fx.ctx().startup().unwrap();
        fx.handle
            .with_connection(|conn| {
                conn.execute("INSERT INTO recipes VALUES ('z', 'Zest', '', 9, 9, NULL)", [])
            })
            .unwrap();

        assert_eq!(fx.ctx().salvage_latest(), SalvageOutcome::SkippedNotEmpty);
        assert!(source.exists());
        assert_eq!(fx.live_titles(), vec!["Zest"]);
    }
}
