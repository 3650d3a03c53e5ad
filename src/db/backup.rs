//! Two-generation full-file backups of the live database.
//!
//! Slots sit beside the database: `<name>_backup` holds the newest copy and
//! `<name>_backup2` the one before it. Rotation happens before the copy, and the
//! copy lands in a `.partial` file that is only renamed into the newest slot once
//! it passes a quick check, so the previous generation is never at risk.

use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::available_space;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::faults::{FaultInjector, FaultPoint};
use crate::db::health::quick_check_file;
use crate::db::{remove_sidecars, sidecar_bytes, sync_dir, write_atomic};
use crate::{AppError, AppResult};

pub const TAG_STARTUP_OK: &str = "startup_ok";
pub const TAG_RUNTIME_RECOVERED: &str = "runtime_recovered";
pub const TAG_RESTORE_OK: &str = "restore_ok";
pub const TAG_AFTER_WRITE: &str = "after_write";
pub const TAG_MANUAL: &str = "manual";

pub const FAKE_FREE_BYTES_ENV: &str = "PANTRY_BACKUP_FAKE_FREE_BYTES";

const NEWEST_SUFFIX: &str = "_backup";
const PREVIOUS_SUFFIX: &str = "_backup2";
const PARTIAL_SUFFIX: &str = ".partial";
const MANIFEST_SUFFIX: &str = ".manifest.json";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub tag: String,
    pub app_version: String,
    pub schema_version: u32,
    pub db_size_bytes: u64,
    pub created_at: String,
    pub sha256: String,
}

impl BackupManifest {
    pub fn new(tag: &str, schema_version: u32, db_size_bytes: u64, sha256: String) -> Self {
        Self {
            tag: tag.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version,
            db_size_bytes,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            sha256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupPaths {
    pub newest: PathBuf,
    pub previous: PathBuf,
}

impl BackupPaths {
    pub fn slots(&self) -> [&Path; 2] {
        [&self.newest, &self.previous]
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub fn backup_paths(db_path: &Path) -> BackupPaths {
    BackupPaths {
        newest: suffixed(db_path, NEWEST_SUFFIX),
        previous: suffixed(db_path, PREVIOUS_SUFFIX),
    }
}

pub fn manifest_path(slot: &Path) -> PathBuf {
    suffixed(slot, MANIFEST_SUFFIX)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub tag: String,
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

/// Copy the live database into the newest backup slot.
///
/// Runs against the live connection, so it must be called from inside the
/// access serializer. Logs the tag and outcome either way.
pub fn backup_now(
    conn: &Connection,
    db_path: &Path,
    tag: &str,
    schema_version: u32,
    faults: &FaultInjector,
) -> AppResult<BackupOutcome> {
    let result = run_backup(conn, db_path, tag, schema_version, faults);
    match &result {
        Ok(outcome) => info!(
            target: "pantry",
            event = "db_backup",
            tag,
            outcome = "ok",
            path = %outcome.path.display(),
            size_bytes = outcome.manifest.db_size_bytes
        ),
        Err(err) => warn!(
            target: "pantry",
            event = "db_backup",
            tag,
            outcome = "failed",
            code = %err.code(),
            error = %err
        ),
    }
    result
}

fn run_backup(
    conn: &Connection,
    db_path: &Path,
    tag: &str,
    schema_version: u32,
    faults: &FaultInjector,
) -> AppResult<BackupOutcome> {
    checkpoint(conn);

    let paths = backup_paths(db_path);
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    ensure_free_space(db_path, dir)?;

    rotate(&paths)?;

    let partial = suffixed(&paths.newest, PARTIAL_SUFFIX);
    let copied = copy_and_verify(conn, &partial, faults);
    if let Err(err) = copied {
        let _ = fs::remove_file(&partial);
        remove_sidecars(&partial).ok();
        return Err(err);
    }

    fs::rename(&partial, &paths.newest).map_err(|err| {
        let _ = fs::remove_file(&partial);
        AppError::from(err)
            .with_context("operation", "finalize_backup")
            .with_context("from", partial.display().to_string())
            .with_context("to", paths.newest.display().to_string())
    })?;
    sync_dir(dir).ok();

    let size = fs::metadata(&paths.newest).map(|meta| meta.len())?;
    let sha = file_sha256(&paths.newest)?;
    let manifest = BackupManifest::new(tag, schema_version, size, sha);
    write_manifest(&paths.newest, &manifest)?;

    Ok(BackupOutcome {
        tag: tag.to_string(),
        path: paths.newest,
        manifest,
    })
}

/// Merge the WAL into the main file. Failure only costs freshness of the copy.
fn checkpoint(conn: &Connection) {
    let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    });
    match result {
        Ok((0, _)) => {}
        Ok((busy, frames)) => warn!(
            target: "pantry",
            event = "db_checkpoint_incomplete",
            busy,
            frames
        ),
        Err(err) => warn!(
            target: "pantry",
            event = "db_checkpoint_failed",
            error = %err
        ),
    }
}

fn required_free_bytes(db_bytes: u64) -> u64 {
    (db_bytes as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn free_disk_space(dir: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", dir.display().to_string())
    })
}

fn ensure_free_space(db_path: &Path, dir: &Path) -> AppResult<()> {
    let db_bytes = fs::metadata(db_path).map(|meta| meta.len()).unwrap_or(0);
    let required = required_free_bytes(db_bytes.saturating_add(sidecar_bytes(db_path)));
    let available = free_disk_space(dir)?;
    if available < required {
        return Err(AppError::new(
            "DB_BACKUP/LOW_DISK",
            format!("Not enough disk space for a backup (need {required} bytes)."),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Shift newest into the previous slot. With no newest copy the previous slot is kept.
fn rotate(paths: &BackupPaths) -> AppResult<()> {
    if !paths.newest.exists() {
        return Ok(());
    }
    let rotate_err = |operation: &'static str| {
        move |err: io::Error| AppError::from(err).with_context("operation", operation)
    };
    remove_if_present(&paths.previous).map_err(rotate_err("drop_previous"))?;
    remove_if_present(&manifest_path(&paths.previous)).map_err(rotate_err("drop_previous_manifest"))?;
    fs::rename(&paths.newest, &paths.previous).map_err(rotate_err("shift_newest"))?;
    rename_if_present(&manifest_path(&paths.newest), &manifest_path(&paths.previous))
        .map_err(rotate_err("shift_newest_manifest"))?;
    Ok(())
}

fn copy_and_verify(conn: &Connection, partial: &Path, faults: &FaultInjector) -> AppResult<()> {
    remove_if_present(partial)?;
    run_sqlite_backup(conn, partial, faults)?;
    if !quick_check_file(partial) {
        return Err(AppError::new(
            "DB_BACKUP/VERIFY_FAILED",
            "Backup copy failed its integrity check",
        )
        .with_context("path", partial.display().to_string()));
    }
    File::open(partial)?.sync_all()?;
    Ok(())
}

fn run_sqlite_backup(src: &Connection, dest: &Path, faults: &FaultInjector) -> AppResult<()> {
    faults
        .check(FaultPoint::BackupCopy)
        .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;

    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_db")
            .with_context("path", dest.display().to_string())
    })?;

    {
        let backup = Backup::new(src, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_init"))?;
        let step = backup
            .step(-1)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;
        if step != StepResult::Done {
            return Err(AppError::new(
                "DB_BACKUP/INCOMPLETE",
                format!("Backup copy did not complete ({step:?})"),
            ));
        }
    }

    dest_conn.execute_batch("PRAGMA journal_mode=DELETE;").ok();
    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_backup_db"))?;
    Ok(())
}

fn write_manifest(slot: &Path, manifest: &BackupManifest) -> AppResult<()> {
    let path = manifest_path(slot);
    let payload = serde_json::to_vec_pretty(manifest)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_manifest"))?;
    write_atomic(&path, &payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_manifest")
            .with_context("path", path.display().to_string())
    })
}

pub fn read_manifest(slot: &Path) -> AppResult<BackupManifest> {
    let bytes = fs::read(manifest_path(slot))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path)
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSlotStatus {
    pub slot: &'static str,
    pub path: PathBuf,
    pub present: bool,
    pub size_bytes: u64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BackupManifest>,
}

/// Describe both slots, quick-checking each present copy read-only.
pub fn backup_status(db_path: &Path) -> Vec<BackupSlotStatus> {
    let paths = backup_paths(db_path);
    [("backup", &paths.newest), ("backup2", &paths.previous)]
        .into_iter()
        .map(|(slot, path)| {
            let meta = fs::metadata(path).ok();
            let present = meta.is_some();
            BackupSlotStatus {
                slot,
                path: path.clone(),
                present,
                size_bytes: meta.map(|m| m.len()).unwrap_or(0),
                valid: present && quick_check_file(path),
                manifest: read_manifest(path).ok(),
            }
        })
        .collect()
}

/// Newest slot whose copy still passes a quick check.
pub fn newest_valid_backup(db_path: &Path) -> Option<PathBuf> {
    backup_paths(db_path)
        .slots()
        .into_iter()
        .find(|slot| quick_check_file(slot))
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handle::{configure, open_connection};
    use rusqlite::ffi;
    use std::time::Duration;
    use tempfile::tempdir;

    fn live(dir: &Path) -> (PathBuf, Connection) {
        let path = dir.join("pantry.sqlite3");
        let conn = open_connection(&path).unwrap();
        configure(&conn, Duration::from_secs(1)).unwrap();
        conn.execute_batch("CREATE TABLE t(v INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        (path, conn)
    }

    fn count_rows(path: &Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn slots_sit_beside_the_database() {
        let paths = backup_paths(Path::new("/data/pantry.sqlite3"));
        assert_eq!(paths.newest, PathBuf::from("/data/pantry.sqlite3_backup"));
        assert_eq!(paths.previous, PathBuf::from("/data/pantry.sqlite3_backup2"));
        assert_eq!(
            manifest_path(&paths.newest),
            PathBuf::from("/data/pantry.sqlite3_backup.manifest.json")
        );
    }

    #[test]
    fn second_backup_rotates_first_into_previous_slot() {
        let dir = tempdir().unwrap();
        let (db, conn) = live(dir.path());
        let faults = FaultInjector::new();

        let first = backup_now(&conn, &db, TAG_STARTUP_OK, 2, &faults).unwrap();
        assert_eq!(first.manifest.tag, TAG_STARTUP_OK);
        assert_eq!(first.manifest.sha256, file_sha256(&first.path).unwrap());

        conn.execute("INSERT INTO t VALUES (2)", []).unwrap();
        backup_now(&conn, &db, TAG_AFTER_WRITE, 2, &faults).unwrap();

        let paths = backup_paths(&db);
        assert_eq!(count_rows(&paths.newest), 2);
        assert_eq!(count_rows(&paths.previous), 1);
        assert_eq!(read_manifest(&paths.previous).unwrap().tag, TAG_STARTUP_OK);
        assert_eq!(read_manifest(&paths.newest).unwrap().tag, TAG_AFTER_WRITE);
        assert!(!suffixed(&paths.newest, PARTIAL_SUFFIX).exists());

        let status = backup_status(&db);
        assert!(status.iter().all(|slot| slot.present && slot.valid));
    }

    #[test]
    fn failed_copy_keeps_previous_generation() {
        let dir = tempdir().unwrap();
        let (db, conn) = live(dir.path());
        let faults = FaultInjector::new();
        backup_now(&conn, &db, TAG_STARTUP_OK, 2, &faults).unwrap();

        faults.arm(FaultPoint::BackupCopy, ffi::SQLITE_IOERR);
        let err = backup_now(&conn, &db, TAG_MANUAL, 2, &faults).unwrap_err();
        assert!(err.code().starts_with("Sqlite/"), "{}", err.code());

        let paths = backup_paths(&db);
        assert!(!paths.newest.exists());
        assert!(quick_check_file(&paths.previous));
        assert_eq!(newest_valid_backup(&db), Some(paths.previous.clone()));
        assert!(!suffixed(&paths.newest, PARTIAL_SUFFIX).exists());
    }

    #[test]
    fn garbage_slot_is_not_a_valid_backup() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("pantry.sqlite3");
        let paths = backup_paths(&db);
        fs::write(&paths.newest, vec![0x11; 4096]).unwrap();
        assert_eq!(newest_valid_backup(&db), None);
        let status = backup_status(&db);
        assert!(status[0].present && !status[0].valid);
        assert!(!status[1].present);
    }
}
