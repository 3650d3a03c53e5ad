use std::path::Path;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::db::handle::open_read_only;
use crate::AppResult;

const EXPECTED_JOURNAL_MODE: &str = "wal";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DbHealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthOffender {
    pub table: String,
    pub rowid: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthReport {
    pub status: DbHealthStatus,
    pub checks: Vec<DbHealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offenders: Vec<DbHealthOffender>,
    pub schema_hash: String,
    pub app_version: String,
    pub generated_at: String,
}

impl DbHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == DbHealthStatus::Ok
    }
}

/// Lightweight structural self-test. Passes only on a single `ok` row.
pub fn quick_check(conn: &Connection) -> bool {
    run_quick_check(conn).passed
}

/// Quick check that keeps a failing statement apart from real findings.
///
/// `Ok(false)` means the engine reported damage; `Err` means the check itself
/// could not run, which the caller classifies.
pub fn try_quick_check(conn: &Connection) -> rusqlite::Result<bool> {
    let rows = pragma_rows(conn, "PRAGMA quick_check;")?;
    Ok(rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok"))
}

/// Open `path` read-only and quick-check it. Missing or unopenable files fail.
pub fn quick_check_file(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match open_read_only(path) {
        Ok(conn) => quick_check(&conn),
        Err(err) => {
            warn!(
                target: "pantry",
                event = "quick_check_open_failed",
                path = %path.display(),
                error = %err
            );
            false
        }
    }
}

pub fn run_health_checks(conn: &Connection) -> AppResult<DbHealthReport> {
    let mut checks = Vec::new();
    let mut overall_ok = true;

    let quick = run_quick_check(conn);
    overall_ok &= quick.passed;
    checks.push(quick);

    let integrity = run_integrity_check(conn);
    overall_ok &= integrity.passed;
    checks.push(integrity);

    let (fk_check, offenders) = run_foreign_key_check(conn);
    overall_ok &= fk_check.passed;
    checks.push(fk_check);

    let journal = run_journal_mode_check(conn);
    overall_ok &= journal.passed;
    checks.push(journal);

    let schema_hash = compute_schema_hash(conn)?;

    Ok(DbHealthReport {
        status: if overall_ok {
            DbHealthStatus::Ok
        } else {
            DbHealthStatus::Error
        },
        checks,
        offenders,
        schema_hash,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

fn pragma_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn run_quick_check(conn: &Connection) -> DbHealthCheck {
    run_ok_pragma(conn, "quick_check", "PRAGMA quick_check;")
}

fn run_integrity_check(conn: &Connection) -> DbHealthCheck {
    run_ok_pragma(conn, "integrity_check", "PRAGMA integrity_check(1);")
}

fn run_ok_pragma(conn: &Connection, name: &str, sql: &str) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck {
        name: name.to_string(),
        passed: true,
        duration_ms: 0,
        details: None,
    };

    match pragma_rows(conn, sql) {
        Ok(rows) => {
            let clean = rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok");
            if !clean {
                check.passed = false;
                check.details = Some(if rows.is_empty() {
                    "no result rows".to_string()
                } else {
                    rows.join("; ")
                });
            }
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("{name} failed: {err}"));
        }
    }

    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

fn run_foreign_key_check(conn: &Connection) -> (DbHealthCheck, Vec<DbHealthOffender>) {
    let start = Instant::now();
    let mut check = DbHealthCheck {
        name: "foreign_key_check".to_string(),
        passed: true,
        duration_ms: 0,
        details: None,
    };

    let rows = conn.prepare("PRAGMA foreign_key_check;").and_then(|mut stmt| {
        let rows = stmt.query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            let parent: Option<String> = row.get(2)?;
            let fkid: Option<i64> = row.get(3)?;
            Ok(offender(table, rowid, parent, fkid))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    });

    let mut offenders = Vec::new();
    match rows {
        Ok(found) => {
            offenders = found;
            if !offenders.is_empty() {
                check.passed = false;
                check.details = Some(format!("{} foreign key violation(s)", offenders.len()));
            }
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("foreign_key_check failed: {err}"));
        }
    }

    check.duration_ms = start.elapsed().as_millis() as u64;
    (check, offenders)
}

fn offender(
    table: String,
    rowid: Option<i64>,
    parent: Option<String>,
    fkid: Option<i64>,
) -> DbHealthOffender {
    let mut parts = Vec::new();
    if let Some(parent) = parent {
        parts.push(format!("missing parent '{parent}'"));
    }
    if let Some(fkid) = fkid {
        parts.push(format!("constraint #{fkid}"));
    }
    let message = if parts.is_empty() {
        "foreign key violation".to_string()
    } else {
        parts.join(", ")
    };
    DbHealthOffender {
        table,
        rowid: rowid.unwrap_or(-1),
        message,
    }
}

fn run_journal_mode_check(conn: &Connection) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck {
        name: "journal_mode".to_string(),
        passed: true,
        duration_ms: 0,
        details: None,
    };
    match conn.pragma_query_value(None, "journal_mode", |row| row.get::<_, String>(0)) {
        Ok(mode) => {
            check.passed = mode.eq_ignore_ascii_case(EXPECTED_JOURNAL_MODE);
            check.details = Some(format!("journal_mode={mode}"));
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("journal_mode query failed: {err}"));
        }
    }
    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

pub fn compute_schema_hash(conn: &Connection) -> AppResult<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE type IN ('table','index','trigger','view')
         ORDER BY type, name",
    )?;
    let mut rows = stmt.query([])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        let ty: String = row.get(0)?;
        let name: String = row.get(1)?;
        let tbl: String = row.get(2)?;
        let sql: Option<String> = row.get(3)?;

        hasher.update(ty.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(tbl.as_bytes());
        hasher.update([0]);
        if let Some(sql) = sql {
            hasher.update(sql.as_bytes());
        }
        hasher.update([0]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
