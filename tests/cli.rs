#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use pantry_store::config::FAKE_APPDATA_ENV;
use pantry_store::db::health::{DbHealthReport, DbHealthStatus};
use pantry_store::Recipe;
use tempfile::tempdir;

fn pantry(appdata: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("pantry")?;
    cmd.env(FAKE_APPDATA_ENV, appdata).env("PANTRY_LOG", "off");
    Ok(cmd)
}

#[test]
fn db_status_reports_ok_on_fresh_store() -> Result<()> {
    let tmp = tempdir()?;
    let appdata = tmp.path().join("appdata");

    let output = pantry(&appdata)?.args(["db", "status", "--json"]).output()?;
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let report: DbHealthReport = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report.status, DbHealthStatus::Ok);
    assert!(report.checks.iter().all(|check| check.passed));
    assert!(report.offenders.is_empty());

    let table = pantry(&appdata)?.args(["db", "status"]).output()?;
    assert!(table.status.success());
    let stdout = String::from_utf8_lossy(&table.stdout);
    assert!(stdout.contains("Database health report"), "{stdout}");
    assert!(stdout.contains("quick_check"), "{stdout}");
    Ok(())
}

#[test]
fn db_backup_prints_location() -> Result<()> {
    let tmp = tempdir()?;
    let appdata = tmp.path().join("appdata");

    let output = pantry(&appdata)?.args(["db", "backup"]).output()?;
    assert!(
        output.status.success(),
        "backup failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout.lines().last().unwrap_or_default();
    assert!(last.starts_with("Backup stored at"), "unexpected stdout: {stdout}");
    let location = last.trim_start_matches("Backup stored at").trim();
    assert!(Path::new(location).exists(), "missing backup at {location}");

    let slots = pantry(&appdata)?.args(["db", "backups", "--json"]).output()?;
    assert!(slots.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&slots.stdout)?;
    let slots = parsed.as_array().expect("slot list");
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["manifest"]["tag"], "manual");
    assert_eq!(slots[1]["manifest"]["tag"], "startup_ok");
    Ok(())
}

#[test]
fn recipes_add_then_list() -> Result<()> {
    let tmp = tempdir()?;
    let appdata = tmp.path().join("appdata");

    let added = pantry(&appdata)?
        .args(["recipes", "add", "Soup", "--notes", "Add salt"])
        .output()?;
    assert!(
        added.status.success(),
        "add failed: {}",
        String::from_utf8_lossy(&added.stderr)
    );
    let id = String::from_utf8_lossy(&added.stdout).trim().to_string();
    assert_eq!(id.len(), 36);

    let listed = pantry(&appdata)?
        .args(["recipes", "list", "--json"])
        .output()?;
    assert!(listed.status.success());
    let recipes: Vec<Recipe> = serde_json::from_slice(&listed.stdout)?;
    assert_eq!(recipes.len(), 1);
    assert_eq!(recipes[0].id, id);
    assert_eq!(recipes[0].title, "Soup");
    assert_eq!(recipes[0].notes, "Add salt");
    Ok(())
}

#[test]
fn quarantine_lists_replaced_garbage_file() -> Result<()> {
    let tmp = tempdir()?;
    let appdata = tmp.path().join("appdata");
    std::fs::create_dir_all(&appdata)?;
    std::fs::write(
        appdata.join(pantry_store::config::DB_FILE_NAME),
        b"definitely not sqlite".repeat(512),
    )?;

    let status = pantry(&appdata)?.args(["db", "status"]).output()?;
    assert!(
        status.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&status.stderr)
    );

    let listed = pantry(&appdata)?
        .args(["db", "quarantine", "--json"])
        .output()?;
    assert!(listed.status.success());
    let entries: serde_json::Value = serde_json::from_slice(&listed.stdout)?;
    let entries = entries.as_array().expect("entry list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["disposition"], "NoRecipes");
    Ok(())
}
