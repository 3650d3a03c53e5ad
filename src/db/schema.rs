//! Table definitions and the version-gated additive migrations.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::settings::SettingsHandle;
use crate::AppResult;

/// Version 1: base tables. Version 2: `recipes.deleted_at`.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

pub const RECIPES_TABLE: &str = "recipes";
pub const INGREDIENTS_TABLE: &str = "ingredient_rows";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS recipes (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    notes TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE TABLE IF NOT EXISTS ingredient_rows (
    id TEXT PRIMARY KEY,
    parent_id TEXT NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
    kind INTEGER NOT NULL CHECK (kind IN (0, 1, 2)),
    order_index INTEGER NOT NULL,
    group_id TEXT,
    title TEXT,
    name TEXT,
    quantity TEXT,
    unit TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS ingredient_rows_parent_order_idx
    ON ingredient_rows(parent_id, order_index);
CREATE INDEX IF NOT EXISTS recipes_created_idx ON recipes(created_at);
";

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    for name in names {
        if name?.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Create both tables when absent. Safe on every startup.
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    ensure_deleted_at_column(conn)?;
    Ok(())
}

/// Add `recipes.deleted_at` when a pre-v2 table lacks it. Returns whether it was added.
pub fn ensure_deleted_at_column(conn: &Connection) -> rusqlite::Result<bool> {
    if has_column(conn, RECIPES_TABLE, "deleted_at")? {
        return Ok(false);
    }
    conn.execute_batch("ALTER TABLE recipes ADD COLUMN deleted_at INTEGER;")?;
    info!(
        target: "pantry",
        event = "schema_column_added",
        table = RECIPES_TABLE,
        column = "deleted_at"
    );
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// No version was stored; the marker now records the current version.
    Initialized { version: u32 },
    Upgraded { from: u32, to: u32 },
    Current { version: u32 },
    /// The marker is newer than this build; nothing is touched.
    Ahead { stored: u32, current: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationStep {
    AddDeletedAt,
}

impl MigrationStep {
    fn introduced_in(self) -> u32 {
        match self {
            MigrationStep::AddDeletedAt => 2,
        }
    }

    fn apply(self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            MigrationStep::AddDeletedAt => ensure_deleted_at_column(conn).map(|_| ()),
        }
    }
}

const STEPS: [MigrationStep; 1] = [MigrationStep::AddDeletedAt];

fn plan_migration(stored: u32, current: u32) -> Vec<MigrationStep> {
    STEPS
        .into_iter()
        .filter(|step| step.introduced_in() > stored && step.introduced_in() <= current)
        .collect()
}

/// Bring the schema up to `current` and record it in the settings store.
pub fn migrate(
    conn: &Connection,
    settings: &SettingsHandle,
    current: u32,
) -> AppResult<MigrationOutcome> {
    ensure_schema(conn)?;

    let outcome = match settings.schema_version() {
        None => {
            settings.set_schema_version(current)?;
            MigrationOutcome::Initialized { version: current }
        }
        Some(stored) if stored < current => {
            for step in plan_migration(stored, current) {
                step.apply(conn)?;
            }
            settings.set_schema_version(current)?;
            MigrationOutcome::Upgraded {
                from: stored,
                to: current,
            }
        }
        Some(stored) if stored == current => MigrationOutcome::Current { version: current },
        Some(stored) => MigrationOutcome::Ahead { stored, current },
    };

    info!(target: "pantry", event = "schema_migrated", outcome = ?outcome);
    Ok(outcome)
}
