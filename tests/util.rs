#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;
use std::sync::Arc;

use pantry_store::db::faults::FaultInjector;
use pantry_store::{RecipeRepository, SettingsHandle, StorageConfig, StorageCore};

/// Core over `dir` with a settings file that survives reopening.
pub fn open_core(dir: &Path, faults: FaultInjector) -> Arc<StorageCore> {
    let config = StorageConfig::in_dir(dir);
    let settings = SettingsHandle::json_file(&config.settings_path);
    StorageCore::open_with(config, settings, faults).expect("start storage core")
}

pub fn open_repo(dir: &Path) -> RecipeRepository {
    RecipeRepository::new(open_core(dir, FaultInjector::new()))
}

/// Wait until everything queued on the storage worker has run.
pub fn flush(core: &Arc<StorageCore>) {
    core.run_sync(|_| ());
}

pub fn count_recipes(path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(path).expect("open database copy");
    conn.query_row("SELECT COUNT(*) FROM recipes", [], |row| row.get(0))
        .expect("count recipes")
}
