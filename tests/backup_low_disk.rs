#![allow(clippy::unwrap_used, clippy::expect_used)]

use pantry_store::db::backup::{self, FAKE_FREE_BYTES_ENV, TAG_MANUAL};
use pantry_store::db::faults::FaultInjector;
use pantry_store::{Recipe, RecipeRepository};
use tempfile::tempdir;

#[path = "util.rs"]
mod util;

// Own test binary: the free-space override is process-wide.
#[tokio::test]
async fn low_disk_skips_backup_without_touching_storage() {
    std::env::set_var(FAKE_FREE_BYTES_ENV, "0");

    let dir = tempdir().unwrap();
    let repo = RecipeRepository::new(util::open_core(dir.path(), FaultInjector::new()));
    assert!(repo.core().status().is_ready());
    assert!(repo.core().session().last_backup.is_none());

    assert!(repo.insert(&Recipe::new("Soup", "")).await);
    util::flush(repo.core());

    let err = repo.core().backup_now(TAG_MANUAL).unwrap_err();
    assert_eq!(err.code(), "DB_BACKUP/LOW_DISK");

    let slots = backup::backup_status(repo.core().db_path());
    assert!(slots.iter().all(|slot| !slot.present));
    assert_eq!(repo.fetch_all().await.len(), 1);
    assert_eq!(repo.core().session().runtime_recoveries, 0);

    std::env::remove_var(FAKE_FREE_BYTES_ENV);
}
