#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures::future::join_all;
use pantry_store::db::faults::{FaultInjector, FaultPoint};
use pantry_store::{IngredientRow, Recipe, RecipeRepository, RowKind};
use rusqlite::ffi;
use tempfile::tempdir;

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn insert_update_delete_and_restore() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());

    let mut soup = Recipe::new("Soup", "");
    assert!(repo.insert(&soup).await);

    let listed = repo.fetch_all().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "Soup");

    soup.notes = "Add salt".into();
    assert!(repo.update(&soup).await);
    let stored = repo.get(&soup.id).await.expect("recipe stored");
    assert_eq!(stored.notes, "Add salt");
    assert!(stored.updated_at >= soup.updated_at);

    assert!(repo.soft_delete(&soup.id).await);
    assert!(repo.fetch_all().await.is_empty());
    let deleted = repo.fetch_deleted().await;
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].is_deleted());
    let tombstoned = repo.get(&soup.id).await.expect("soft-deleted recipe still readable");
    assert!(tombstoned.deleted_at.is_some());

    assert!(repo.restore(&soup.id).await);
    let restored = repo.get(&soup.id).await.expect("restored recipe");
    assert!(restored.deleted_at.is_none());
    assert!(restored.updated_at >= tombstoned.updated_at);
    assert_eq!(repo.fetch_all().await.len(), 1);
    assert!(repo.fetch_deleted().await.is_empty());
}

#[tokio::test]
async fn writes_to_unknown_ids_report_false() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());

    let ghost = Recipe::new("Ghost", "");
    assert!(!repo.update(&ghost).await);
    assert!(!repo.soft_delete(&ghost.id).await);
    assert!(!repo.restore(&ghost.id).await);
    assert!(repo.get(&ghost.id).await.is_none());
}

#[tokio::test]
async fn duplicate_insert_fails_without_recovery() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());

    let recipe = Recipe::new("Bread", "");
    assert!(repo.insert(&recipe).await);
    assert!(!repo.insert(&recipe).await);

    assert_eq!(repo.fetch_all().await.len(), 1);
    assert_eq!(repo.core().session().runtime_recoveries, 0);
}

#[tokio::test]
async fn fetch_all_orders_newest_first() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());

    let mut older = Recipe::new("Older", "");
    older.created_at = 1_000;
    let mut newer = Recipe::new("Newer", "");
    newer.created_at = 2_000;
    assert!(repo.insert(&older).await);
    assert!(repo.insert(&newer).await);

    let titles: Vec<String> = repo.fetch_all().await.into_iter().map(|r| r.title).collect();
    assert_eq!(titles, vec!["Newer".to_string(), "Older".to_string()]);
}

#[tokio::test]
async fn concurrent_inserts_all_land() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());

    let recipes: Vec<Recipe> = (0..100)
        .map(|n| Recipe::new(format!("Recipe {n}"), ""))
        .collect();
    let results = join_all(recipes.iter().map(|recipe| {
        let repo = repo.clone();
        let recipe = recipe.clone();
        async move { repo.insert(&recipe).await }
    }))
    .await;

    assert!(results.into_iter().all(|ok| ok));
    assert_eq!(repo.fetch_all().await.len(), 100);
}

#[tokio::test]
async fn ingredient_rows_keep_order_and_kind() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());
    let recipe = Recipe::new("Curry", "");
    assert!(repo.insert(&recipe).await);

    let header = IngredientRow::header("Paste");
    let rows = vec![
        IngredientRow::single("Rice", Some("200"), Some("g")),
        header.clone(),
        IngredientRow::member(header.id(), "Garlic", Some("3"), Some("cloves")),
        IngredientRow::member(header.id(), "Ginger", None, None),
    ];
    assert!(repo.replace_ingredients(&recipe.id, &rows).await);

    let stored = repo.fetch_ingredients(&recipe.id).await;
    assert_eq!(stored, rows);
    let kinds: Vec<RowKind> = stored.iter().map(IngredientRow::kind).collect();
    assert_eq!(
        kinds,
        vec![RowKind::Single, RowKind::Header, RowKind::Member, RowKind::Member]
    );
}

#[tokio::test]
async fn failed_replace_leaves_previous_rows() {
    let dir = tempdir().unwrap();
    let faults = FaultInjector::new();
    let repo = RecipeRepository::new(util::open_core(dir.path(), faults.clone()));
    let recipe = Recipe::new("Salad", "");
    assert!(repo.insert(&recipe).await);

    let original = vec![
        IngredientRow::single("Lettuce", None, None),
        IngredientRow::single("Tomato", Some("2"), None),
    ];
    assert!(repo.replace_ingredients(&recipe.id, &original).await);

    faults.arm_after(FaultPoint::IngredientInsert, 1, ffi::SQLITE_CONSTRAINT);
    let replacement = vec![
        IngredientRow::single("Cucumber", None, None),
        IngredientRow::single("Feta", None, None),
        IngredientRow::single("Olives", None, None),
    ];
    assert!(!repo.replace_ingredients(&recipe.id, &replacement).await);

    assert_eq!(repo.fetch_ingredients(&recipe.id).await, original);
    assert_eq!(faults.pending(), 0);
    assert_eq!(repo.core().session().runtime_recoveries, 0);
}

#[tokio::test]
async fn invalid_ingredient_lists_are_rejected() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());
    let recipe = Recipe::new("Stew", "");
    assert!(repo.insert(&recipe).await);

    let orphan = vec![IngredientRow::member("missing-header", "Carrot", None, None)];
    assert!(!repo.replace_ingredients(&recipe.id, &orphan).await);
    assert!(repo.fetch_ingredients(&recipe.id).await.is_empty());
}

#[tokio::test]
async fn replacing_with_empty_list_clears_rows() {
    let dir = tempdir().unwrap();
    let repo = util::open_repo(dir.path());
    let recipe = Recipe::new("Toast", "");
    assert!(repo.insert(&recipe).await);
    assert!(
        repo.replace_ingredients(&recipe.id, &[IngredientRow::single("Bread", None, None)])
            .await
    );

    assert!(repo.replace_ingredients(&recipe.id, &[]).await);
    assert!(repo.fetch_ingredients(&recipe.id).await.is_empty());
}
