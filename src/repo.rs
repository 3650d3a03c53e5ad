//! Recipe CRUD on top of the storage core.
//!
//! Reads degrade to empty results and writes to `false`; no storage error
//! reaches the caller. Every call is one unit on the access serializer.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::warn;

use crate::db::faults::{FaultInjector, FaultPoint};
use crate::model::{validate_rows, IngredientRecord, IngredientRow, Recipe};
use crate::state::StorageCore;
use crate::time::now_ms;

const RECIPE_COLUMNS: &str = "id, title, notes, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct RecipeRepository {
    core: Arc<StorageCore>,
}

impl RecipeRepository {
    pub fn new(core: Arc<StorageCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<StorageCore> {
        &self.core
    }

    /// Live recipes, newest first.
    pub async fn fetch_all(&self) -> Vec<Recipe> {
        self.core
            .run(|core| {
                core.execute("fetch_all", |conn, faults| {
                    query_recipes(
                        conn,
                        faults,
                        &format!(
                            "SELECT {RECIPE_COLUMNS} FROM recipes
                             WHERE deleted_at IS NULL
                             ORDER BY created_at DESC, id DESC"
                        ),
                    )
                })
            })
            .await
            .unwrap_or_default()
    }

    /// Soft-deleted recipes, most recently deleted first.
    pub async fn fetch_deleted(&self) -> Vec<Recipe> {
        self.core
            .run(|core| {
                core.execute("fetch_deleted", |conn, faults| {
                    query_recipes(
                        conn,
                        faults,
                        &format!(
                            "SELECT {RECIPE_COLUMNS} FROM recipes
                             WHERE deleted_at IS NOT NULL
                             ORDER BY deleted_at DESC, id DESC"
                        ),
                    )
                })
            })
            .await
            .unwrap_or_default()
    }

    /// One recipe by id, soft-deleted or not.
    pub async fn get(&self, id: &str) -> Option<Recipe> {
        let id = id.to_string();
        self.core
            .run(move |core| {
                core.execute("get", |conn, faults| {
                    faults.check(FaultPoint::RecipeRead)?;
                    conn.query_row(
                        &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE id = ?1"),
                        [&id],
                        Recipe::from_row,
                    )
                    .optional()
                })
            })
            .await
            .flatten()
    }

    /// Persist a new recipe. Returns whether it was committed.
    pub async fn insert(&self, recipe: &Recipe) -> bool {
        let recipe = recipe.clone();
        self.core
            .run(move |core| {
                let written = core.execute("insert", |conn, faults| {
                    faults.check(FaultPoint::RecipeWrite)?;
                    conn.execute(
                        "INSERT INTO recipes (id, title, notes, created_at, updated_at, deleted_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            recipe.id,
                            recipe.title,
                            recipe.notes,
                            recipe.created_at,
                            recipe.updated_at,
                            recipe.deleted_at
                        ],
                    )
                });
                committed(core, written)
            })
            .await
    }

    /// Update title and notes, bumping `updated_at`. Returns whether a row changed.
    pub async fn update(&self, recipe: &Recipe) -> bool {
        let recipe = recipe.clone();
        self.core
            .run(move |core| {
                let written = core.execute("update", |conn, faults| {
                    faults.check(FaultPoint::RecipeWrite)?;
                    conn.execute(
                        "UPDATE recipes SET title = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
                        params![recipe.title, recipe.notes, now_ms(), recipe.id],
                    )
                });
                committed(core, written)
            })
            .await
    }

    pub async fn soft_delete(&self, id: &str) -> bool {
        self.set_deleted(id, true).await
    }

    pub async fn restore(&self, id: &str) -> bool {
        self.set_deleted(id, false).await
    }

    async fn set_deleted(&self, id: &str, deleted: bool) -> bool {
        let id = id.to_string();
        let context = if deleted { "soft_delete" } else { "restore" };
        self.core
            .run(move |core| {
                let written = core.execute(context, |conn, faults| {
                    faults.check(FaultPoint::RecipeWrite)?;
                    let now = now_ms();
                    if deleted {
                        conn.execute(
                            "UPDATE recipes SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )
                    } else {
                        conn.execute(
                            "UPDATE recipes SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )
                    }
                });
                committed(core, written)
            })
            .await
    }

    /// Replace the whole ingredient list of `parent_id` in one transaction.
    ///
    /// Caller order becomes the stored order. Any failing step rolls the
    /// transaction back, leaving the previous list untouched.
    pub async fn replace_ingredients(&self, parent_id: &str, rows: &[IngredientRow]) -> bool {
        if let Err(err) = validate_rows(rows) {
            warn!(
                target: "pantry",
                event = "ingredients_rejected",
                parent_id,
                code = %err.code(),
                error = %err
            );
            return false;
        }
        let records: Vec<IngredientRecord> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| IngredientRecord::from_row(parent_id, index as i64, row))
            .collect();
        let parent_id = parent_id.to_string();
        self.core
            .run(move |core| {
                let written = core.execute("replace_ingredients", |conn, faults| {
                    replace_in_tx(conn, faults, &parent_id, &records)
                });
                committed(core, written.map(|_| 1))
            })
            .await
    }

    /// Ingredient rows of `parent_id` in stored order.
    pub async fn fetch_ingredients(&self, parent_id: &str) -> Vec<IngredientRow> {
        let parent_id = parent_id.to_string();
        let records = self
            .core
            .run(move |core| {
                core.execute("fetch_ingredients", |conn, faults| {
                    faults.check(FaultPoint::RecipeRead)?;
                    let mut stmt = conn.prepare(
                        "SELECT id, parent_id, kind, order_index, group_id, title, name, quantity, unit
                         FROM ingredient_rows WHERE parent_id = ?1 ORDER BY order_index",
                    )?;
                    let rows = stmt.query_map([&parent_id], IngredientRecord::from_sql_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
            })
            .await
            .unwrap_or_default();

        records
            .into_iter()
            .filter_map(|record| match record.into_row() {
                Ok(row) => Some(row),
                Err(err) => {
                    warn!(target: "pantry", event = "ingredient_row_skipped", error = %err);
                    None
                }
            })
            .collect()
    }
}

/// A write counts when it touched a row; committed writes queue a backup.
fn committed(core: &Arc<StorageCore>, written: Option<usize>) -> bool {
    match written {
        Some(changed) if changed > 0 => {
            core.schedule_backup();
            true
        }
        _ => false,
    }
}

fn query_recipes(
    conn: &Connection,
    faults: &FaultInjector,
    sql: &str,
) -> rusqlite::Result<Vec<Recipe>> {
    faults.check(FaultPoint::RecipeRead)?;
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], Recipe::from_row)?;
    rows.collect()
}

fn replace_in_tx(
    conn: &Connection,
    faults: &FaultInjector,
    parent_id: &str,
    records: &[IngredientRecord],
) -> rusqlite::Result<()> {
    // Dropping the transaction without commit rolls it back.
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    faults.check(FaultPoint::IngredientDelete)?;
    tx.execute(
        "DELETE FROM ingredient_rows WHERE parent_id = ?1",
        [parent_id],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO ingredient_rows
                (id, parent_id, kind, order_index, group_id, title, name, quantity, unit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for record in records {
            faults.check(FaultPoint::IngredientInsert)?;
            insert.execute(params![
                record.id,
                record.parent_id,
                record.kind,
                record.order_index,
                record.group_id,
                record.title,
                record.name,
                record.quantity,
                record.unit
            ])?;
        }
    }
    tx.commit()
}
