use std::collections::HashSet;

use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::id::new_uuid_v7;
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub const VALIDATION_INGREDIENTS: &str = "VALIDATION/INGREDIENTS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Recipe {
    pub id: String,
    pub title: String,
    pub notes: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Recipe {
    /// A new, unsaved recipe with a fresh id and both timestamps set to now.
    pub fn new(title: impl Into<String>, notes: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: new_uuid_v7(),
            title: title.into(),
            notes: notes.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Maps `id, title, notes, created_at, updated_at, deleted_at` in that order.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            notes: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            deleted_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Single,
    Header,
    Member,
}

impl RowKind {
    pub fn code(self) -> i64 {
        match self {
            RowKind::Single => 0,
            RowKind::Header => 1,
            RowKind::Member => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RowKind::Single),
            1 => Some(RowKind::Header),
            2 => Some(RowKind::Member),
            _ => None,
        }
    }
}

/// One line of a recipe's ingredient list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngredientRow {
    Single {
        id: String,
        name: String,
        #[serde(default)]
        quantity: Option<String>,
        #[serde(default)]
        unit: Option<String>,
    },
    Header {
        id: String,
        title: String,
    },
    Member {
        id: String,
        group_id: String,
        name: String,
        #[serde(default)]
        quantity: Option<String>,
        #[serde(default)]
        unit: Option<String>,
    },
}

impl IngredientRow {
    pub fn single(name: impl Into<String>, quantity: Option<&str>, unit: Option<&str>) -> Self {
        IngredientRow::Single {
            id: new_uuid_v7(),
            name: name.into(),
            quantity: quantity.map(str::to_string),
            unit: unit.map(str::to_string),
        }
    }

    pub fn header(title: impl Into<String>) -> Self {
        IngredientRow::Header {
            id: new_uuid_v7(),
            title: title.into(),
        }
    }

    pub fn member(
        group_id: impl Into<String>,
        name: impl Into<String>,
        quantity: Option<&str>,
        unit: Option<&str>,
    ) -> Self {
        IngredientRow::Member {
            id: new_uuid_v7(),
            group_id: group_id.into(),
            name: name.into(),
            quantity: quantity.map(str::to_string),
            unit: unit.map(str::to_string),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            IngredientRow::Single { id, .. }
            | IngredientRow::Header { id, .. }
            | IngredientRow::Member { id, .. } => id,
        }
    }

    pub fn kind(&self) -> RowKind {
        match self {
            IngredientRow::Single { .. } => RowKind::Single,
            IngredientRow::Header { .. } => RowKind::Header,
            IngredientRow::Member { .. } => RowKind::Member,
        }
    }
}

/// Flat, nullable-column shape of an ingredient row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientRecord {
    pub id: String,
    pub parent_id: String,
    pub kind: i64,
    pub order_index: i64,
    pub group_id: Option<String>,
    pub title: Option<String>,
    pub name: Option<String>,
    pub quantity: Option<String>,
    pub unit: Option<String>,
}

impl IngredientRecord {
    pub fn from_row(parent_id: &str, order_index: i64, row: &IngredientRow) -> Self {
        let mut record = IngredientRecord {
            id: row.id().to_string(),
            parent_id: parent_id.to_string(),
            kind: row.kind().code(),
            order_index,
            group_id: None,
            title: None,
            name: None,
            quantity: None,
            unit: None,
        };
        match row {
            IngredientRow::Single {
                name, quantity, unit, ..
            } => {
                record.name = Some(name.clone());
                record.quantity = quantity.clone();
                record.unit = unit.clone();
            }
            IngredientRow::Header { title, .. } => {
                record.title = Some(title.clone());
            }
            IngredientRow::Member {
                group_id,
                name,
                quantity,
                unit,
                ..
            } => {
                record.group_id = Some(group_id.clone());
                record.name = Some(name.clone());
                record.quantity = quantity.clone();
                record.unit = unit.clone();
            }
        }
        record
    }

    /// Rebuild the typed row. A member that lost its group reads back as a single row.
    pub fn into_row(self) -> AppResult<IngredientRow> {
        let kind = RowKind::from_code(self.kind).ok_or_else(|| {
            AppError::new("DB/UNKNOWN_ROW_KIND", "Ingredient row has an unknown kind")
                .with_context("id", self.id.clone())
                .with_context("kind", self.kind.to_string())
        })?;
        let row = match (kind, self.group_id) {
            (RowKind::Header, _) => IngredientRow::Header {
                id: self.id,
                title: self.title.unwrap_or_default(),
            },
            (RowKind::Member, Some(group_id)) => IngredientRow::Member {
                id: self.id,
                group_id,
                name: self.name.unwrap_or_default(),
                quantity: self.quantity,
                unit: self.unit,
            },
            (RowKind::Single, _) | (RowKind::Member, None) => IngredientRow::Single {
                id: self.id,
                name: self.name.unwrap_or_default(),
                quantity: self.quantity,
                unit: self.unit,
            },
        };
        Ok(row)
    }

    /// Maps the columns of `ingredient_rows` in table order.
    pub(crate) fn from_sql_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            kind: row.get(2)?,
            order_index: row.get(3)?,
            group_id: row.get(4)?,
            title: row.get(5)?,
            name: row.get(6)?,
            quantity: row.get(7)?,
            unit: row.get(8)?,
        })
    }
}

/// Ids must be unique and every member must point at a header in the same set.
pub fn validate_rows(rows: &[IngredientRow]) -> AppResult<()> {
    let mut ids = HashSet::new();
    let mut headers = HashSet::new();
    for row in rows {
        if !ids.insert(row.id()) {
            return Err(
                AppError::new(VALIDATION_INGREDIENTS, "Duplicate ingredient row id")
                    .with_context("id", row.id()),
            );
        }
        if let IngredientRow::Header { id, .. } = row {
            headers.insert(id.as_str());
        }
    }
    for row in rows {
        if let IngredientRow::Member { id, group_id, .. } = row {
            if !headers.contains(group_id.as_str()) {
                return Err(AppError::new(
                    VALIDATION_INGREDIENTS,
                    "Group member references a header that is not in the set",
                )
                .with_context("id", id.as_str())
                .with_context("group_id", group_id.as_str()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_recipe_has_matching_timestamps() {
        let recipe = Recipe::new("Soup", "");
        assert_eq!(recipe.created_at, recipe.updated_at);
        assert!(!recipe.is_deleted());
        assert_eq!(recipe.id.len(), 36);
    }

    #[test]
    fn flat_record_keeps_only_relevant_fields() {
        let header = IngredientRow::header("Sauce");
        let member = IngredientRow::member(header.id(), "Tomato", Some("2"), None);

        let header_record = IngredientRecord::from_row("r1", 0, &header);
        assert_eq!(header_record.kind, 1);
        assert_eq!(header_record.title.as_deref(), Some("Sauce"));
        assert!(header_record.name.is_none());

        let member_record = IngredientRecord::from_row("r1", 1, &member);
        assert_eq!(member_record.kind, 2);
        assert_eq!(member_record.group_id.as_deref(), Some(header.id()));
        assert!(member_record.title.is_none());

        assert_eq!(member_record.into_row().unwrap(), member);
        assert_eq!(header_record.into_row().unwrap(), header);
    }

    #[test]
    fn orphaned_member_reads_as_single() {
        let record = IngredientRecord {
            id: "x".into(),
            parent_id: "r1".into(),
            kind: 2,
            order_index: 0,
            group_id: None,
            title: None,
            name: Some("Salt".into()),
            quantity: None,
            unit: None,
        };
        assert!(matches!(record.into_row().unwrap(), IngredientRow::Single { .. }));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let record = IngredientRecord {
            id: "x".into(),
            parent_id: "r1".into(),
            kind: 7,
            order_index: 0,
            group_id: None,
            title: None,
            name: None,
            quantity: None,
            unit: None,
        };
        assert_eq!(record.into_row().unwrap_err().code(), "DB/UNKNOWN_ROW_KIND");
    }

    #[test]
    fn validation_catches_duplicates_and_dangling_members() {
        let header = IngredientRow::header("Dough");
        let ok = vec![
            header.clone(),
            IngredientRow::member(header.id(), "Flour", Some("500"), Some("g")),
            IngredientRow::single("Salt", None, None),
        ];
        assert!(validate_rows(&ok).is_ok());

        let dangling = vec![IngredientRow::member("nope", "Flour", None, None)];
        assert_eq!(
            validate_rows(&dangling).unwrap_err().code(),
            VALIDATION_INGREDIENTS
        );

        let duplicate = vec![header.clone(), header];
        assert_eq!(
            validate_rows(&duplicate).unwrap_err().code(),
            VALIDATION_INGREDIENTS
        );
    }

    #[test]
    fn rows_serialize_with_kind_tag() {
        let row = IngredientRow::single("Egg", Some("2"), None);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["kind"], "single");
        assert_eq!(json["name"], "Egg");
    }
}
