//! Self-healing storage for a single local recipe database.
//!
//! [`StorageCore`] owns the SQLite connection and funnels every unit of work
//! through one serialized worker. Damage found at open or mid-session is
//! handled by quarantining the file, recreating it, and salvaging what the old
//! file still holds. [`RecipeRepository`] is the CRUD surface built on top.

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod logging;
pub mod model;
pub mod repo;
pub mod settings;
pub mod state;
pub mod time;

pub use config::StorageConfig;
pub use error::{AppError, AppResult, StorageError};
pub use logging::{init_file_logging, init_logging};
pub use model::{IngredientRow, Recipe, RowKind};
pub use repo::RecipeRepository;
pub use settings::SettingsHandle;
pub use state::{SessionReport, StorageCore, StorageStatus};
