//! Chart persistence: SQLite connection setup, migrations and repositories.

pub mod repository;
pub mod sqlite;

pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row addressed by id is gone (stale reference or concurrent removal).
    #[error("No {entity_type} row for {id}")]
    NotFound { entity_type: String, id: String },

    /// Stored text does not name a known enum variant.
    #[error("Unrecognised {field} value '{value}'")]
    InvalidEnum { field: String, value: String },

    #[error("Schema migration to v{version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    /// Lineage or uniqueness rule the store enforces itself.
    #[error("Chart constraint violated: {0}")]
    ConstraintViolation(String),
}
