//! Error types for the consolidation engine.
//!
//! `ApplyFailure` is per change and never aborts a batch. `ConsolidationError`
//! is what a whole batch returns when it cannot run at all.

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::EntityStatus;
use crate::models::ActionKind;
use crate::pipeline::oracle::ExtractionFailure;

#[derive(Error, Debug)]
pub enum ApplyFailure {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Entity {0} no longer exists")]
    StaleEntity(Uuid),

    #[error("Cannot {action} entity {entity_id} in status {from}")]
    InvalidTransition {
        entity_id: Uuid,
        from: EntityStatus,
        action: ActionKind,
    },
}

impl ApplyFailure {
    /// Map a store error on `id`, turning a missing row into `StaleEntity`.
    pub(crate) fn from_store(id: Uuid, err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { .. } => Self::StaleEntity(id),
            other => Self::Store(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsolidationError {
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionFailure),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Consolidation task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsolidationError {
    /// Whether resubmitting the same request may succeed. A failed batch makes
    /// no entity writes, so a retry starts from the same state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Extraction(_) | Self::Task(_) => true,
            Self::Database(DatabaseError::Sqlite(_)) => true,
            Self::Database(_) | Self::InvalidRequest(_) | Self::Io(_) => false,
        }
    }
}
