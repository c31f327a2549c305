//! Shared fixtures for consolidation tests.

use rusqlite::Connection;
use uuid::Uuid;

use super::store::SqliteCanonicalStore;
use super::traits::CanonicalStore;
use super::types::BatchSummary;
use crate::db::DatabaseError;
use crate::models::enums::EntityType;
use crate::models::{CanonicalEntity, EntityPatch, VisitHistoryEntry};
use crate::pipeline::oracle::{LlmExtractionOracle, MockLlmClient, ParseOptions};

pub(crate) fn mock_oracle(response: &str) -> LlmExtractionOracle<MockLlmClient> {
    LlmExtractionOracle::new(MockLlmClient::new(response), "test-model", ParseOptions::default())
}

pub(crate) fn failing_oracle() -> LlmExtractionOracle<MockLlmClient> {
    LlmExtractionOracle::new(
        MockLlmClient::failing("http://localhost:11434"),
        "test-model",
        ParseOptions::default(),
    )
}

/// SQLite store that refuses to create entities with one title, and can
/// refuse the audit write.
pub(crate) struct FaultyStore<'c> {
    inner: SqliteCanonicalStore<'c>,
    poison_title: String,
    fail_audit: bool,
}

impl<'c> FaultyStore<'c> {
    pub(crate) fn new(conn: &'c Connection, poison_title: &str) -> Self {
        Self {
            inner: SqliteCanonicalStore::new(conn),
            poison_title: poison_title.to_string(),
            fail_audit: false,
        }
    }

    pub(crate) fn failing_audit(conn: &'c Connection) -> Self {
        Self {
            inner: SqliteCanonicalStore::new(conn),
            poison_title: String::new(),
            fail_audit: true,
        }
    }

    fn injected() -> DatabaseError {
        DatabaseError::ConstraintViolation("injected failure".into())
    }
}

impl CanonicalStore for FaultyStore<'_> {
    fn load_existing(
        &self,
        patient_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<CanonicalEntity>, DatabaseError> {
        self.inner.load_existing(patient_id, entity_type)
    }

    fn apply_create(&self, entity: &CanonicalEntity) -> Result<Uuid, DatabaseError> {
        if !self.poison_title.is_empty() && entity.attributes.title == self.poison_title {
            return Err(Self::injected());
        }
        self.inner.apply_create(entity)
    }

    fn apply_update(&self, id: &Uuid, patch: &EntityPatch) -> Result<(), DatabaseError> {
        self.inner.apply_update(id, patch)
    }

    fn append_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError> {
        self.inner.append_visit(id, entry)
    }

    fn replace_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError> {
        self.inner.replace_visit(id, entry)
    }

    fn supersede(
        &self,
        old_id: &Uuid,
        successor: &CanonicalEntity,
        predecessor_visit: Option<&VisitHistoryEntry>,
    ) -> Result<Uuid, DatabaseError> {
        self.inner.supersede(old_id, successor, predecessor_visit)
    }

    fn record_batch(&self, summary: &BatchSummary) -> Result<(), DatabaseError> {
        if self.fail_audit {
            return Err(Self::injected());
        }
        self.inner.record_batch(summary)
    }
}
