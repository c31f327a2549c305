//! Storage boundary of the consolidation engine.

use uuid::Uuid;

use super::types::BatchSummary;
use crate::db::DatabaseError;
use crate::models::enums::EntityType;
use crate::models::{CanonicalEntity, EntityPatch, VisitHistoryEntry};

/// Reads and writes canonical entities for one patient and entity type.
///
/// Every method is atomic: it either fully applies or leaves the store
/// untouched. The store enforces storage constraints (unique source key per
/// entity, foreign keys); lifecycle rules live in the writer.
pub trait CanonicalStore {
    /// All entities of the type, superseded ones included, each with its
    /// ordered visit history.
    fn load_existing(
        &self,
        patient_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<CanonicalEntity>, DatabaseError>;

    /// Insert a new entity together with its initial visits.
    fn apply_create(&self, entity: &CanonicalEntity) -> Result<Uuid, DatabaseError>;

    /// Fill attributes, change status and upsert one visit. A missing entity
    /// is `NotFound`.
    fn apply_update(&self, id: &Uuid, patch: &EntityPatch) -> Result<(), DatabaseError>;

    fn append_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError>;

    /// Overwrite the entry with the same (source_type, source_ref).
    fn replace_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError>;

    /// Create `successor` and mark `old_id` superseded by it, pointers both
    /// ways, in one transaction. `predecessor_visit` first overwrites the
    /// predecessor's entry with the same source key.
    fn supersede(
        &self,
        old_id: &Uuid,
        successor: &CanonicalEntity,
        predecessor_visit: Option<&VisitHistoryEntry>,
    ) -> Result<Uuid, DatabaseError>;

    /// Persist the per-change audit trail of a finished batch.
    fn record_batch(&self, summary: &BatchSummary) -> Result<(), DatabaseError>;
}
