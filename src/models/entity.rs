use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{EntityStatus, EntityType, SourceType};

/// Key attributes shared by every entity type.
///
/// `title` carries the problem name, drug name, imaging modality or lab test
/// name depending on the entity type. `body_region` is only meaningful for
/// imaging; `effective_date` is the onset, start, study or collection date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<NaiveDate>,
}

/// One dated, source-attributed annotation on a canonical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitHistoryEntry {
    pub date: NaiveDate,
    pub note: String,
    pub source_type: SourceType,
    pub source_ref: String,
    pub confidence: f32,
    pub reasoning: String,
}

impl VisitHistoryEntry {
    /// Identity of the source event that produced this entry.
    pub fn source_key(&self) -> (SourceType, &str) {
        (self.source_type, self.source_ref.as_str())
    }

    pub fn same_source(&self, other: &VisitHistoryEntry) -> bool {
        self.source_key() == other.source_key()
    }
}

/// The stored, deduplicated representation of one clinical fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: Uuid,
    pub patient_id: String,
    pub entity_type: EntityType,
    pub attributes: EntityAttributes,
    pub status: EntityStatus,
    pub visit_history: Vec<VisitHistoryEntry>,
    pub superseded_by: Option<Uuid>,
    pub supersedes: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CanonicalEntity {
    /// Build a fresh entity with a single initial visit.
    pub fn new(
        patient_id: &str,
        entity_type: EntityType,
        attributes: EntityAttributes,
        status: EntityStatus,
        first_visit: VisitHistoryEntry,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id: patient_id.to_string(),
            entity_type,
            attributes,
            status,
            visit_history: vec![first_visit],
            superseded_by: None,
            supersedes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The last `n` entries of the (date-ordered) history.
    pub fn recent_visits(&self, n: usize) -> &[VisitHistoryEntry] {
        let start = self.visit_history.len().saturating_sub(n);
        &self.visit_history[start..]
    }
}

/// Partial update applied by the store in one transaction.
///
/// Attribute fields only ever fill gaps: the writer never sets a field that
/// already carries a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub code: Option<String>,
    pub body_region: Option<String>,
    pub detail: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub status: Option<EntityStatus>,
    pub visit: Option<VisitUpsert>,
}

impl EntityPatch {
    /// True when the patch touches entity columns (not just the visit list).
    pub fn has_entity_changes(&self) -> bool {
        self.code.is_some()
            || self.body_region.is_some()
            || self.detail.is_some()
            || self.effective_date.is_some()
            || self.status.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_entity_changes() && self.visit.is_none()
    }

    /// Apply the patch to an in-memory copy, mirroring what the store writes.
    pub fn apply_to(&self, entity: &mut CanonicalEntity) {
        if let Some(code) = &self.code {
            entity.attributes.code = Some(code.clone());
        }
        if let Some(region) = &self.body_region {
            entity.attributes.body_region = Some(region.clone());
        }
        if let Some(detail) = &self.detail {
            entity.attributes.detail = Some(detail.clone());
        }
        if let Some(date) = self.effective_date {
            entity.attributes.effective_date = Some(date);
        }
        if let Some(status) = self.status {
            entity.status = status;
        }
    }
}

/// How a visit entry is written: new row or in-place replacement of the row
/// with the same source key.
#[derive(Debug, Clone, PartialEq)]
pub enum VisitUpsert {
    Append(VisitHistoryEntry),
    Replace(VisitHistoryEntry),
}

impl VisitUpsert {
    pub fn entry(&self) -> &VisitHistoryEntry {
        match self {
            Self::Append(entry) | Self::Replace(entry) => entry,
        }
    }
}
