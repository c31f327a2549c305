//! SQLite-backed `CanonicalStore`.

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use super::traits::CanonicalStore;
use super::types::{BatchSummary, ChangeReport};
use crate::db::repository::entity::TIMESTAMP_FORMAT;
use crate::db::repository::{
    ensure_entity_exists, get_entities_for_patient, insert_audit_rows, insert_entity,
    insert_visit, mark_superseded, replace_visit, update_entity, AuditRow,
};
use crate::db::DatabaseError;
use crate::models::enums::EntityType;
use crate::models::{CanonicalEntity, EntityPatch, VisitHistoryEntry, VisitUpsert};

/// Gateway over one SQLite connection. Multi-statement operations run in
/// their own transaction.
pub struct SqliteCanonicalStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCanonicalStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

impl CanonicalStore for SqliteCanonicalStore<'_> {
    fn load_existing(
        &self,
        patient_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<CanonicalEntity>, DatabaseError> {
        get_entities_for_patient(self.conn, patient_id, entity_type)
    }

    fn apply_create(&self, entity: &CanonicalEntity) -> Result<Uuid, DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        insert_entity(&tx, entity)?;
        for entry in &entity.visit_history {
            insert_visit(&tx, &entity.id, entry)?;
        }
        tx.commit()?;
        Ok(entity.id)
    }

    fn apply_update(&self, id: &Uuid, patch: &EntityPatch) -> Result<(), DatabaseError> {
        let now = Utc::now().naive_utc();
        let tx = self.conn.unchecked_transaction()?;
        // Always runs: bumps updated_at and reports a missing row as NotFound.
        update_entity(&tx, id, patch, now)?;
        match &patch.visit {
            Some(VisitUpsert::Append(entry)) => insert_visit(&tx, id, entry)?,
            Some(VisitUpsert::Replace(entry)) => replace_visit(&tx, id, entry)?,
            None => {}
        }
        tx.commit()?;
        Ok(())
    }

    fn append_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        ensure_entity_exists(&tx, id)?;
        insert_visit(&tx, id, entry)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_visit(&self, id: &Uuid, entry: &VisitHistoryEntry) -> Result<(), DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        ensure_entity_exists(&tx, id)?;
        replace_visit(&tx, id, entry)?;
        tx.commit()?;
        Ok(())
    }

    fn supersede(
        &self,
        old_id: &Uuid,
        successor: &CanonicalEntity,
        predecessor_visit: Option<&VisitHistoryEntry>,
    ) -> Result<Uuid, DatabaseError> {
        if successor.supersedes != Some(*old_id) {
            return Err(DatabaseError::ConstraintViolation(format!(
                "successor {} does not point back at {old_id}",
                successor.id
            )));
        }
        let tx = self.conn.unchecked_transaction()?;
        ensure_entity_exists(&tx, old_id)?;
        if let Some(entry) = predecessor_visit {
            replace_visit(&tx, old_id, entry)?;
        }
        insert_entity(&tx, successor)?;
        for entry in &successor.visit_history {
            insert_visit(&tx, &successor.id, entry)?;
        }
        mark_superseded(&tx, old_id, &successor.id, successor.created_at)?;
        tx.commit()?;
        Ok(successor.id)
    }

    fn record_batch(&self, summary: &BatchSummary) -> Result<(), DatabaseError> {
        let recorded_at = Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string();
        let rows: Vec<AuditRow> = summary
            .changes
            .iter()
            .map(|report| audit_row(summary, report, &recorded_at))
            .collect();
        insert_audit_rows(self.conn, &rows)
    }
}

fn audit_row(summary: &BatchSummary, report: &ChangeReport, recorded_at: &str) -> AuditRow {
    let mut detail = vec![format!("match={}", report.match_method.as_str())];
    if let Some(note) = report.recovery {
        detail.push(note.as_str().to_string());
    }
    if let Some(reason) = &report.detail {
        detail.push(reason.clone());
    }

    AuditRow {
        batch_id: summary.batch_id.to_string(),
        change_index: report.index,
        patient_id: summary.patient_id.clone(),
        entity_type: summary.entity_type.as_str().to_string(),
        source_type: summary.source_type.as_str().to_string(),
        source_ref: summary.source_ref.clone(),
        action: report.applied.or(report.proposed).map(|a| a.as_str().to_string()),
        outcome: report.outcome.as_str().to_string(),
        entity_id: report.entity_id.map(|id| id.to_string()),
        detail: Some(detail.join("; ")),
        recorded_at: recorded_at.to_string(),
    }
}
