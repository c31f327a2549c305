use rusqlite::{params, Connection};

use crate::db::DatabaseError;

/// One row of the consolidation audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub batch_id: String,
    pub change_index: usize,
    pub patient_id: String,
    pub entity_type: String,
    pub source_type: String,
    pub source_ref: String,
    pub action: Option<String>,
    pub outcome: String,
    pub entity_id: Option<String>,
    pub detail: Option<String>,
    pub recorded_at: String,
}

/// Insert a batch of audit rows in a single transaction.
pub fn insert_audit_rows(conn: &Connection, rows: &[AuditRow]) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO consolidation_audit
             (batch_id, change_index, patient_id, entity_type, source_type, source_ref,
              action, outcome, entity_id, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.batch_id,
                row.change_index as i64,
                row.patient_id,
                row.entity_type,
                row.source_type,
                row.source_ref,
                row.action,
                row.outcome,
                row.entity_id,
                row.detail,
                row.recorded_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Audit rows for a patient and entity type, newest batch first.
pub fn query_audit_for_patient(
    conn: &Connection,
    patient_id: &str,
    entity_type: &str,
) -> Result<Vec<AuditRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT batch_id, change_index, patient_id, entity_type, source_type, source_ref,
                action, outcome, entity_id, detail, recorded_at
         FROM consolidation_audit
         WHERE patient_id = ?1 AND entity_type = ?2
         ORDER BY recorded_at DESC, batch_id, change_index",
    )?;
    let rows = stmt
        .query_map(params![patient_id, entity_type], |row| {
            Ok(AuditRow {
                batch_id: row.get(0)?,
                change_index: row.get::<_, i64>(1)? as usize,
                patient_id: row.get(2)?,
                entity_type: row.get(3)?,
                source_type: row.get(4)?,
                source_ref: row.get(5)?,
                action: row.get(6)?,
                outcome: row.get(7)?,
                entity_id: row.get(8)?,
                detail: row.get(9)?,
                recorded_at: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Prune audit rows older than the given number of days.
pub fn prune_audit(conn: &Connection, retention_days: i64) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM consolidation_audit
         WHERE recorded_at < strftime('%Y-%m-%dT%H:%M:%S', 'now', ?1)",
        params![format!("-{retention_days} days")],
    )?;
    Ok(deleted)
}
