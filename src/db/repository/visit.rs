use std::collections::HashMap;
use std::str::FromStr;

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::entity::{not_found, parse_date, parse_uuid, DATE_FORMAT};
use crate::db::DatabaseError;
use crate::models::enums::{EntityType, SourceType};
use crate::models::VisitHistoryEntry;

/// Display/diff order of a history: date, then source key.
const VISIT_ORDER: &str = "visit_date ASC, source_type ASC, source_ref ASC";

pub fn insert_visit(
    conn: &Connection,
    entity_id: &Uuid,
    entry: &VisitHistoryEntry,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO visit_history
            (entity_id, visit_date, note, source_type, source_ref, confidence, reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity_id.to_string(),
            entry.date.format(DATE_FORMAT).to_string(),
            entry.note,
            entry.source_type.as_str(),
            entry.source_ref,
            entry.confidence as f64,
            entry.reasoning,
        ],
    )?;
    Ok(())
}

/// Overwrite the entry that carries the same source key.
pub fn replace_visit(
    conn: &Connection,
    entity_id: &Uuid,
    entry: &VisitHistoryEntry,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE visit_history SET visit_date = ?4, note = ?5, confidence = ?6, reasoning = ?7
         WHERE entity_id = ?1 AND source_type = ?2 AND source_ref = ?3",
        params![
            entity_id.to_string(),
            entry.source_type.as_str(),
            entry.source_ref,
            entry.date.format(DATE_FORMAT).to_string(),
            entry.note,
            entry.confidence as f64,
            entry.reasoning,
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "visit_history".into(),
            id: format!("{entity_id}/{}/{}", entry.source_type, entry.source_ref),
        });
    }
    Ok(())
}

pub fn get_visits_for_entity(
    conn: &Connection,
    entity_id: &Uuid,
) -> Result<Vec<VisitHistoryEntry>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT entity_id, visit_date, note, source_type, source_ref, confidence, reasoning
         FROM visit_history WHERE entity_id = ?1
         ORDER BY {VISIT_ORDER}"
    ))?;
    let rows = stmt
        .query_map(params![entity_id.to_string()], visit_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| visit_from_row(row).map(|(_, entry)| entry))
        .collect()
}

/// Visit histories for every entity of one type for a patient, keyed by entity.
/// One query instead of one per entity.
pub fn get_visits_for_patient(
    conn: &Connection,
    patient_id: &str,
    entity_type: EntityType,
) -> Result<HashMap<Uuid, Vec<VisitHistoryEntry>>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT v.entity_id, v.visit_date, v.note, v.source_type, v.source_ref,
                v.confidence, v.reasoning
         FROM visit_history v
         JOIN canonical_entities e ON e.id = v.entity_id
         WHERE e.patient_id = ?1 AND e.entity_type = ?2
         ORDER BY v.entity_id, {VISIT_ORDER}"
    ))?;
    let rows = stmt
        .query_map(params![patient_id, entity_type.as_str()], visit_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<Uuid, Vec<VisitHistoryEntry>> = HashMap::new();
    for row in rows {
        let (entity_id, entry) = visit_from_row(row)?;
        grouped.entry(entity_id).or_default().push(entry);
    }
    Ok(grouped)
}

pub fn count_visits(conn: &Connection, entity_id: &Uuid) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM visit_history WHERE entity_id = ?1",
        params![entity_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Ensure the entity row exists before visit writes, so a stale id surfaces
/// as `NotFound` rather than a foreign-key error.
pub fn ensure_entity_exists(conn: &Connection, entity_id: &Uuid) -> Result<(), DatabaseError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM canonical_entities WHERE id = ?1)",
        params![entity_id.to_string()],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(not_found(entity_id));
    }
    Ok(())
}

type VisitRow = (String, String, String, String, String, f64, String);

fn visit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisitRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn visit_from_row(row: VisitRow) -> Result<(Uuid, VisitHistoryEntry), DatabaseError> {
    let (entity_id, date, note, source_type, source_ref, confidence, reasoning) = row;
    Ok((
        parse_uuid(&entity_id)?,
        VisitHistoryEntry {
            date: parse_date(&date)?,
            note,
            source_type: SourceType::from_str(&source_type)?,
            source_ref,
            confidence: confidence as f32,
            reasoning,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::entity::insert_entity;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::EntityStatus;
    use crate::models::{CanonicalEntity, EntityAttributes};
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn visit(source_ref: &str, on: NaiveDate, note: &str) -> VisitHistoryEntry {
        VisitHistoryEntry {
            date: on,
            note: note.into(),
            source_type: SourceType::Encounter,
            source_ref: source_ref.into(),
            confidence: 0.8,
            reasoning: "matched by id".into(),
        }
    }

    fn seed_entity(conn: &Connection) -> Uuid {
        let entity = CanonicalEntity::new(
            "patient-1",
            EntityType::Medication,
            EntityAttributes {
                title: "Lisinopril".into(),
                ..Default::default()
            },
            EntityStatus::Active,
            visit("enc-0", date(2024, 1, 1), "Started"),
            date(2024, 1, 1).and_hms_opt(8, 0, 0).unwrap(),
        );
        insert_entity(conn, &entity).unwrap();
        entity.id
    }

    #[test]
    fn visits_come_back_in_date_order() {
        let conn = open_memory_database().unwrap();
        let id = seed_entity(&conn);
        insert_visit(&conn, &id, &visit("enc-2", date(2024, 3, 1), "later")).unwrap();
        insert_visit(&conn, &id, &visit("enc-1", date(2024, 2, 1), "earlier")).unwrap();

        let visits = get_visits_for_entity(&conn, &id).unwrap();
        let refs: Vec<&str> = visits.iter().map(|v| v.source_ref.as_str()).collect();
        assert_eq!(refs, vec!["enc-1", "enc-2"]);
    }

    #[test]
    fn duplicate_source_key_is_rejected_by_storage() {
        let conn = open_memory_database().unwrap();
        let id = seed_entity(&conn);
        insert_visit(&conn, &id, &visit("enc-1", date(2024, 2, 1), "first")).unwrap();
        assert!(insert_visit(&conn, &id, &visit("enc-1", date(2024, 2, 1), "again")).is_err());
    }

    #[test]
    fn replace_overwrites_in_place() {
        let conn = open_memory_database().unwrap();
        let id = seed_entity(&conn);
        insert_visit(&conn, &id, &visit("enc-1", date(2024, 2, 1), "first")).unwrap();
        replace_visit(&conn, &id, &visit("enc-1", date(2024, 2, 2), "corrected")).unwrap();

        let visits = get_visits_for_entity(&conn, &id).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].note, "corrected");
        assert_eq!(visits[0].date, date(2024, 2, 2));
        assert_eq!(count_visits(&conn, &id).unwrap(), 1);
    }

    #[test]
    fn replace_missing_entry_is_not_found() {
        let conn = open_memory_database().unwrap();
        let id = seed_entity(&conn);
        let err = replace_visit(&conn, &id, &visit("enc-9", date(2024, 2, 1), "x")).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn grouped_by_entity_for_patient() {
        let conn = open_memory_database().unwrap();
        let a = seed_entity(&conn);
        let b = seed_entity(&conn);
        insert_visit(&conn, &a, &visit("enc-1", date(2024, 2, 1), "a")).unwrap();
        insert_visit(&conn, &b, &visit("enc-1", date(2024, 2, 1), "b")).unwrap();
        insert_visit(&conn, &b, &visit("enc-2", date(2024, 2, 5), "b2")).unwrap();

        let grouped = get_visits_for_patient(&conn, "patient-1", EntityType::Medication).unwrap();
        assert_eq!(grouped[&a].len(), 1);
        assert_eq!(grouped[&b].len(), 2);
    }

    #[test]
    fn ensure_entity_exists_reports_stale_ids() {
        let conn = open_memory_database().unwrap();
        let id = seed_entity(&conn);
        assert!(ensure_entity_exists(&conn, &id).is_ok());
        assert!(matches!(
            ensure_entity_exists(&conn, &Uuid::new_v4()),
            Err(DatabaseError::NotFound { .. })
        ));
    }
}
