use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::visit::get_visits_for_patient;
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ENTITY_COLUMNS: &str = "id, patient_id, entity_type, title, code, body_region, detail,
     effective_date, status, superseded_by, supersedes, created_at, updated_at";

pub fn insert_entity(conn: &Connection, entity: &CanonicalEntity) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO canonical_entities
            (id, patient_id, entity_type, title, code, body_region, detail,
             effective_date, status, superseded_by, supersedes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            entity.id.to_string(),
            entity.patient_id,
            entity.entity_type.as_str(),
            entity.attributes.title,
            entity.attributes.code,
            entity.attributes.body_region,
            entity.attributes.detail,
            entity.attributes.effective_date.map(|d| d.format(DATE_FORMAT).to_string()),
            entity.status.as_str(),
            entity.superseded_by.map(|id| id.to_string()),
            entity.supersedes.map(|id| id.to_string()),
            entity.created_at.format(TIMESTAMP_FORMAT).to_string(),
            entity.updated_at.format(TIMESTAMP_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

/// All entities of one type for a patient, visit history included, oldest first.
pub fn get_entities_for_patient(
    conn: &Connection,
    patient_id: &str,
    entity_type: EntityType,
) -> Result<Vec<CanonicalEntity>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTITY_COLUMNS} FROM canonical_entities
         WHERE patient_id = ?1 AND entity_type = ?2
         ORDER BY created_at ASC, id ASC"
    ))?;

    let rows = stmt
        .query_map(params![patient_id, entity_type.as_str()], entity_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut visits = get_visits_for_patient(conn, patient_id, entity_type)?;

    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        let mut entity = entity_from_row(row)?;
        entity.visit_history = visits.remove(&entity.id).unwrap_or_default();
        entities.push(entity);
    }
    Ok(entities)
}

pub fn get_entity(conn: &Connection, id: &Uuid) -> Result<Option<CanonicalEntity>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {ENTITY_COLUMNS} FROM canonical_entities WHERE id = ?1"),
            params![id.to_string()],
            entity_row,
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some(row) => {
            let mut entity = entity_from_row(row)?;
            entity.visit_history = super::visit::get_visits_for_entity(conn, id)?;
            Ok(Some(entity))
        }
    }
}

/// Write the entity-column part of a patch. Visit changes are handled by the caller.
pub fn update_entity(
    conn: &Connection,
    id: &Uuid,
    patch: &EntityPatch,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE canonical_entities SET
            code = COALESCE(?2, code),
            body_region = COALESCE(?3, body_region),
            detail = COALESCE(?4, detail),
            effective_date = COALESCE(?5, effective_date),
            status = COALESCE(?6, status),
            updated_at = ?7
         WHERE id = ?1",
        params![
            id.to_string(),
            patch.code,
            patch.body_region,
            patch.detail,
            patch.effective_date.map(|d| d.format(DATE_FORMAT).to_string()),
            patch.status.map(|s| s.as_str()),
            now.format(TIMESTAMP_FORMAT).to_string(),
        ],
    )?;
    if updated == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

/// Mark `old_id` superseded by `new_id`. Refuses entities already superseded.
pub fn mark_superseded(
    conn: &Connection,
    old_id: &Uuid,
    new_id: &Uuid,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE canonical_entities SET status = 'superseded', superseded_by = ?2, updated_at = ?3
         WHERE id = ?1 AND status != 'superseded'",
        params![
            old_id.to_string(),
            new_id.to_string(),
            now.format(TIMESTAMP_FORMAT).to_string(),
        ],
    )?;
    if updated == 0 {
        return match get_entity(conn, old_id)? {
            None => Err(not_found(old_id)),
            Some(_) => Err(DatabaseError::ConstraintViolation(format!(
                "entity {old_id} is already superseded"
            ))),
        };
    }
    Ok(())
}

pub fn count_entities(
    conn: &Connection,
    patient_id: &str,
    entity_type: EntityType,
) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM canonical_entities WHERE patient_id = ?1 AND entity_type = ?2",
        params![patient_id, entity_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub(crate) fn not_found(id: &Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity_type: "canonical_entity".into(),
        id: id.to_string(),
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date '{s}': {e}")))
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, DatabaseError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp '{s}': {e}")))
}

struct EntityRow {
    id: String,
    patient_id: String,
    entity_type: String,
    title: String,
    code: Option<String>,
    body_region: Option<String>,
    detail: Option<String>,
    effective_date: Option<String>,
    status: String,
    superseded_by: Option<String>,
    supersedes: Option<String>,
    created_at: String,
    updated_at: String,
}

fn entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
    Ok(EntityRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        entity_type: row.get(2)?,
        title: row.get(3)?,
        code: row.get(4)?,
        body_region: row.get(5)?,
        detail: row.get(6)?,
        effective_date: row.get(7)?,
        status: row.get(8)?,
        superseded_by: row.get(9)?,
        supersedes: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn entity_from_row(row: EntityRow) -> Result<CanonicalEntity, DatabaseError> {
    Ok(CanonicalEntity {
        id: parse_uuid(&row.id)?,
        patient_id: row.patient_id,
        entity_type: EntityType::from_str(&row.entity_type)?,
        attributes: EntityAttributes {
            title: row.title,
            code: row.code,
            body_region: row.body_region,
            detail: row.detail,
            effective_date: row.effective_date.as_deref().map(parse_date).transpose()?,
        },
        status: EntityStatus::from_str(&row.status)?,
        visit_history: Vec::new(),
        superseded_by: row.superseded_by.as_deref().map(parse_uuid).transpose()?,
        supersedes: row.supersedes.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn visit(source_ref: &str, date: NaiveDate) -> VisitHistoryEntry {
        VisitHistoryEntry {
            date,
            note: "Seen in clinic".into(),
            source_type: SourceType::Encounter,
            source_ref: source_ref.into(),
            confidence: 0.9,
            reasoning: "test".into(),
        }
    }

    fn make_entity(title: &str) -> CanonicalEntity {
        CanonicalEntity::new(
            "patient-1",
            EntityType::Problem,
            EntityAttributes {
                title: title.into(),
                code: Some("I10".into()),
                ..Default::default()
            },
            EntityStatus::Active,
            visit("enc-1", NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()),
            now(),
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let conn = open_memory_database().unwrap();
        let entity = make_entity("Hypertension");
        insert_entity(&conn, &entity).unwrap();

        let loaded = get_entity(&conn, &entity.id).unwrap().expect("entity exists");
        assert_eq!(loaded.attributes, entity.attributes);
        assert_eq!(loaded.status, EntityStatus::Active);
        // visits are written by the visit repository, not insert_entity
        assert!(loaded.visit_history.is_empty());
    }

    #[test]
    fn get_entity_missing_returns_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_entity(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn entities_scoped_by_patient_and_type() {
        let conn = open_memory_database().unwrap();
        insert_entity(&conn, &make_entity("Hypertension")).unwrap();
        let mut other_patient = make_entity("Asthma");
        other_patient.patient_id = "patient-2".into();
        insert_entity(&conn, &other_patient).unwrap();

        let loaded = get_entities_for_patient(&conn, "patient-1", EntityType::Problem).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attributes.title, "Hypertension");
        assert!(get_entities_for_patient(&conn, "patient-1", EntityType::Lab).unwrap().is_empty());
    }

    #[test]
    fn update_fills_only_given_fields() {
        let conn = open_memory_database().unwrap();
        let entity = make_entity("Hypertension");
        insert_entity(&conn, &entity).unwrap();

        let patch = EntityPatch {
            detail: Some("well controlled".into()),
            ..Default::default()
        };
        update_entity(&conn, &entity.id, &patch, now()).unwrap();

        let loaded = get_entity(&conn, &entity.id).unwrap().unwrap();
        assert_eq!(loaded.attributes.code.as_deref(), Some("I10"));
        assert_eq!(loaded.attributes.detail.as_deref(), Some("well controlled"));
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err =
            update_entity(&conn, &Uuid::new_v4(), &EntityPatch::default(), now()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn mark_superseded_twice_is_rejected() {
        let conn = open_memory_database().unwrap();
        let old = make_entity("Type 2 diabetes");
        let new = make_entity("Type 2 diabetes with neuropathy");
        insert_entity(&conn, &old).unwrap();
        insert_entity(&conn, &new).unwrap();

        mark_superseded(&conn, &old.id, &new.id, now()).unwrap();
        let err = mark_superseded(&conn, &old.id, &new.id, now()).unwrap_err();
        assert!(matches!(err, DatabaseError::ConstraintViolation(_)));

        let loaded = get_entity(&conn, &old.id).unwrap().unwrap();
        assert_eq!(loaded.status, EntityStatus::Superseded);
        assert_eq!(loaded.superseded_by, Some(new.id));
    }

    #[test]
    fn blank_title_violates_check_constraint() {
        let conn = open_memory_database().unwrap();
        let entity = make_entity("   ");
        assert!(insert_entity(&conn, &entity).is_err());
    }
}
