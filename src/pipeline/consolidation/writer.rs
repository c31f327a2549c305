//! Entity state machine: applies one resolved plan as one atomic store call.
//!
//! ```text
//! CREATE      → active | pending_review
//! ADD_VISIT   → status kept (superseded refused)
//! EVOLVE      active|pending_review → superseded, plus new successor
//! RESOLVE     active|pending_review → resolved (medications: discontinued)
//! REACTIVATE  resolved|discontinued → active
//! ```

use chrono::{NaiveDateTime, SubsecRound, Utc};
use uuid::Uuid;

use super::error::ApplyFailure;
use super::history::{merge_visit, plan_visit};
use super::resolver::Plan;
use super::snapshot::WorkingSnapshot;
use super::traits::CanonicalStore;
use super::types::{ChangeOutcome, ConsolidationConfig, SourceEvent};
use crate::models::enums::EntityStatus;
use crate::models::{
    ActionKind, CanonicalEntity, EntityAttributes, EntityPatch, ProposedChange, VisitHistoryEntry,
    VisitUpsert,
};

/// Result of a successfully applied plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: ChangeOutcome,
    /// The entity the change ended up on (the successor for EVOLVE).
    pub entity_id: Uuid,
    /// Entities actually written.
    pub touched: Vec<Uuid>,
}

impl Applied {
    fn written(outcome: ChangeOutcome, entity_id: Uuid, touched: Vec<Uuid>) -> Self {
        Self {
            outcome,
            entity_id,
            touched,
        }
    }

    fn unchanged(entity_id: Uuid) -> Self {
        Self {
            outcome: ChangeOutcome::Unchanged,
            entity_id,
            touched: Vec::new(),
        }
    }
}

pub struct EntityWriter<'a, S: CanonicalStore + ?Sized> {
    store: &'a S,
    config: &'a ConsolidationConfig,
}

impl<'a, S: CanonicalStore + ?Sized> EntityWriter<'a, S> {
    pub fn new(store: &'a S, config: &'a ConsolidationConfig) -> Self {
        Self { store, config }
    }

    /// Apply `plan`. The snapshot changes only when the store write succeeded.
    pub fn apply(
        &self,
        snapshot: &mut WorkingSnapshot,
        event: &SourceEvent,
        change: &ProposedChange,
        plan: Plan,
    ) -> Result<Applied, ApplyFailure> {
        let entry = visit_entry(event, change);
        match plan {
            Plan::Create => self.create(snapshot, event, change, entry),
            Plan::AddVisit(id) => self.add_visit(snapshot, id, change, entry),
            Plan::Evolve(id) => self.evolve(snapshot, id, change, entry),
            Plan::Resolve(id) => {
                let status = event.entity_type.resolved_status();
                self.transition(snapshot, id, ActionKind::Resolve, status, entry)
            }
            Plan::Reactivate(id) => {
                self.transition(snapshot, id, ActionKind::Reactivate, EntityStatus::Active, entry)
            }
        }
    }

    fn create(
        &self,
        snapshot: &mut WorkingSnapshot,
        event: &SourceEvent,
        change: &ProposedChange,
        entry: VisitHistoryEntry,
    ) -> Result<Applied, ApplyFailure> {
        let mut attributes = change.attributes.clone();
        if event.entity_type.is_date_bearing() && attributes.effective_date.is_none() {
            attributes.effective_date = Some(entry.date);
        }
        let entity = CanonicalEntity::new(
            &event.patient_id,
            event.entity_type,
            attributes,
            self.initial_status(change),
            entry,
            now(),
        );

        let id = self.store.apply_create(&entity)?;
        tracing::debug!(entity_id = %id, status = %entity.status, "Created entity");
        snapshot.insert(entity);
        Ok(Applied::written(ChangeOutcome::Created, id, vec![id]))
    }

    fn add_visit(
        &self,
        snapshot: &mut WorkingSnapshot,
        id: Uuid,
        change: &ProposedChange,
        entry: VisitHistoryEntry,
    ) -> Result<Applied, ApplyFailure> {
        let entity = snapshot.get(&id).ok_or(ApplyFailure::StaleEntity(id))?;
        if entity.status == EntityStatus::Superseded {
            return Err(ApplyFailure::InvalidTransition {
                entity_id: id,
                from: entity.status,
                action: ActionKind::AddVisit,
            });
        }

        let mut patch = fill_gaps(&entity.attributes, &change.attributes);
        patch.visit = plan_visit(&entity.visit_history, &entry);
        self.write_patch(snapshot, id, patch, ChangeOutcome::Updated)
    }

    fn transition(
        &self,
        snapshot: &mut WorkingSnapshot,
        id: Uuid,
        action: ActionKind,
        to: EntityStatus,
        entry: VisitHistoryEntry,
    ) -> Result<Applied, ApplyFailure> {
        let entity = snapshot.get(&id).ok_or(ApplyFailure::StaleEntity(id))?;
        let from = entity.status;
        // Reactivating a live entity only records the visit.
        let target = if action == ActionKind::Reactivate && from.is_live() {
            from
        } else {
            to
        };
        if !from.can_transition_to(target) {
            return Err(ApplyFailure::InvalidTransition {
                entity_id: id,
                from,
                action,
            });
        }

        let patch = EntityPatch {
            status: (target != from).then_some(target),
            visit: plan_visit(&entity.visit_history, &entry),
            ..Default::default()
        };
        let outcome = match (patch.status, action) {
            (Some(_), ActionKind::Reactivate) => ChangeOutcome::Reactivated,
            (Some(_), _) => ChangeOutcome::Resolved,
            (None, _) => ChangeOutcome::Updated,
        };
        self.write_patch(snapshot, id, patch, outcome)
    }

    fn write_patch(
        &self,
        snapshot: &mut WorkingSnapshot,
        id: Uuid,
        patch: EntityPatch,
        outcome: ChangeOutcome,
    ) -> Result<Applied, ApplyFailure> {
        if patch.is_empty() {
            return Ok(Applied::unchanged(id));
        }

        self.store
            .apply_update(&id, &patch)
            .map_err(|e| ApplyFailure::from_store(id, e))?;

        let entity = snapshot.get_mut(&id).ok_or(ApplyFailure::StaleEntity(id))?;
        patch.apply_to(entity);
        if let Some(visit) = patch.visit {
            merge_visit(&mut entity.visit_history, visit.entry().clone());
        }
        entity.updated_at = now();
        Ok(Applied::written(outcome, id, vec![id]))
    }

    fn evolve(
        &self,
        snapshot: &mut WorkingSnapshot,
        id: Uuid,
        change: &ProposedChange,
        entry: VisitHistoryEntry,
    ) -> Result<Applied, ApplyFailure> {
        let source = snapshot.get(&id).ok_or(ApplyFailure::StaleEntity(id))?;
        if !source.status.is_live() {
            return Err(ApplyFailure::InvalidTransition {
                entity_id: id,
                from: source.status,
                action: ActionKind::Evolve,
            });
        }

        let mut attributes = change.attributes.clone();
        if attributes.title.trim().is_empty() {
            attributes.title = source.attributes.title.clone();
        }
        if attributes.body_region.is_none() {
            attributes.body_region = source.attributes.body_region.clone();
        }
        if attributes.effective_date.is_none() {
            attributes.effective_date = source.attributes.effective_date;
        }

        let timestamp = now();
        let mut successor = CanonicalEntity::new(
            &source.patient_id,
            source.entity_type,
            attributes,
            self.initial_status(change),
            entry.clone(),
            timestamp,
        );
        // A visit from this event already on the predecessor is rewritten there
        // first, so the successor still holds the predecessor history verbatim.
        let predecessor_visit = match plan_visit(&source.visit_history, &entry) {
            Some(VisitUpsert::Replace(refreshed)) => Some(refreshed),
            _ => None,
        };
        successor.visit_history = source.visit_history.clone();
        merge_visit(&mut successor.visit_history, entry);
        successor.supersedes = Some(id);

        let new_id = self
            .store
            .supersede(&id, &successor, predecessor_visit.as_ref())
            .map_err(|e| ApplyFailure::from_store(id, e))?;

        if let Some(old) = snapshot.get_mut(&id) {
            if let Some(refreshed) = predecessor_visit {
                merge_visit(&mut old.visit_history, refreshed);
            }
            old.status = EntityStatus::Superseded;
            old.superseded_by = Some(new_id);
            old.updated_at = timestamp;
        }
        tracing::debug!(from = %id, to = %new_id, "Evolved entity");
        snapshot.insert(successor);
        Ok(Applied::written(ChangeOutcome::Evolved, new_id, vec![id, new_id]))
    }

    fn initial_status(&self, change: &ProposedChange) -> EntityStatus {
        match self.config.review_confidence_floor {
            Some(floor) if change.confidence < floor => EntityStatus::PendingReview,
            _ => EntityStatus::Active,
        }
    }
}

/// The history entry a change contributes, attributed to the batch's source event.
pub fn visit_entry(event: &SourceEvent, change: &ProposedChange) -> VisitHistoryEntry {
    if let Some(hint) = change.source_type {
        if hint != event.source_type {
            tracing::debug!(
                index = change.index,
                hint = %hint,
                source_type = %event.source_type,
                "Ignoring oracle source type hint"
            );
        }
    }
    VisitHistoryEntry {
        date: change.extracted_date.unwrap_or(event.event_date),
        note: change.note.clone(),
        source_type: event.source_type,
        source_ref: event.source_ref.clone(),
        confidence: change.confidence,
        reasoning: change.reasoning.clone(),
    }
}

/// Patch that only fills attributes the entity does not have yet.
fn fill_gaps(current: &EntityAttributes, proposed: &EntityAttributes) -> EntityPatch {
    fn gap<T: Clone>(current: &Option<T>, proposed: &Option<T>) -> Option<T> {
        match current {
            Some(_) => None,
            None => proposed.clone(),
        }
    }
    EntityPatch {
        code: gap(&current.code, &proposed.code),
        body_region: gap(&current.body_region, &proposed.body_region),
        detail: gap(&current.detail, &proposed.detail),
        effective_date: gap(&current.effective_date, &proposed.effective_date),
        ..Default::default()
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::get_entity;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::{EntityType, SourceType};
    use crate::models::Action;
    use crate::pipeline::consolidation::store::SqliteCanonicalStore;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(entity_type: EntityType, source_ref: &str) -> SourceEvent {
        SourceEvent {
            patient_id: "patient-1".into(),
            entity_type,
            source_type: SourceType::Encounter,
            source_ref: source_ref.into(),
            event_date: date(2024, 5, 1),
        }
    }

    fn change(action: Action, title: &str, confidence: f32) -> ProposedChange {
        ProposedChange {
            index: 0,
            action,
            attributes: EntityAttributes {
                title: title.into(),
                ..Default::default()
            },
            extracted_date: None,
            note: format!("{title} noted"),
            confidence,
            source_type: None,
            reasoning: "stated in note".into(),
        }
    }

    fn create(
        writer: &EntityWriter<'_, SqliteCanonicalStore<'_>>,
        snapshot: &mut WorkingSnapshot,
        entity_type: EntityType,
        title: &str,
    ) -> Uuid {
        writer
            .apply(
                snapshot,
                &event(entity_type, "enc-1"),
                &change(Action::Create, title, 0.9),
                Plan::Create,
            )
            .unwrap()
            .entity_id
    }

    #[test]
    fn create_writes_entity_with_single_visit() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();

        let id = create(&writer, &mut snapshot, EntityType::Problem, "Asthma");
        let stored = get_entity(&conn, &id).unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::Active);
        assert_eq!(stored.visit_history.len(), 1);
        assert_eq!(stored.visit_history[0].source_ref, "enc-1");
        assert_eq!(stored.visit_history[0].date, date(2024, 5, 1));
        assert_eq!(snapshot.get(&id).unwrap().visit_history, stored.visit_history);
    }

    #[test]
    fn low_confidence_create_is_pending_review_when_floor_set() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig {
            review_confidence_floor: Some(0.6),
            ..Default::default()
        };
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let applied = writer
            .apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-1"),
                &change(Action::Create, "Possible gout", 0.4),
                Plan::Create,
            )
            .unwrap();
        let stored = get_entity(&conn, &applied.entity_id).unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::PendingReview);
    }

    #[test]
    fn date_bearing_create_takes_visit_date() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Lab, "TSH");
        assert_eq!(
            snapshot.get(&id).unwrap().attributes.effective_date,
            Some(date(2024, 5, 1))
        );
    }

    #[test]
    fn add_visit_fills_gaps_but_never_overwrites() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();

        let mut first = change(Action::Create, "Hypertension", 0.9);
        first.attributes.code = Some("I10".into());
        let id = writer
            .apply(&mut snapshot, &event(EntityType::Problem, "enc-1"), &first, Plan::Create)
            .unwrap()
            .entity_id;

        let mut visit = change(Action::AddVisit { matched_entity_id: None }, "HTN", 0.7);
        visit.attributes.code = Some("I15".into());
        visit.attributes.detail = Some("stage 2".into());
        let applied = writer
            .apply(&mut snapshot, &event(EntityType::Problem, "enc-2"), &visit, Plan::AddVisit(id))
            .unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Updated);

        let stored = get_entity(&conn, &id).unwrap().unwrap();
        assert_eq!(stored.attributes.code.as_deref(), Some("I10"));
        assert_eq!(stored.attributes.detail.as_deref(), Some("stage 2"));
        assert_eq!(stored.visit_history.len(), 2);
    }

    #[test]
    fn repeated_visit_from_same_source_is_unchanged() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Problem, "Asthma");

        let visit = change(Action::AddVisit { matched_entity_id: None }, "Asthma", 0.9);
        let applied = writer
            .apply(&mut snapshot, &event(EntityType::Problem, "enc-1"), &visit, Plan::AddVisit(id))
            .unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Unchanged);
        assert!(applied.touched.is_empty());
    }

    #[test]
    fn resolve_medication_discontinues_and_reactivate_reopens() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Medication, "Metformin");

        let stop = change(Action::Resolve { matched_entity_id: None }, "Metformin", 0.9);
        let applied = writer
            .apply(&mut snapshot, &event(EntityType::Medication, "enc-2"), &stop, Plan::Resolve(id))
            .unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Resolved);
        assert_eq!(
            get_entity(&conn, &id).unwrap().unwrap().status,
            EntityStatus::Discontinued
        );

        let restart = change(Action::Reactivate { matched_entity_id: None }, "Metformin", 0.9);
        let applied = writer
            .apply(
                &mut snapshot,
                &event(EntityType::Medication, "enc-3"),
                &restart,
                Plan::Reactivate(id),
            )
            .unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Reactivated);
        let stored = get_entity(&conn, &id).unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::Active);
        assert_eq!(stored.visit_history.len(), 3);
    }

    #[test]
    fn add_visit_on_resolved_keeps_status() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Problem, "Bronchitis");
        writer
            .apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-2"),
                &change(Action::Resolve { matched_entity_id: None }, "Bronchitis", 0.9),
                Plan::Resolve(id),
            )
            .unwrap();

        writer
            .apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-3"),
                &change(Action::AddVisit { matched_entity_id: None }, "Bronchitis", 0.9),
                Plan::AddVisit(id),
            )
            .unwrap();
        let stored = get_entity(&conn, &id).unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::Resolved);
        assert_eq!(stored.visit_history.len(), 3);
    }

    #[test]
    fn evolve_from_resolved_is_invalid_and_writes_nothing() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Problem, "Bronchitis");
        writer
            .apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-2"),
                &change(Action::Resolve { matched_entity_id: None }, "Bronchitis", 0.9),
                Plan::Resolve(id),
            )
            .unwrap();

        let evolve = change(
            Action::Evolve { transfer_from_entity_id: id.to_string() },
            "Pneumonia",
            0.9,
        );
        let err = writer
            .apply(&mut snapshot, &event(EntityType::Problem, "enc-3"), &evolve, Plan::Evolve(id))
            .unwrap_err();
        assert!(matches!(
            err,
            ApplyFailure::InvalidTransition {
                from: EntityStatus::Resolved,
                action: ActionKind::Evolve,
                ..
            }
        ));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn evolve_carries_history_and_links_lineage() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let id = create(&writer, &mut snapshot, EntityType::Problem, "Type 2 diabetes");

        let mut evolve = change(
            Action::Evolve { transfer_from_entity_id: id.to_string() },
            "",
            0.85,
        );
        evolve.attributes.code = Some("E11.40".into());
        let applied = writer
            .apply(&mut snapshot, &event(EntityType::Problem, "enc-2"), &evolve, Plan::Evolve(id))
            .unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Evolved);
        assert_eq!(applied.touched, vec![id, applied.entity_id]);

        let old = get_entity(&conn, &id).unwrap().unwrap();
        let new = get_entity(&conn, &applied.entity_id).unwrap().unwrap();
        assert_eq!(old.status, EntityStatus::Superseded);
        assert_eq!(old.superseded_by, Some(new.id));
        assert_eq!(new.supersedes, Some(old.id));
        assert_eq!(new.attributes.title, "Type 2 diabetes");
        assert_eq!(new.visit_history.len(), old.visit_history.len() + 1);
        assert_eq!(new.visit_history[..1], old.visit_history[..]);

        // Superseded entities refuse further visits.
        let visit = change(Action::AddVisit { matched_entity_id: None }, "x", 0.9);
        assert!(matches!(
            writer.apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-3"),
                &visit,
                Plan::AddVisit(id)
            ),
            Err(ApplyFailure::InvalidTransition { .. })
        ));
    }

    #[test]
    fn missing_target_is_stale() {
        let conn = open_memory_database().unwrap();
        let store = SqliteCanonicalStore::new(&conn);
        let config = ConsolidationConfig::default();
        let writer = EntityWriter::new(&store, &config);
        let mut snapshot = WorkingSnapshot::default();
        let ghost = Uuid::new_v4();
        let visit = change(Action::AddVisit { matched_entity_id: None }, "x", 0.9);
        assert!(matches!(
            writer.apply(
                &mut snapshot,
                &event(EntityType::Problem, "enc-3"),
                &visit,
                Plan::AddVisit(ghost)
            ),
            Err(ApplyFailure::StaleEntity(id)) if id == ghost
        ));
    }
}
