//! Match resolution: turn a proposed change into a concrete plan against the
//! working snapshot.
//!
//! Fallback chain, identical for every entity type:
//! 1. referenced id (following lineage from superseded entities)
//! 2. structural match on normalized key attributes (dates within tolerance
//!    for imaging and labs)
//! 3. ADD_VISIT/EVOLVE become CREATE; RESOLVE/REACTIVATE are skipped

use chrono::NaiveDate;
use uuid::Uuid;

use super::snapshot::{LineageLookup, WorkingSnapshot};
use super::synonyms::MatchKey;
use super::types::{ConsolidationConfig, MatchMethod, RecoveryNote, SourceEvent};
use crate::models::enums::{EntityStatus, EntityType};
use crate::models::{Action, ActionKind, CanonicalEntity, ProposedChange};

/// Concrete write the writer should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Create,
    AddVisit(Uuid),
    Evolve(Uuid),
    Resolve(Uuid),
    Reactivate(Uuid),
}

impl Plan {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create => ActionKind::Create,
            Self::AddVisit(_) => ActionKind::AddVisit,
            Self::Evolve(_) => ActionKind::Evolve,
            Self::Resolve(_) => ActionKind::Resolve,
            Self::Reactivate(_) => ActionKind::Reactivate,
        }
    }

    pub fn target(&self) -> Option<Uuid> {
        match self {
            Self::Create => None,
            Self::AddVisit(id) | Self::Evolve(id) | Self::Resolve(id) | Self::Reactivate(id) => {
                Some(*id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply(Plan),
    Skip(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    pub method: MatchMethod,
    pub recovery: Option<RecoveryNote>,
}

impl Resolution {
    fn apply(plan: Plan, method: MatchMethod) -> Self {
        Self {
            decision: Decision::Apply(plan),
            method,
            recovery: None,
        }
    }

    fn recovered(plan: Plan, method: MatchMethod, note: RecoveryNote) -> Self {
        Self {
            decision: Decision::Apply(plan),
            method,
            recovery: Some(note),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Skip(reason.into()),
            method: MatchMethod::None,
            recovery: None,
        }
    }
}

/// Resolves proposed changes against one snapshot.
pub struct MatchResolver<'a> {
    snapshot: &'a WorkingSnapshot,
    event: &'a SourceEvent,
    config: &'a ConsolidationConfig,
}

impl<'a> MatchResolver<'a> {
    pub fn new(
        snapshot: &'a WorkingSnapshot,
        event: &'a SourceEvent,
        config: &'a ConsolidationConfig,
    ) -> Self {
        Self {
            snapshot,
            event,
            config,
        }
    }

    pub fn resolve(&self, change: &ProposedChange) -> Resolution {
        match &change.action {
            Action::Create => self.resolve_create(change),
            Action::AddVisit { matched_entity_id } => {
                self.resolve_add_visit(change, matched_entity_id.as_deref())
            }
            Action::Evolve {
                transfer_from_entity_id,
            } => self.resolve_evolve(change, transfer_from_entity_id),
            Action::Resolve { matched_entity_id } => {
                self.resolve_target(change, matched_entity_id.as_deref(), Plan::Resolve)
            }
            Action::Reactivate { matched_entity_id } => {
                self.resolve_target(change, matched_entity_id.as_deref(), Plan::Reactivate)
            }
        }
    }

    fn resolve_create(&self, change: &ProposedChange) -> Resolution {
        // A closed entity already holding this event's visit was created and
        // closed by an earlier run of the same event.
        let matched = self
            .structural_match(change, |e| e.status.is_live())
            .or_else(|| {
                self.structural_match(change, |e| e.status.is_closed() && self.seen_event(e))
            });
        match matched {
            Some(id) => Resolution::recovered(
                Plan::AddVisit(id),
                MatchMethod::Structural,
                RecoveryNote::MergedIntoExisting,
            ),
            None => Resolution::apply(Plan::Create, MatchMethod::None),
        }
    }

    fn resolve_add_visit(&self, change: &ProposedChange, referenced: Option<&str>) -> Resolution {
        if let Some((id, method)) = self.referenced(change, referenced) {
            return Resolution::apply(Plan::AddVisit(id), method);
        }
        if let Some(id) = self.structural_match(change, |_| true) {
            return Resolution::apply(Plan::AddVisit(id), MatchMethod::Structural);
        }
        self.recover_as_create(change)
    }

    fn resolve_evolve(&self, change: &ProposedChange, referenced: &str) -> Resolution {
        if let Some((id, method)) = self.referenced(change, Some(referenced)) {
            // Source already carries the proposed attributes: this EVOLVE ran
            // before (lineage led to its successor) or changes nothing.
            if let Some(source) = self.snapshot.get(&id) {
                if self.already_evolved(source, change) {
                    return Resolution::recovered(
                        Plan::AddVisit(id),
                        method,
                        RecoveryNote::ReappliedEvolve,
                    );
                }
            }
            return Resolution::apply(Plan::Evolve(id), method);
        }
        if let Some(id) = self.structural_match(change, |e| e.status.is_live()) {
            return Resolution::recovered(
                Plan::AddVisit(id),
                MatchMethod::Structural,
                RecoveryNote::ReappliedEvolve,
            );
        }
        self.recover_as_create(change)
    }

    fn resolve_target(
        &self,
        change: &ProposedChange,
        referenced: Option<&str>,
        plan: fn(Uuid) -> Plan,
    ) -> Resolution {
        if let Some((id, method)) = self.referenced(change, referenced) {
            return Resolution::apply(plan(id), method);
        }
        if let Some(id) = self.structural_match(change, |_| true) {
            return Resolution::apply(plan(id), MatchMethod::Structural);
        }
        tracing::info!(
            index = change.index,
            action = %change.action.kind(),
            "No entity matches change, skipping"
        );
        Resolution::skip("no matching entity")
    }

    fn recover_as_create(&self, change: &ProposedChange) -> Resolution {
        if let Err(reason) = creatable(self.event.entity_type, change) {
            tracing::info!(
                index = change.index,
                action = %change.action.kind(),
                reason,
                "Unmatched change cannot become a new entity, skipping"
            );
            return Resolution::skip(format!("no matching entity; {reason}"));
        }
        tracing::info!(
            index = change.index,
            action = %change.action.kind(),
            "Unmatched change recovered as CREATE"
        );
        Resolution::recovered(Plan::Create, MatchMethod::None, RecoveryNote::RecoveredAsCreate)
    }

    fn referenced(
        &self,
        change: &ProposedChange,
        raw_id: Option<&str>,
    ) -> Option<(Uuid, MatchMethod)> {
        let raw_id = raw_id?;
        match self.snapshot.follow_reference(raw_id, self.config.max_lineage_depth) {
            LineageLookup::Found { id, hops: 0 } => Some((id, MatchMethod::ReferencedId)),
            LineageLookup::Found { id, hops } => {
                tracing::debug!(index = change.index, %id, hops, "Followed lineage to successor");
                Some((id, MatchMethod::Lineage))
            }
            LineageLookup::Unknown => {
                tracing::info!(
                    index = change.index,
                    action = %change.action.kind(),
                    "Referenced entity id not found, falling back to structural match"
                );
                None
            }
            LineageLookup::Broken => {
                tracing::warn!(
                    index = change.index,
                    action = %change.action.kind(),
                    "Lineage chain broken or too deep, falling back to structural match"
                );
                None
            }
        }
    }

    fn already_evolved(&self, source: &CanonicalEntity, change: &ProposedChange) -> bool {
        let entity_type = self.event.entity_type;
        let mut proposed = change.attributes.clone();
        if proposed.title.trim().is_empty() {
            proposed.title = source.attributes.title.clone();
        }
        match (
            MatchKey::from_attributes(entity_type, &proposed),
            MatchKey::from_attributes(entity_type, &source.attributes),
        ) {
            (Some(p), Some(s)) => p == s || (p.code.is_some() && p.matches(&s)),
            _ => false,
        }
    }

    fn seen_event(&self, entity: &CanonicalEntity) -> bool {
        entity.visit_history.iter().any(|v| {
            v.source_type == self.event.source_type && v.source_ref == self.event.source_ref
        })
    }

    /// Best structural candidate among entities passing `eligible`: live before
    /// closed, then closest date, then id. Superseded entities never match.
    fn structural_match(
        &self,
        change: &ProposedChange,
        eligible: impl Fn(&CanonicalEntity) -> bool,
    ) -> Option<Uuid> {
        let entity_type = self.event.entity_type;
        let key = MatchKey::from_attributes(entity_type, &change.attributes)?;
        let proposed_date = self.proposal_date(change);

        self.snapshot
            .entities()
            .iter()
            .filter(|e| e.status != EntityStatus::Superseded)
            .filter(|e| eligible(e))
            .filter(|e| {
                MatchKey::from_attributes(entity_type, &e.attributes)
                    .is_some_and(|k| k.matches(&key))
            })
            .filter_map(|e| {
                let distance = (entity_date(e) - proposed_date).num_days().abs();
                if entity_type.is_date_bearing() && distance > self.config.date_tolerance_days {
                    return None;
                }
                Some((!e.status.is_live(), distance, e.id))
            })
            .min()
            .map(|(_, _, id)| id)
    }

    fn proposal_date(&self, change: &ProposedChange) -> NaiveDate {
        change
            .attributes
            .effective_date
            .or(change.extracted_date)
            .unwrap_or(self.event.event_date)
    }
}

/// Effective date, else the first visit's date.
fn entity_date(entity: &CanonicalEntity) -> NaiveDate {
    entity
        .attributes
        .effective_date
        .or_else(|| entity.visit_history.first().map(|v| v.date))
        .unwrap_or_else(|| entity.created_at.date())
}

/// Whether a change carries enough to become a new entity.
pub fn creatable(entity_type: EntityType, change: &ProposedChange) -> Result<(), &'static str> {
    if change.attributes.title.trim().is_empty() {
        return Err("no title to create from");
    }
    if entity_type == EntityType::Imaging && change.attributes.body_region.is_none() {
        return Err("imaging without body region");
    }
    Ok(())
}
