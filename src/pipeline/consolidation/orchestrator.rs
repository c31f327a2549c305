//! One consolidation batch: load, ask the oracle, resolve and apply each
//! proposed change in order, report.
//!
//! A change that fails is reported and skipped; the rest of the batch goes on.
//! Only a failure to load the chart or to get a response from the oracle
//! fails the batch, and both happen before any write.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use super::error::ConsolidationError;
use super::resolver::{Decision, MatchResolver};
use super::snapshot::WorkingSnapshot;
use super::traits::CanonicalStore;
use super::types::{
    BatchSummary, ChangeOutcome, ChangeReport, ConsolidationConfig, ConsolidationRequest,
    MatchMethod, SourceEvent,
};
use super::writer::EntityWriter;
use crate::models::{ActionKind, ProposedChange};
use crate::pipeline::oracle::{ExtractionOracle, OracleRequest, QuarantinedChange};

/// Runs batches against one store and one oracle.
pub struct Consolidator<'a, S: CanonicalStore + ?Sized, O: ExtractionOracle + ?Sized> {
    store: &'a S,
    oracle: &'a O,
    config: &'a ConsolidationConfig,
}

impl<'a, S: CanonicalStore + ?Sized, O: ExtractionOracle + ?Sized> Consolidator<'a, S, O> {
    pub fn new(store: &'a S, oracle: &'a O, config: &'a ConsolidationConfig) -> Self {
        Self {
            store,
            oracle,
            config,
        }
    }

    pub fn run(&self, request: &ConsolidationRequest) -> Result<BatchSummary, ConsolidationError> {
        request.validate()?;
        let start = Instant::now();
        let batch_id = Uuid::new_v4();
        let event = SourceEvent::from_request(request, Utc::now().date_naive());

        let existing = self
            .store
            .load_existing(&event.patient_id, event.entity_type)?;

        let proposals = {
            let oracle_request = OracleRequest {
                patient_id: &event.patient_id,
                entity_type: event.entity_type,
                existing: &existing,
                raw_text: &request.raw_text,
                source_ref: &event.source_ref,
                context: &request.clinical_context,
                event_date: event.event_date,
                recent_visits: self.config.recent_visits_in_context,
            };
            match self.oracle.propose(&oracle_request) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(
                        %batch_id,
                        entity_type = %event.entity_type,
                        source_ref = %event.source_ref,
                        error = %e,
                        "Oracle call failed, batch aborted"
                    );
                    return Err(e.into());
                }
            }
        };

        tracing::debug!(
            %batch_id,
            existing = existing.len(),
            accepted = proposals.accepted.len(),
            quarantined = proposals.quarantined.len(),
            "Oracle proposals received"
        );

        let mut summary = BatchSummary::new(batch_id, request);
        for quarantined in &proposals.quarantined {
            summary.record(rejected_report(quarantined));
        }

        let mut snapshot = WorkingSnapshot::new(existing);
        let writer = EntityWriter::new(self.store, self.config);
        let mut affected = BTreeSet::new();
        for change in &proposals.accepted {
            let report = self.apply_change(&mut snapshot, &writer, &event, change, &mut affected);
            summary.record(report);
        }

        summary.changes.sort_by_key(|report| report.index);
        summary.set_affected(&affected);
        summary.duration_ms = start.elapsed().as_millis() as u64;

        // Entity writes are already committed; a lost audit trail does not undo them.
        if let Err(e) = self.store.record_batch(&summary) {
            tracing::warn!(%batch_id, error = %e, "Failed to record batch audit");
        }

        tracing::info!(
            %batch_id,
            entity_type = %summary.entity_type,
            source_ref = %summary.source_ref,
            created = summary.created,
            updated = summary.updated,
            evolved = summary.evolved,
            resolved = summary.resolved,
            reactivated = summary.reactivated,
            unchanged = summary.unchanged,
            recovered_as_create = summary.recovered_as_create,
            skipped = summary.skipped,
            rejected = summary.rejected,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Consolidation batch complete"
        );

        Ok(summary)
    }

    fn apply_change(
        &self,
        snapshot: &mut WorkingSnapshot,
        writer: &EntityWriter<'_, S>,
        event: &SourceEvent,
        change: &ProposedChange,
        affected: &mut BTreeSet<Uuid>,
    ) -> ChangeReport {
        let proposed = change.action.kind();
        let resolution = MatchResolver::new(snapshot, event, self.config).resolve(change);

        let plan = match resolution.decision {
            Decision::Apply(plan) => plan,
            Decision::Skip(reason) => {
                return ChangeReport {
                    index: change.index,
                    proposed: Some(proposed),
                    applied: None,
                    outcome: ChangeOutcome::Skipped,
                    match_method: resolution.method,
                    entity_id: None,
                    recovery: None,
                    detail: Some(reason),
                };
            }
        };

        match writer.apply(snapshot, event, change, plan) {
            Ok(applied) => {
                affected.extend(applied.touched.iter().copied());
                ChangeReport {
                    index: change.index,
                    proposed: Some(proposed),
                    applied: Some(plan.kind()),
                    outcome: applied.outcome,
                    match_method: resolution.method,
                    entity_id: Some(applied.entity_id),
                    recovery: resolution.recovery,
                    detail: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    index = change.index,
                    action = %plan.kind(),
                    error = %e,
                    "Change failed, continuing batch"
                );
                ChangeReport {
                    index: change.index,
                    proposed: Some(proposed),
                    applied: Some(plan.kind()),
                    outcome: ChangeOutcome::Failed,
                    match_method: resolution.method,
                    entity_id: plan.target(),
                    recovery: resolution.recovery,
                    detail: Some(e.to_string()),
                }
            }
        }
    }
}

fn rejected_report(quarantined: &QuarantinedChange) -> ChangeReport {
    let proposed = quarantined
        .raw
        .get("action")
        .and_then(serde_json::Value::as_str)
        .and_then(ActionKind::parse);
    ChangeReport {
        index: quarantined.index,
        proposed,
        applied: None,
        outcome: ChangeOutcome::Rejected,
        match_method: MatchMethod::None,
        entity_id: None,
        recovery: None,
        detail: Some(quarantined.reason.clone()),
    }
}
