use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ConsolidationError;
use crate::models::enums::{EntityType, SourceType};
use crate::models::ActionKind;
use crate::pipeline::oracle::{ClinicalContext, ParseOptions};

// ═══════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Model the oracle is asked to run (e.g., "medgemma:4b").
    pub model_name: String,
    /// Structural matches on imaging and labs accept dates this many days apart.
    pub date_tolerance_days: i64,
    /// Confidence given to changes the oracle did not score.
    pub default_confidence: f32,
    /// New entities below this confidence start as `pending_review`.
    /// `None` disables review flagging.
    pub review_confidence_floor: Option<f32>,
    /// Oracle records past this count are quarantined.
    pub max_changes_per_batch: usize,
    /// Visits per existing entity included in the oracle context.
    pub recent_visits_in_context: usize,
    /// Oracle HTTP timeout.
    pub oracle_timeout_secs: u64,
    /// Hops followed along `superseded_by` before giving up.
    pub max_lineage_depth: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            model_name: "medgemma:4b".to_string(),
            date_tolerance_days: 7,
            default_confidence: 0.5,
            review_confidence_floor: None,
            max_changes_per_batch: 50,
            recent_visits_in_context: 3,
            oracle_timeout_secs: 120,
            max_lineage_depth: 16,
        }
    }
}

impl ConsolidationConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            default_confidence: self.default_confidence,
            max_changes: self.max_changes_per_batch,
        }
    }
}

// ═══════════════════════════════════════════
// Request
// ═══════════════════════════════════════════

/// One source event to consolidate into a patient's chart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationRequest {
    pub patient_id: String,
    pub entity_type: EntityType,
    pub raw_text: String,
    pub source_type: SourceType,
    pub source_ref: String,
    /// Date of the source event; today when absent.
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    #[serde(default)]
    pub clinical_context: ClinicalContext,
}

impl ConsolidationRequest {
    pub fn new(
        patient_id: &str,
        entity_type: EntityType,
        raw_text: &str,
        source_type: SourceType,
        source_ref: &str,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            entity_type,
            raw_text: raw_text.to_string(),
            source_type,
            source_ref: source_ref.to_string(),
            event_date: None,
            clinical_context: ClinicalContext::default(),
        }
    }

    pub fn with_event_date(mut self, date: NaiveDate) -> Self {
        self.event_date = Some(date);
        self
    }

    pub fn with_context(mut self, context: ClinicalContext) -> Self {
        self.clinical_context = context;
        self
    }

    pub fn validate(&self) -> Result<(), ConsolidationError> {
        if self.patient_id.trim().is_empty() {
            return Err(ConsolidationError::InvalidRequest("patient_id is empty".into()));
        }
        if self.source_ref.trim().is_empty() {
            return Err(ConsolidationError::InvalidRequest("source_ref is empty".into()));
        }
        if self.raw_text.trim().is_empty() {
            return Err(ConsolidationError::InvalidRequest("raw_text is empty".into()));
        }
        Ok(())
    }
}

/// The source event a batch is attributed to, with its date resolved.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub patient_id: String,
    pub entity_type: EntityType,
    pub source_type: SourceType,
    pub source_ref: String,
    pub event_date: NaiveDate,
}

impl SourceEvent {
    pub fn from_request(request: &ConsolidationRequest, today: NaiveDate) -> Self {
        Self {
            patient_id: request.patient_id.clone(),
            entity_type: request.entity_type,
            source_type: request.source_type,
            source_ref: request.source_ref.clone(),
            event_date: request.event_date.unwrap_or(today),
        }
    }
}

// ═══════════════════════════════════════════
// Per-change reporting
// ═══════════════════════════════════════════

/// How a change found (or failed to find) its target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ReferencedId,
    Lineage,
    Structural,
    None,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReferencedId => "referenced_id",
            Self::Lineage => "lineage",
            Self::Structural => "structural",
            Self::None => "none",
        }
    }
}

/// Audit note attached when the resolver changed what the oracle asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryNote {
    /// ADD_VISIT or EVOLVE target missing; a new entity was created instead.
    RecoveredAsCreate,
    /// CREATE matched a live entity and became a visit on it.
    MergedIntoExisting,
    /// EVOLVE already applied earlier; recorded as a visit on the successor.
    ReappliedEvolve,
}

impl RecoveryNote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecoveredAsCreate => "recovered_as_create",
            Self::MergedIntoExisting => "merged_into_existing",
            Self::ReappliedEvolve => "reapplied_evolve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    Created,
    Updated,
    Evolved,
    Resolved,
    Reactivated,
    /// Matched and valid, but the chart already said exactly this.
    Unchanged,
    Skipped,
    /// Quarantined at the oracle boundary.
    Rejected,
    Failed,
}

impl ChangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Evolved => "evolved",
            Self::Resolved => "resolved",
            Self::Reactivated => "reactivated",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// What happened to one oracle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub index: usize,
    /// Action the oracle proposed (absent for unreadable records).
    pub proposed: Option<ActionKind>,
    /// Action actually applied after resolution.
    pub applied: Option<ActionKind>,
    pub outcome: ChangeOutcome,
    pub match_method: MatchMethod,
    pub entity_id: Option<Uuid>,
    pub recovery: Option<RecoveryNote>,
    /// Skip/reject/failure reason.
    pub detail: Option<String>,
}

// ═══════════════════════════════════════════
// Batch summary
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub patient_id: String,
    pub entity_type: EntityType,
    pub source_type: SourceType,
    pub source_ref: String,
    pub created: u32,
    pub updated: u32,
    pub evolved: u32,
    pub resolved: u32,
    pub reactivated: u32,
    pub unchanged: u32,
    /// Subset of `created` that began as ADD_VISIT or EVOLVE.
    pub recovered_as_create: u32,
    pub skipped: u32,
    pub rejected: u32,
    pub failed: u32,
    /// Distinct entities written by this batch.
    pub entities_affected: u32,
    pub changes: Vec<ChangeReport>,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn new(batch_id: Uuid, request: &ConsolidationRequest) -> Self {
        Self {
            batch_id,
            patient_id: request.patient_id.clone(),
            entity_type: request.entity_type,
            source_type: request.source_type,
            source_ref: request.source_ref.clone(),
            created: 0,
            updated: 0,
            evolved: 0,
            resolved: 0,
            reactivated: 0,
            unchanged: 0,
            recovered_as_create: 0,
            skipped: 0,
            rejected: 0,
            failed: 0,
            entities_affected: 0,
            changes: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Count a report and keep it.
    pub fn record(&mut self, report: ChangeReport) {
        match report.outcome {
            ChangeOutcome::Created => self.created += 1,
            ChangeOutcome::Updated => self.updated += 1,
            ChangeOutcome::Evolved => self.evolved += 1,
            ChangeOutcome::Resolved => self.resolved += 1,
            ChangeOutcome::Reactivated => self.reactivated += 1,
            ChangeOutcome::Unchanged => self.unchanged += 1,
            ChangeOutcome::Skipped => self.skipped += 1,
            ChangeOutcome::Rejected => self.rejected += 1,
            ChangeOutcome::Failed => self.failed += 1,
        }
        if report.recovery == Some(RecoveryNote::RecoveredAsCreate)
            && report.outcome == ChangeOutcome::Created
        {
            self.recovered_as_create += 1;
        }
        self.changes.push(report);
    }

    pub fn set_affected(&mut self, affected: &BTreeSet<Uuid>) {
        self.entities_affected = affected.len() as u32;
    }

    /// Changes that reached the store (or would have, had nothing changed).
    pub fn applied_count(&self) -> u32 {
        self.created
            + self.updated
            + self.evolved
            + self.resolved
            + self.reactivated
            + self.unchanged
    }
}
