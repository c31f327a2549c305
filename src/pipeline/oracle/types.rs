use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ExtractionFailure;
use crate::models::enums::EntityType;
use crate::models::{CanonicalEntity, ProposedChange};

/// Patient context handed to the oracle for disambiguation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalContext {
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<String>,
    #[serde(default)]
    pub active_problems: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
}

/// Everything the oracle needs for one batch.
#[derive(Debug, Clone)]
pub struct OracleRequest<'a> {
    pub patient_id: &'a str,
    pub entity_type: EntityType,
    pub existing: &'a [CanonicalEntity],
    pub raw_text: &'a str,
    /// Source event the text came from; only used for log fields.
    pub source_ref: &'a str,
    pub context: &'a ClinicalContext,
    pub event_date: NaiveDate,
    /// How many of the most recent visits per entity to include.
    pub recent_visits: usize,
}

/// An oracle record that failed boundary validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedChange {
    pub index: usize,
    pub reason: String,
    pub raw: serde_json::Value,
}

/// Parsed oracle response: validated changes plus what was set aside.
#[derive(Debug, Clone, Default)]
pub struct ProposalBatch {
    pub accepted: Vec<ProposedChange>,
    pub quarantined: Vec<QuarantinedChange>,
}

impl ProposalBatch {
    pub fn len(&self) -> usize {
        self.accepted.len() + self.quarantined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proposes chart changes from raw clinical text.
///
/// Either a full, parseable batch comes back or the call fails; there are no
/// partial results.
pub trait ExtractionOracle: Send + Sync {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<ProposalBatch, ExtractionFailure>;
}

/// LLM text-generation abstraction (allows mocking).
pub trait LlmClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str)
        -> Result<String, ExtractionFailure>;
}
