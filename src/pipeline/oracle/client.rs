use std::time::Instant;

use super::parser::{parse_proposals, ParseOptions};
use super::prompt::{build_system_prompt, build_user_prompt};
use super::sanitize::{sanitize_for_llm, strip_model_artifacts};
use super::types::{ExtractionOracle, LlmClient, OracleRequest, ProposalBatch};
use super::ExtractionFailure;

/// Extraction oracle backed by a text-generation model.
pub struct LlmExtractionOracle<C: LlmClient> {
    client: C,
    model: String,
    options: ParseOptions,
}

impl<C: LlmClient> LlmExtractionOracle<C> {
    pub fn new(client: C, model: &str, options: ParseOptions) -> Self {
        Self {
            client,
            model: model.to_string(),
            options,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl<C: LlmClient> ExtractionOracle for LlmExtractionOracle<C> {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<ProposalBatch, ExtractionFailure> {
        let start = Instant::now();
        let text = sanitize_for_llm(request.raw_text, request.source_ref);
        let system = build_system_prompt(request.entity_type);
        let prompt = build_user_prompt(request, &text);

        tracing::debug!(
            entity_type = %request.entity_type,
            source_ref = %request.source_ref,
            existing = request.existing.len(),
            prompt_chars = prompt.len(),
            model = %self.model,
            "Calling extraction oracle"
        );

        let raw = self.client.generate(&self.model, &prompt, &system)?;
        let cleaned = strip_model_artifacts(&raw);
        let batch = parse_proposals(&cleaned, request.entity_type, &self.options)?;

        tracing::info!(
            entity_type = %request.entity_type,
            accepted = batch.accepted.len(),
            quarantined = batch.quarantined.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Oracle proposals parsed"
        );

        Ok(batch)
    }
}
