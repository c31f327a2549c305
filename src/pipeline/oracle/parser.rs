//! Lenient parsing and boundary validation of oracle output.
//!
//! Every field of a raw record is optional on the wire. Records that cannot
//! become a well-formed `ProposedChange` are quarantined with a reason; only
//! a response that is not JSON at all (or has no change list) fails the call.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::types::{ProposalBatch, QuarantinedChange};
use super::ExtractionFailure;
use crate::models::enums::{EntityType, SourceType};
use crate::models::{Action, ActionKind, EntityAttributes, ProposedChange};

/// Knobs for turning raw records into proposals.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Confidence assigned when the oracle omits one.
    pub default_confidence: f32,
    /// Records past this position are quarantined.
    pub max_changes: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            default_confidence: 0.5,
            max_changes: 50,
        }
    }
}

/// Raw record as the oracle wrote it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProposedChange {
    #[serde(deserialize_with = "flexible_string")]
    action: Option<String>,
    #[serde(alias = "matchedEntityId", deserialize_with = "flexible_string")]
    matched_entity_id: Option<String>,
    #[serde(alias = "transferFromEntityId", deserialize_with = "flexible_string")]
    transfer_from_entity_id: Option<String>,
    #[serde(alias = "name", deserialize_with = "flexible_string")]
    title: Option<String>,
    #[serde(alias = "new_code", alias = "newCode", deserialize_with = "flexible_string")]
    code: Option<String>,
    #[serde(alias = "bodyRegion", deserialize_with = "flexible_string")]
    body_region: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    detail: Option<String>,
    #[serde(alias = "effectiveDate", deserialize_with = "flexible_string")]
    effective_date: Option<String>,
    #[serde(alias = "extractedDate", deserialize_with = "flexible_string")]
    extracted_date: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    note: Option<String>,
    #[serde(deserialize_with = "flexible_confidence")]
    confidence: Option<f32>,
    #[serde(alias = "sourceType", deserialize_with = "flexible_string")]
    source_type: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    reasoning: Option<String>,
}

/// Accept strings and numbers; anything else (null, objects) reads as absent.
/// Blank strings are absent too.
fn flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Confidence as a number, a numeric string, or a percentage. Values above 1
/// are read as percentages; the result is clamped to [0, 1].
fn flexible_confidence<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            match trimmed.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok().map(|v| v / 100.0),
                None => trimmed.parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    Ok(raw.filter(|v| v.is_finite()).map(normalize_confidence))
}

fn normalize_confidence(value: f64) -> f32 {
    let scaled = if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    };
    scaled.clamp(0.0, 1.0) as f32
}

/// Extract a JSON block from LLM response text.
/// Handles fenced blocks and text before/after the JSON.
pub fn extract_json_block(response: &str) -> Result<&str, ExtractionFailure> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Ok(block);
            }
        }
    }

    // Whichever opener comes first decides object vs bare array.
    let object = trimmed.find('{').zip(trimmed.rfind('}'));
    let array = trimmed.find('[').zip(trimmed.rfind(']'));
    let span = match (object, array) {
        (Some(o), Some(a)) => Some(if a.0 < o.0 { a } else { o }),
        (o, a) => o.or(a),
    };
    if let Some((start, end)) = span {
        if start < end {
            return Ok(&trimmed[start..=end]);
        }
    }

    Err(ExtractionFailure::MalformedResponse(
        "No JSON block found in oracle response".to_string(),
    ))
}

/// Parse a full oracle response into accepted and quarantined changes.
pub fn parse_proposals(
    response: &str,
    entity_type: EntityType,
    options: &ParseOptions,
) -> Result<ProposalBatch, ExtractionFailure> {
    let json_str = extract_json_block(response)?;
    let root: Value = serde_json::from_str(json_str)
        .map_err(|e| ExtractionFailure::JsonParsing(e.to_string()))?;

    let records = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("changes") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(ExtractionFailure::MalformedResponse(
                    "\"changes\" is not an array".to_string(),
                ))
            }
            None => {
                return Err(ExtractionFailure::MalformedResponse(
                    "Response has no \"changes\" list".to_string(),
                ))
            }
        },
        _ => {
            return Err(ExtractionFailure::MalformedResponse(
                "Response is neither an object nor an array".to_string(),
            ))
        }
    };

    let mut batch = ProposalBatch::default();
    for (index, raw) in records.into_iter().enumerate() {
        if index >= options.max_changes {
            batch.quarantined.push(QuarantinedChange {
                index,
                reason: format!("exceeds batch limit of {}", options.max_changes),
                raw,
            });
            continue;
        }
        match validate_record(index, &raw, entity_type, options) {
            Ok(change) => batch.accepted.push(change),
            Err(reason) => batch.quarantined.push(QuarantinedChange { index, reason, raw }),
        }
    }

    Ok(batch)
}

fn validate_record(
    index: usize,
    raw: &Value,
    entity_type: EntityType,
    options: &ParseOptions,
) -> Result<ProposedChange, String> {
    if !raw.is_object() {
        return Err("record is not an object".to_string());
    }
    let record = RawProposedChange::deserialize(raw)
        .map_err(|e| format!("unreadable record: {e}"))?;

    let kind = match record.action.as_deref() {
        None => return Err("missing action".to_string()),
        Some(a) => ActionKind::parse(a).ok_or_else(|| format!("unknown action '{a}'"))?,
    };

    let title = record.title.clone();
    let matched = record.matched_entity_id.clone();

    let action = match kind {
        ActionKind::Create => {
            require_title(kind, &title)?;
            if entity_type == EntityType::Imaging && record.body_region.is_none() {
                return Err("imaging CREATE without body region".to_string());
            }
            Action::Create
        }
        ActionKind::Evolve => {
            // The successor may inherit the title when only the code moves on.
            if title.is_none() && record.code.is_none() {
                return Err("EVOLVE without title or code".to_string());
            }
            let transfer_from_entity_id = record
                .transfer_from_entity_id
                .clone()
                .ok_or_else(|| "EVOLVE without transfer_from_entity_id".to_string())?;
            Action::Evolve { transfer_from_entity_id }
        }
        ActionKind::AddVisit | ActionKind::Resolve | ActionKind::Reactivate => {
            if matched.is_none() && title.is_none() {
                return Err(format!("{kind} without matched_entity_id or title"));
            }
            match kind {
                ActionKind::AddVisit => Action::AddVisit { matched_entity_id: matched },
                ActionKind::Resolve => Action::Resolve { matched_entity_id: matched },
                _ => Action::Reactivate { matched_entity_id: matched },
            }
        }
    };

    let extracted_date =
        parse_date_field(index, "extracted_date", record.extracted_date.as_deref());
    let mut effective_date =
        parse_date_field(index, "effective_date", record.effective_date.as_deref());
    if effective_date.is_none() && entity_type.is_date_bearing() {
        effective_date = extracted_date;
    }

    let source_type = record.source_type.as_deref().and_then(|s| {
        let parsed = s.to_ascii_lowercase().parse::<SourceType>().ok();
        if parsed.is_none() {
            tracing::debug!(index, source_type = %s, "Ignoring unknown source type hint");
        }
        parsed
    });

    Ok(ProposedChange {
        index,
        action,
        attributes: EntityAttributes {
            title: title.unwrap_or_default(),
            code: record.code,
            body_region: record.body_region,
            detail: record.detail,
            effective_date,
        },
        extracted_date,
        note: record.note.unwrap_or_default(),
        confidence: record.confidence.unwrap_or(options.default_confidence),
        source_type,
        reasoning: record.reasoning.unwrap_or_default(),
    })
}

fn require_title(kind: ActionKind, title: &Option<String>) -> Result<(), String> {
    if title.is_none() {
        return Err(format!("{kind} without title"));
    }
    Ok(())
}

/// `YYYY-MM-DD`, or the date prefix of an ISO timestamp. Unparseable dates are
/// dropped, not fatal to the record.
fn parse_date_field(index: usize, field: &str, value: Option<&str>) -> Option<NaiveDate> {
    let value = value?;
    let candidate = value.get(..10).unwrap_or(value);
    match NaiveDate::parse_from_str(candidate, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            tracing::warn!(index, field, "Dropping unparseable date from oracle record");
            None
        }
    }
}
