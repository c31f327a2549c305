//! Prompt construction for the extraction oracle.

use super::types::OracleRequest;
use crate::models::enums::EntityType;
use crate::models::CanonicalEntity;

/// Longest visit note quoted back to the oracle as context.
const CONTEXT_NOTE_CHARS: usize = 160;

pub fn build_system_prompt(entity_type: EntityType) -> String {
    format!(
        "You are a clinical chart consolidation assistant. You read clinical text and \
propose changes to the patient's {} list. You never invent facts that are not in \
the text. Output valid JSON only.",
        type_label(entity_type)
    )
}

/// Build the user prompt: rules, existing entities, clinical context, text.
pub fn build_user_prompt(request: &OracleRequest<'_>, sanitized_text: &str) -> String {
    let context = request.context;
    let active_problems = join_or_none(&context.active_problems);
    let allergies = join_or_none(&context.allergies);
    let dob = context
        .date_of_birth
        .map(|d| d.to_string())
        .unwrap_or_else(|| "unknown".into());

    format!(
        "Compare the clinical text with the patient's existing {label} list \
and propose changes.\n\n\
ACTIONS:\n\
- CREATE: a {singular} not present in the existing list.\n\
- ADD_VISIT: the text mentions an existing {singular}; set matched_entity_id to its id.\n\
- EVOLVE: an existing {singular} has progressed into a more specific or different one \
(for example a new code); set transfer_from_entity_id to the old id and give the new attributes.\n\
- RESOLVE: the text states an existing {singular} is resolved, stopped or no longer present.\n\
- REACTIVATE: a resolved {singular} has returned.\n\n\
RULES:\n\
- Only use ids from the existing list. Never make up ids.\n\
- One change per {singular}. Do not repeat a {singular}.\n\
- {attribute_rules}\n\
- Dates use YYYY-MM-DD. confidence is a number between 0 and 1.\n\
- note is a short clinical summary of what the text says about this {singular}.\n\
- reasoning explains why you chose the action and the match.\n\n\
EXISTING {upper}:\n{existing}\n\n\
PATIENT CONTEXT:\n\
- Date of birth: {dob}\n\
- Sex: {sex}\n\
- Active problems: {active_problems}\n\
- Allergies: {allergies}\n\
- Event date: {event_date}\n\n\
<clinical_text>\n{text}\n</clinical_text>\n\n\
Respond with JSON in this exact shape:\n\
{{\"changes\": [{{\"action\": \"CREATE|ADD_VISIT|EVOLVE|RESOLVE|REACTIVATE\", \
\"matched_entity_id\": null, \"transfer_from_entity_id\": null, \"title\": \"\", \
\"code\": null, \"body_region\": null, \"detail\": null, \"effective_date\": null, \
\"extracted_date\": null, \"note\": \"\", \"confidence\": 0.0, \
\"source_type\": null, \"reasoning\": \"\"}}]}}\n\
If nothing applies, respond with {{\"changes\": []}}.",
        label = type_label(request.entity_type),
        singular = type_singular(request.entity_type),
        upper = type_label(request.entity_type).to_uppercase(),
        attribute_rules = attribute_rules(request.entity_type),
        existing = format_existing(request.existing, request.recent_visits),
        sex = context.sex.as_deref().unwrap_or("unknown"),
        event_date = request.event_date,
        text = sanitized_text,
    )
}

fn type_label(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Problem => "problem",
        EntityType::Medication => "medication",
        EntityType::Imaging => "imaging study",
        EntityType::Lab => "lab result",
    }
}

fn type_singular(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Problem => "problem",
        EntityType::Medication => "medication",
        EntityType::Imaging => "study",
        EntityType::Lab => "lab result",
    }
}

fn attribute_rules(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Problem => {
            "title is the problem name; code is the ICD-10 code if known; \
             detail holds severity or qualifiers."
        }
        EntityType::Medication => {
            "title is the generic drug name; code is the RxNorm code if known; \
             detail holds dose and frequency."
        }
        EntityType::Imaging => {
            "title is the modality (CT, MRI, X-ray, ultrasound); body_region is required; \
effective_date is the study date; detail holds the impression."
        }
        EntityType::Lab => {
            "title is the test name; code is the LOINC code if known; effective_date is the \
collection date; detail holds the value with units."
        }
    }
}

/// One block per existing entity, live ones first.
fn format_existing(existing: &[CanonicalEntity], recent_visits: usize) -> String {
    if existing.is_empty() {
        return "None recorded".to_string();
    }

    let mut ordered: Vec<&CanonicalEntity> = existing.iter().collect();
    ordered.sort_by_key(|e| !e.status.is_live());

    ordered
        .iter()
        .map(|e| {
            let mut block = format!(
                "[id={}] status={} | title={} | code={} | body_region={} | date={}",
                e.id,
                e.status,
                e.attributes.title,
                e.attributes.code.as_deref().unwrap_or("-"),
                e.attributes.body_region.as_deref().unwrap_or("-"),
                e.attributes
                    .effective_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into()),
            );
            for visit in e.recent_visits(recent_visits) {
                block.push_str(&format!(
                    "\n    - {} ({} {}): {}",
                    visit.date,
                    visit.source_type,
                    visit.source_ref,
                    truncate_chars(&visit.note, CONTEXT_NOTE_CHARS)
                ));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "None recorded".to_string()
    } else {
        items.join(", ")
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{EntityStatus, SourceType};
    use crate::models::{EntityAttributes, VisitHistoryEntry};
    use crate::pipeline::oracle::types::ClinicalContext;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn entity(title: &str, status: EntityStatus, visits: usize) -> CanonicalEntity {
        let mut e = CanonicalEntity::new(
            "patient-1",
            EntityType::Problem,
            EntityAttributes {
                title: title.into(),
                code: Some("I10".into()),
                ..Default::default()
            },
            status,
            VisitHistoryEntry {
                date: date(2023, 1, 1),
                note: "visit 0".into(),
                source_type: SourceType::Encounter,
                source_ref: "enc-0".into(),
                confidence: 0.9,
                reasoning: String::new(),
            },
            date(2023, 1, 1).and_hms_opt(0, 0, 0).unwrap(),
        );
        for i in 1..visits {
            e.visit_history.push(VisitHistoryEntry {
                date: date(2023, 1, 1 + i as u32),
                note: format!("visit {i}"),
                source_type: SourceType::Encounter,
                source_ref: format!("enc-{i}"),
                confidence: 0.9,
                reasoning: String::new(),
            });
        }
        e
    }

    fn request<'a>(
        existing: &'a [CanonicalEntity],
        context: &'a ClinicalContext,
    ) -> OracleRequest<'a> {
        OracleRequest {
            patient_id: "patient-1",
            entity_type: EntityType::Problem,
            existing,
            raw_text: "unused",
            source_ref: "enc-9",
            context,
            event_date: date(2024, 5, 2),
            recent_visits: 2,
        }
    }

    #[test]
    fn prompt_lists_existing_ids_and_recent_visits_only() {
        let existing = vec![entity("Hypertension", EntityStatus::Active, 4)];
        let context = ClinicalContext::default();
        let prompt = build_user_prompt(&request(&existing, &context), "BP controlled.");

        assert!(prompt.contains(&format!("[id={}]", existing[0].id)));
        assert!(prompt.contains("visit 3"));
        assert!(prompt.contains("visit 2"));
        assert!(!prompt.contains("visit 1:"));
        assert!(prompt.contains("<clinical_text>\nBP controlled.\n</clinical_text>"));
        assert!(prompt.contains("Event date: 2024-05-02"));
    }

    #[test]
    fn prompt_handles_empty_list() {
        let context = ClinicalContext {
            allergies: vec!["Penicillin".into()],
            ..Default::default()
        };
        let prompt = build_user_prompt(&request(&[], &context), "text");
        assert!(prompt.contains("EXISTING PROBLEM:\nNone recorded"));
        assert!(prompt.contains("Allergies: Penicillin"));
    }

    #[test]
    fn live_entities_listed_before_closed_ones() {
        let existing = vec![
            entity("Old fracture", EntityStatus::Resolved, 1),
            entity("Asthma", EntityStatus::Active, 1),
        ];
        let context = ClinicalContext::default();
        let prompt = build_user_prompt(&request(&existing, &context), "text");
        let asthma = prompt.find("Asthma").unwrap();
        let fracture = prompt.find("Old fracture").unwrap();
        assert!(asthma < fracture);
    }

    #[test]
    fn imaging_system_prompt_mentions_type() {
        assert!(build_system_prompt(EntityType::Imaging).contains("imaging study"));
        assert!(attribute_rules(EntityType::Imaging).contains("body_region is required"));
    }

    #[test]
    fn long_notes_are_truncated() {
        let long = "x".repeat(500);
        let out = truncate_chars(&long, CONTEXT_NOTE_CHARS);
        assert_eq!(out.chars().count(), CONTEXT_NOTE_CHARS);
        assert!(out.ends_with("..."));
    }
}
