//! Deterministic normalization of key attributes for structural matching.
//!
//! Lowercase, punctuation to spaces, whitespace collapsed, then a per-type
//! synonym table maps abbreviations, brand names and alternate spellings to
//! one canonical form.

use crate::models::enums::EntityType;
use crate::models::EntityAttributes;

const PROBLEM_SYNONYMS: &[(&str, &str)] = &[
    ("htn", "hypertension"),
    ("high blood pressure", "hypertension"),
    ("essential hypertension", "hypertension"),
    ("t2dm", "type 2 diabetes"),
    ("dm2", "type 2 diabetes"),
    ("type 2 dm", "type 2 diabetes"),
    ("type ii diabetes", "type 2 diabetes"),
    ("type 2 diabetes mellitus", "type 2 diabetes"),
    ("diabetes mellitus type 2", "type 2 diabetes"),
    ("t1dm", "type 1 diabetes"),
    ("type 1 diabetes mellitus", "type 1 diabetes"),
    ("cad", "coronary artery disease"),
    ("copd", "chronic obstructive pulmonary disease"),
    ("chf", "congestive heart failure"),
    ("gerd", "gastroesophageal reflux disease"),
    ("acid reflux", "gastroesophageal reflux disease"),
    ("afib", "atrial fibrillation"),
    ("a fib", "atrial fibrillation"),
    ("hld", "hyperlipidemia"),
    ("high cholesterol", "hyperlipidemia"),
    ("ckd", "chronic kidney disease"),
    ("mi", "myocardial infarction"),
    ("heart attack", "myocardial infarction"),
    ("uti", "urinary tract infection"),
    ("oa", "osteoarthritis"),
    ("osa", "obstructive sleep apnea"),
    ("mdd", "major depressive disorder"),
];

const MEDICATION_SYNONYMS: &[(&str, &str)] = &[
    ("glucophage", "metformin"),
    ("lipitor", "atorvastatin"),
    ("zocor", "simvastatin"),
    ("crestor", "rosuvastatin"),
    ("norvasc", "amlodipine"),
    ("zestril", "lisinopril"),
    ("prinivil", "lisinopril"),
    ("synthroid", "levothyroxine"),
    ("levoxyl", "levothyroxine"),
    ("tylenol", "acetaminophen"),
    ("paracetamol", "acetaminophen"),
    ("advil", "ibuprofen"),
    ("motrin", "ibuprofen"),
    ("lasix", "furosemide"),
    ("coumadin", "warfarin"),
    ("eliquis", "apixaban"),
    ("xarelto", "rivaroxaban"),
    ("plavix", "clopidogrel"),
    ("prilosec", "omeprazole"),
    ("nexium", "esomeprazole"),
    ("ventolin", "albuterol"),
    ("proair", "albuterol"),
    ("salbutamol", "albuterol"),
    ("zoloft", "sertraline"),
    ("lexapro", "escitalopram"),
];

const IMAGING_SYNONYMS: &[(&str, &str)] = &[
    ("ct scan", "ct"),
    ("cat scan", "ct"),
    ("computed tomography", "ct"),
    ("mri scan", "mri"),
    ("magnetic resonance imaging", "mri"),
    ("mr", "mri"),
    ("x ray", "xray"),
    ("radiograph", "xray"),
    ("plain film", "xray"),
    ("us", "ultrasound"),
    ("sonogram", "ultrasound"),
    ("sonography", "ultrasound"),
    ("pet scan", "pet"),
    ("echo", "echocardiogram"),
];

const LAB_SYNONYMS: &[(&str, &str)] = &[
    ("a1c", "hemoglobin a1c"),
    ("hba1c", "hemoglobin a1c"),
    ("hgba1c", "hemoglobin a1c"),
    ("glycated hemoglobin", "hemoglobin a1c"),
    ("glycosylated hemoglobin", "hemoglobin a1c"),
    ("ldl", "ldl cholesterol"),
    ("ldl c", "ldl cholesterol"),
    ("hdl", "hdl cholesterol"),
    ("hdl c", "hdl cholesterol"),
    ("thyroid stimulating hormone", "tsh"),
    ("cbc", "complete blood count"),
    ("bmp", "basic metabolic panel"),
    ("cmp", "comprehensive metabolic panel"),
    ("cr", "creatinine"),
    ("serum creatinine", "creatinine"),
    ("blood glucose", "glucose"),
];

/// Dose and form words dropped from medication names.
const DOSE_UNITS: &[&str] = &[
    "mg", "mcg", "g", "ml", "units", "iu", "tab", "tabs", "tablet", "tablets", "cap", "caps",
    "capsule", "capsules", "er", "xr", "sr",
];

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical form of a title for the given entity type.
pub fn canonical_title(entity_type: EntityType, title: &str) -> String {
    let mut normalized = normalize(title);
    if entity_type == EntityType::Medication {
        normalized = strip_dose(&normalized);
    }
    lookup(entity_type, &normalized).unwrap_or(normalized)
}

/// Codes compare without case, whitespace or dots ("E11.9" == "e119").
pub fn canonical_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn lookup(entity_type: EntityType, normalized: &str) -> Option<String> {
    let table = match entity_type {
        EntityType::Problem => PROBLEM_SYNONYMS,
        EntityType::Medication => MEDICATION_SYNONYMS,
        EntityType::Imaging => IMAGING_SYNONYMS,
        EntityType::Lab => LAB_SYNONYMS,
    };
    table
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| canonical.to_string())
}

fn strip_dose(normalized: &str) -> String {
    normalized
        .split(' ')
        .filter(|token| {
            !token.starts_with(|c: char| c.is_ascii_digit()) && !DOSE_UNITS.contains(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized key attributes compared by the structural matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKey {
    pub title: String,
    pub code: Option<String>,
    pub body_region: Option<String>,
}

impl MatchKey {
    /// `None` when there is nothing to match on.
    pub fn from_attributes(entity_type: EntityType, attributes: &EntityAttributes) -> Option<Self> {
        let title = canonical_title(entity_type, &attributes.title);
        let code = attributes
            .code
            .as_deref()
            .map(canonical_code)
            .filter(|c| !c.is_empty());
        if title.is_empty() && code.is_none() {
            return None;
        }
        Some(Self {
            title,
            code,
            body_region: attributes
                .body_region
                .as_deref()
                .map(normalize)
                .filter(|r| !r.is_empty()),
        })
    }

    /// Same clinical fact: code equality decides when both sides carry a
    /// code, otherwise titles must agree. Body regions must agree when both
    /// are known.
    pub fn matches(&self, other: &MatchKey) -> bool {
        let same_fact = match (&self.code, &other.code) {
            (Some(a), Some(b)) => a == b,
            _ => !self.title.is_empty() && self.title == other.title,
        };
        let same_region = match (&self.body_region, &other.body_region) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same_fact && same_region
    }
}
