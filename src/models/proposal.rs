use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::EntityAttributes;
use super::enums::SourceType;

/// What the oracle wants done, with the fields each action requires.
///
/// Referenced ids stay as the raw strings the oracle produced: whether they
/// point at a real entity is the resolver's question, not the parser's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    AddVisit { matched_entity_id: Option<String> },
    Evolve { transfer_from_entity_id: String },
    Resolve { matched_entity_id: Option<String> },
    Reactivate { matched_entity_id: Option<String> },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create => ActionKind::Create,
            Self::AddVisit { .. } => ActionKind::AddVisit,
            Self::Evolve { .. } => ActionKind::Evolve,
            Self::Resolve { .. } => ActionKind::Resolve,
            Self::Reactivate { .. } => ActionKind::Reactivate,
        }
    }

    /// The entity id this action points at, if any.
    pub fn referenced_id(&self) -> Option<&str> {
        match self {
            Self::Create => None,
            Self::AddVisit { matched_entity_id }
            | Self::Resolve { matched_entity_id }
            | Self::Reactivate { matched_entity_id } => matched_entity_id.as_deref(),
            Self::Evolve { transfer_from_entity_id } => Some(transfer_from_entity_id.as_str()),
        }
    }
}

/// Payload-free action tag, used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Create,
    AddVisit,
    Evolve,
    Resolve,
    Reactivate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::AddVisit => "ADD_VISIT",
            Self::Evolve => "EVOLVE",
            Self::Resolve => "RESOLVE",
            Self::Reactivate => "REACTIVATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "CREATE" | "NEW" => Some(Self::Create),
            "ADD_VISIT" | "ADDVISIT" | "UPDATE" => Some(Self::AddVisit),
            "EVOLVE" => Some(Self::Evolve),
            "RESOLVE" => Some(Self::Resolve),
            "REACTIVATE" => Some(Self::Reactivate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated change proposed by the extraction oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedChange {
    /// Position in the oracle's response, kept for audit.
    pub index: usize,
    #[serde(flatten)]
    pub action: Action,
    pub attributes: EntityAttributes,
    pub extracted_date: Option<NaiveDate>,
    pub note: String,
    pub confidence: f32,
    pub source_type: Option<SourceType>,
    pub reasoning: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parses_loose_spellings() {
        assert_eq!(ActionKind::parse("add_visit"), Some(ActionKind::AddVisit));
        assert_eq!(ActionKind::parse("Add Visit"), Some(ActionKind::AddVisit));
        assert_eq!(ActionKind::parse(" EVOLVE "), Some(ActionKind::Evolve));
        assert_eq!(ActionKind::parse("delete"), None);
    }

    #[test]
    fn referenced_id_per_action() {
        assert_eq!(Action::Create.referenced_id(), None);
        let evolve = Action::Evolve { transfer_from_entity_id: "abc".into() };
        assert_eq!(evolve.referenced_id(), Some("abc"));
        let visit = Action::AddVisit { matched_entity_id: None };
        assert_eq!(visit.referenced_id(), None);
    }
}
