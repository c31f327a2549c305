//! Visit-history merging.
//!
//! Histories are kept in (date, source_type, source_ref) order, the same order
//! the store reads them back in. One entry per source key.

use std::cmp::Ordering;

use crate::models::{VisitHistoryEntry, VisitUpsert};

/// Total order over visit entries.
pub fn visit_order(a: &VisitHistoryEntry, b: &VisitHistoryEntry) -> Ordering {
    a.date
        .cmp(&b.date)
        .then_with(|| a.source_type.as_str().cmp(b.source_type.as_str()))
        .then_with(|| a.source_ref.cmp(&b.source_ref))
}

pub fn sort_history(history: &mut [VisitHistoryEntry]) {
    history.sort_by(visit_order);
}

/// Decide how `entry` lands in `history` without touching it.
/// `None` means an identical entry from the same source is already there.
pub fn plan_visit(history: &[VisitHistoryEntry], entry: &VisitHistoryEntry) -> Option<VisitUpsert> {
    match history.iter().find(|existing| existing.same_source(entry)) {
        Some(existing) if existing == entry => None,
        Some(_) => Some(VisitUpsert::Replace(entry.clone())),
        None => Some(VisitUpsert::Append(entry.clone())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Replaced,
    Unchanged,
}

/// Merge `entry` into `history`, replacing the entry with the same source key.
pub fn merge_visit(history: &mut Vec<VisitHistoryEntry>, entry: VisitHistoryEntry) -> MergeOutcome {
    let outcome = match history.iter().position(|existing| existing.same_source(&entry)) {
        Some(i) if history[i] == entry => return MergeOutcome::Unchanged,
        Some(i) => {
            history[i] = entry;
            MergeOutcome::Replaced
        }
        None => {
            history.push(entry);
            MergeOutcome::Appended
        }
    };
    sort_history(history);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::SourceType;
    use chrono::NaiveDate;

    fn entry(day: u32, source_type: SourceType, source_ref: &str, note: &str) -> VisitHistoryEntry {
        VisitHistoryEntry {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            note: note.into(),
            source_type,
            source_ref: source_ref.into(),
            confidence: 0.7,
            reasoning: String::new(),
        }
    }

    #[test]
    fn appends_in_chronological_order() {
        let mut history = vec![
            entry(1, SourceType::Encounter, "e1", "a"),
            entry(20, SourceType::Encounter, "e3", "c"),
        ];
        let outcome = merge_visit(&mut history, entry(10, SourceType::Encounter, "e2", "b"));
        assert_eq!(outcome, MergeOutcome::Appended);
        let refs: Vec<&str> = history.iter().map(|e| e.source_ref.as_str()).collect();
        assert_eq!(refs, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn same_source_replaces_in_place() {
        let mut history = vec![entry(1, SourceType::Encounter, "e1", "first read")];
        let outcome =
            merge_visit(&mut history, entry(2, SourceType::Encounter, "e1", "second read"));
        assert_eq!(outcome, MergeOutcome::Replaced);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].note, "second read");
    }

    #[test]
    fn identical_entry_is_unchanged() {
        let mut history = vec![entry(1, SourceType::Encounter, "e1", "same")];
        assert_eq!(plan_visit(&history, &entry(1, SourceType::Encounter, "e1", "same")), None);
        let outcome = merge_visit(&mut history, entry(1, SourceType::Encounter, "e1", "same"));
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn same_ref_different_source_type_is_a_new_entry() {
        let history = vec![entry(1, SourceType::Encounter, "42", "note")];
        let planned = plan_visit(&history, &entry(1, SourceType::Attachment, "42", "note"));
        assert!(matches!(planned, Some(VisitUpsert::Append(_))));
    }

    #[test]
    fn same_day_ties_break_on_source_key() {
        let mut history = Vec::new();
        merge_visit(&mut history, entry(5, SourceType::Manual, "m1", ""));
        merge_visit(&mut history, entry(5, SourceType::Encounter, "e9", ""));
        merge_visit(&mut history, entry(5, SourceType::Attachment, "a1", ""));
        merge_visit(&mut history, entry(5, SourceType::Encounter, "e1", ""));
        let keys: Vec<(&str, &str)> = history
            .iter()
            .map(|e| (e.source_type.as_str(), e.source_ref.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("attachment", "a1"), ("encounter", "e1"), ("encounter", "e9"), ("manual", "m1")]
        );
    }
}
