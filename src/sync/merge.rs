// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field-level last-writer-wins merge.
//!
//! Only fields listed in the incoming `modifiedFields` take part. For each:
//!
//! | existing stamp | outcome |
//! |----------------|---------|
//! | absent | incoming wins |
//! | `>=` incoming | existing wins (ties go to existing) |
//! | `<` incoming | incoming wins |
//!
//! A winning field that has no incoming value is cleared. Fields missing from
//! the incoming map are never touched. The merged `modifiedFields` carries
//! the winning stamp for every field, so stamps never go backwards and
//! replaying the same incoming record is a no-op.

use crate::record::{Record, FULLY_SYNCED, ID_FIELD, MODIFIED_FIELDS};

/// Result of [`merge_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub record: Record,
    /// Fields taken from the incoming side
    pub accepted: Vec<String>,
    /// Fields where the existing value was kept
    pub rejected: Vec<String>,
}

impl MergeReport {
    /// Whether the merged record differs from the existing one.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.accepted.is_empty()
    }
}

#[must_use]
pub fn merge_record(existing: &Record, incoming: &Record) -> MergeReport {
    let mut merged = existing.clone();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for (field, incoming_at) in incoming.modified_fields.iter() {
        if is_reserved(field) {
            continue;
        }

        let incoming_wins = existing
            .modified_fields
            .get(field)
            .map_or(true, |existing_at| incoming_at > existing_at);

        if !incoming_wins {
            rejected.push(field.to_string());
            continue;
        }

        match incoming.get(field) {
            Some(value) => {
                merged.fields.insert(field.to_string(), value.clone());
            }
            None => {
                merged.fields.remove(field);
            }
        }
        merged.modified_fields.insert(field, incoming_at);
        accepted.push(field.to_string());
    }

    MergeReport {
        record: merged,
        accepted,
        rejected,
    }
}

fn is_reserved(field: &str) -> bool {
    field == ID_FIELD || field == MODIFIED_FIELDS || field == FULLY_SYNCED
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: serde_json::Value) -> Record {
        Record::from_json(fields).unwrap()
    }

    #[test]
    fn test_lww_per_field() {
        let existing = record(json!({
            "_id": "p1", "a": "existing-a", "b": "existing-b",
            "modifiedFields": {"a": 10, "b": 5}
        }));
        let incoming = record(json!({
            "_id": "p1", "a": "incoming-a", "b": "incoming-b",
            "modifiedFields": {"a": 7, "b": 8}
        }));

        let report = merge_record(&existing, &incoming);

        assert_eq!(report.record.get("a"), Some(&json!("existing-a")));
        assert_eq!(report.record.get("b"), Some(&json!("incoming-b")));
        assert_eq!(report.record.modified_fields.get("a"), Some(10));
        assert_eq!(report.record.modified_fields.get("b"), Some(8));
        assert_eq!(report.accepted, vec!["b"]);
        assert_eq!(report.rejected, vec!["a"]);
    }

    #[test]
    fn test_ties_go_to_existing() {
        let existing = record(json!({"_id": "p1", "a": 1, "modifiedFields": {"a": 10}}));
        let incoming = record(json!({"_id": "p1", "a": 2, "modifiedFields": {"a": 10}}));

        let report = merge_record(&existing, &incoming);
        assert_eq!(report.record.get("a"), Some(&json!(1)));
        assert!(!report.changed());
    }

    #[test]
    fn test_unstamped_existing_field_loses() {
        let existing = record(json!({"_id": "p1", "a": 1}));
        let incoming = record(json!({"_id": "p1", "a": 2, "modifiedFields": {"a": 1}}));

        let report = merge_record(&existing, &incoming);
        assert_eq!(report.record.get("a"), Some(&json!(2)));
        assert_eq!(report.record.modified_fields.get("a"), Some(1));
    }

    #[test]
    fn test_fields_outside_incoming_map_untouched() {
        let existing = record(json!({"_id": "p1", "a": 1, "b": 1, "modifiedFields": {"a": 1}}));
        let incoming = record(json!({"_id": "p1", "a": 2, "b": 99, "c": 99, "modifiedFields": {"a": 5}}));

        let report = merge_record(&existing, &incoming);
        assert_eq!(report.record.get("b"), Some(&json!(1)));
        assert!(report.record.get("c").is_none());
        assert_eq!(report.accepted, vec!["a"]);
    }

    #[test]
    fn test_winning_absent_value_clears_field() {
        let existing = record(json!({"_id": "p1", "nickname": "Addy", "modifiedFields": {"nickname": 1}}));
        let incoming = record(json!({"_id": "p1", "modifiedFields": {"nickname": 2}}));

        let report = merge_record(&existing, &incoming);
        assert!(report.record.get("nickname").is_none());
        assert_eq!(report.record.modified_fields.get("nickname"), Some(2));
    }

    #[test]
    fn test_replay_is_noop() {
        let existing = record(json!({"_id": "p1", "a": 1, "modifiedFields": {"a": 1}}));
        let incoming = record(json!({"_id": "p1", "a": 2, "modifiedFields": {"a": 5}}));

        let once = merge_record(&existing, &incoming);
        let twice = merge_record(&once.record, &incoming);

        assert_eq!(once.record, twice.record);
        assert!(!twice.changed());
    }

    #[test]
    fn test_reserved_keys_ignored() {
        let existing = record(json!({"_id": "p1", "fullySynced": true}));
        let mut incoming = record(json!({"_id": "p1"}));
        incoming.modified_fields.insert("_id", 100);
        incoming.modified_fields.insert("fullySynced", 100);

        let report = merge_record(&existing, &incoming);
        assert_eq!(report.record.id, "p1");
        assert_eq!(report.record.fully_synced, Some(true));
        assert!(report.accepted.is_empty());
    }
}
