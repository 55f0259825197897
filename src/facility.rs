// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed view of the hospital record.
//!
//! A facility owns the `objectsFullySynced` allow-list: for each record type,
//! the ids whose complete entity (not just selector fields) is sent to
//! clients of that facility.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::record::{Record, RecordError};

/// Record type under which facilities are stored.
pub const FACILITY_RECORD_TYPE: &str = "hospital";

const OBJECTS_FULLY_SYNCED: &str = "objectsFullySynced";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facility {
    pub id: String,
    objects_fully_synced: BTreeMap<String, BTreeSet<String>>,
}

impl Facility {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects_fully_synced: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_fully_synced(&self, record_type: &str, record_id: &str) -> bool {
        self.objects_fully_synced
            .get(record_type)
            .is_some_and(|ids| ids.contains(record_id))
    }

    pub fn mark_fully_synced(&mut self, record_type: impl Into<String>, record_id: impl Into<String>) {
        self.objects_fully_synced
            .entry(record_type.into())
            .or_default()
            .insert(record_id.into());
    }

    #[must_use]
    pub fn with_fully_synced(mut self, record_type: &str, record_id: &str) -> Self {
        self.mark_fully_synced(record_type, record_id);
        self
    }

    /// Parse from the stored hospital record. `objectsFullySynced` may be an
    /// object of `type → [ids]` or the same object JSON-encoded as a string.
    pub fn from_record(record: &Record) -> Result<Self, RecordError> {
        let objects_fully_synced = match record.get(OBJECTS_FULLY_SYNCED) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(raw) => parse_allow_list(raw)?,
        };
        Ok(Self {
            id: record.id.clone(),
            objects_fully_synced,
        })
    }

    /// Render as a hospital record, allow-list stored as a JSON object.
    #[must_use]
    pub fn to_record(&self) -> Record {
        let allow_list: serde_json::Map<String, Value> = self
            .objects_fully_synced
            .iter()
            .map(|(record_type, ids)| {
                let ids = ids.iter().cloned().map(Value::String).collect();
                (record_type.clone(), Value::Array(ids))
            })
            .collect();
        Record::new(self.id.clone()).with_field(OBJECTS_FULLY_SYNCED, Value::Object(allow_list))
    }
}

fn parse_allow_list(raw: &Value) -> Result<BTreeMap<String, BTreeSet<String>>, RecordError> {
    let malformed = |reason: String| RecordError::InvalidField {
        field: OBJECTS_FULLY_SYNCED.to_string(),
        reason,
    };

    let decoded;
    let object = match raw {
        Value::Object(object) => object,
        Value::String(encoded) => {
            decoded = serde_json::from_str::<Value>(encoded).map_err(|e| malformed(e.to_string()))?;
            decoded
                .as_object()
                .ok_or_else(|| malformed("encoded value is not an object".to_string()))?
        }
        _ => return Err(malformed("expected an object".to_string())),
    };

    let mut allow_list = BTreeMap::new();
    for (record_type, ids) in object {
        let ids = ids
            .as_array()
            .ok_or_else(|| malformed(format!("'{}' is not a list", record_type)))?;
        let mut set = BTreeSet::new();
        for id in ids {
            let id = id
                .as_str()
                .ok_or_else(|| malformed(format!("'{}' contains a non-string id", record_type)))?;
            set.insert(id.to_string());
        }
        allow_list.insert(record_type.clone(), set);
    }
    Ok(allow_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_allow_list_lookup() {
        let facility = Facility::new("h1").with_fully_synced("patient", "p1");
        assert!(facility.is_fully_synced("patient", "p1"));
        assert!(!facility.is_fully_synced("patient", "p2"));
        assert!(!facility.is_fully_synced("medication", "p1"));
    }

    #[test]
    fn test_from_record_object_form() {
        let record = Record::new("h1").with_field("objectsFullySynced", json!({"patient": ["p1", "p2"]}));
        let facility = Facility::from_record(&record).unwrap();
        assert!(facility.is_fully_synced("patient", "p2"));
    }

    #[test]
    fn test_from_record_stringified_form() {
        let record = Record::new("h1").with_field("objectsFullySynced", json!("{\"patient\": [\"p3\"]}"));
        let facility = Facility::from_record(&record).unwrap();
        assert!(facility.is_fully_synced("patient", "p3"));
    }

    #[test]
    fn test_from_record_without_allow_list() {
        let facility = Facility::from_record(&Record::new("h1")).unwrap();
        assert_eq!(facility.id, "h1");
        assert!(!facility.is_fully_synced("patient", "p1"));
    }

    #[test]
    fn test_from_record_rejects_malformed() {
        let bad = [json!(42), json!("not json"), json!({"patient": "p1"}), json!({"patient": [1]})];
        for value in bad {
            let record = Record::new("h1").with_field("objectsFullySynced", value.clone());
            assert!(Facility::from_record(&record).is_err(), "accepted {}", value);
        }
    }

    #[test]
    fn test_to_record_parses_back() {
        let facility = Facility::new("h1")
            .with_fully_synced("patient", "p1")
            .with_fully_synced("visit", "v9");
        let parsed = Facility::from_record(&facility.to_record()).unwrap();
        assert_eq!(parsed, facility);
    }
}
