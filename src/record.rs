// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synced record data structure.
//!
//! A [`Record`] is one instance of a domain entity (patient, medication, ...)
//! as it flows through the sync engine. On the wire it is a flat JSON object;
//! in memory the bookkeeping fields (`_id`, `modifiedFields`, `fullySynced`)
//! are typed and everything else lives in [`Record::fields`].
//!
//! # Example
//!
//! ```
//! use facility_sync::Record;
//! use serde_json::json;
//!
//! let record = Record::from_json(json!({
//!     "_id": "patient-1",
//!     "firstName": "Ada",
//!     "modifiedFields": {"firstName": 1700000000000_i64}
//! })).unwrap();
//!
//! assert_eq!(record.id, "patient-1");
//! assert_eq!(record.modified_fields.get("firstName"), Some(1700000000000));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Epoch milliseconds. Used for change timestamps, watermarks and field stamps.
pub type Timestamp = i64;

pub const ID_FIELD: &str = "_id";
pub const MODIFIED_FIELDS: &str = "modifiedFields";
pub const FULLY_SYNCED: &str = "fullySynced";

/// Fields transmitted alongside selector fields for partially synced records.
pub const DEFAULT_FIELDS: &[&str] = &["createdAt", "modifiedAt", "createdBy", "modifiedBy"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no string '_id'")]
    MissingId,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is malformed: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("recordId '{envelope}' does not match record _id '{record}'")]
    IdMismatch { envelope: String, record: String },
}

/// Per-record map of field name to the time it was last written.
///
/// Accepted on the wire either as a JSON object or as a JSON-encoded string
/// (older clients stringify it before storing).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifiedFields(BTreeMap<String, Timestamp>);

impl ModifiedFields {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<Timestamp> {
        self.0.get(field).copied()
    }

    pub fn insert(&mut self, field: impl Into<String>, at: Timestamp) {
        self.0.insert(field.into(), at);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Timestamp)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only entries whose field satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|k, _| keep(k));
    }

    /// Parse the wire representation.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(encoded) if encoded.trim().is_empty() => Ok(Self::default()),
            Value::String(encoded) => {
                let decoded: Value = serde_json::from_str(encoded).map_err(|e| invalid(MODIFIED_FIELDS, e))?;
                if decoded.is_string() {
                    return Err(invalid(MODIFIED_FIELDS, "doubly encoded string"));
                }
                Self::from_value(&decoded)
            }
            Value::Object(entries) => {
                let mut map = BTreeMap::new();
                for (field, stamp) in entries {
                    let at = stamp
                        .as_i64()
                        .or_else(|| stamp.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
                        .ok_or_else(|| invalid(MODIFIED_FIELDS, format!("'{}' is not a timestamp", field)))?;
                    map.insert(field.clone(), at);
                }
                Ok(Self(map))
            }
            other => Err(invalid(MODIFIED_FIELDS, format!("unexpected {}", json_kind(other)))),
        }
    }
}

impl FromIterator<(String, Timestamp)> for ModifiedFields {
    fn from_iter<I: IntoIterator<Item = (String, Timestamp)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One synced entity instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Primary key (`_id` on the wire)
    pub id: String,
    /// Domain fields, including `createdBy`/`modifiedBy`
    pub fields: Map<String, Value>,
    /// Field → last-modified timestamp
    pub modified_fields: ModifiedFields,
    /// `None` when the flag was never stamped
    pub fully_synced: Option<bool>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set a field without touching `modified_fields`.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Set a field and stamp it as modified at `at`.
    pub fn set(&mut self, field: impl Into<String>, value: Value, at: Timestamp) {
        let field = field.into();
        self.modified_fields.insert(field.clone(), at);
        self.fields.insert(field, value);
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn created_by(&self) -> Option<&str> {
        self.fields.get("createdBy").and_then(Value::as_str)
    }

    /// Parse a record from its wire form.
    pub fn from_json(value: Value) -> Result<Self, RecordError> {
        let Value::Object(mut object) = value else {
            return Err(RecordError::NotAnObject);
        };

        let id = match object.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(RecordError::MissingId),
        };

        let modified_fields = match object.remove(MODIFIED_FIELDS) {
            Some(raw) => ModifiedFields::from_value(&raw)?,
            None => ModifiedFields::default(),
        };

        let fully_synced = match object.remove(FULLY_SYNCED) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(flag),
            Some(other) => {
                return Err(invalid(FULLY_SYNCED, format!("expected bool, got {}", json_kind(&other))));
            }
        };

        Ok(Self {
            id,
            fields: object,
            modified_fields,
            fully_synced,
        })
    }

    /// Render the wire form. `modifiedFields` is always emitted as an object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 3);
        object.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        for (field, value) in &self.fields {
            object.insert(field.clone(), value.clone());
        }
        if !self.modified_fields.is_empty() {
            // BTreeMap<String, i64> always serializes
            object.insert(
                MODIFIED_FIELDS.to_string(),
                serde_json::to_value(&self.modified_fields).unwrap_or(Value::Null),
            );
        }
        if let Some(flag) = self.fully_synced {
            object.insert(FULLY_SYNCED.to_string(), Value::Bool(flag));
        }
        Value::Object(object)
    }

    /// Project onto `_id`, [`DEFAULT_FIELDS`] and `selectors`, stamped
    /// `fullySynced: false`.
    #[must_use]
    pub fn select(&self, selectors: &[String]) -> Record {
        let visible = |field: &str| DEFAULT_FIELDS.contains(&field) || selectors.iter().any(|s| s == field);

        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| visible(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut modified_fields = self.modified_fields.clone();
        modified_fields.retain(visible);

        Record {
            id: self.id.clone(),
            fields,
            modified_fields,
            fully_synced: Some(false),
        }
    }
}

fn invalid(field: &str, reason: impl std::fmt::Display) -> RecordError {
    RecordError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
