// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound merge handler.
//!
//! Applies `save`/`remove` operations sent by authenticated clients. Every
//! accepted write and its change log entry commit in one [`WriteScope`], so
//! the outbound side never sees one without the other.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::change::{Change, ChangeAction};
use crate::clients::Client;
use crate::error::{Direction, SyncError};
use crate::metrics;
use crate::record::{Record, RecordError, ID_FIELD};
use crate::schema::SchemaRegistry;
use crate::storage::traits::{RecordStore, WriteScope};

use super::merge::merge_record;

/// A decoded sync-in payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSync {
    pub action: ChangeAction,
    pub record_type: String,
    pub record_id: String,
    /// Required for `save`; ignored for `remove`
    pub record: Option<Record>,
}

impl InboundSync {
    /// Decode `{ action, recordType, recordId, record }`.
    ///
    /// The action is checked first, so a payload without one always fails
    /// with [`SyncError::UnknownSyncAction`].
    pub fn from_payload(payload: &Value) -> Result<Self, SyncError> {
        let object = payload.as_object().ok_or(RecordError::NotAnObject)?;

        let action = match object.get("action") {
            Some(Value::String(raw)) => {
                ChangeAction::parse(raw).ok_or_else(|| SyncError::UnknownSyncAction(Some(raw.clone())))?
            }
            _ => return Err(SyncError::UnknownSyncAction(None)),
        };

        let record_type = object
            .get("recordType")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(RecordError::MissingField("recordType"))?
            .to_string();

        let record = match object.get("record") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(Record::from_json(raw.clone())?),
        };
        if action == ChangeAction::Save && record.is_none() {
            return Err(RecordError::MissingField("record").into());
        }

        let envelope_id = object.get("recordId").and_then(Value::as_str).filter(|id| !id.is_empty());
        let record_id = match (envelope_id, record.as_ref()) {
            (Some(envelope), Some(record)) if envelope != record.id => {
                return Err(RecordError::IdMismatch {
                    envelope: envelope.to_string(),
                    record: record.id.clone(),
                }
                .into());
            }
            (Some(envelope), _) => envelope.to_string(),
            (None, Some(record)) => record.id.clone(),
            (None, None) => return Err(RecordError::MissingField("recordId").into()),
        };

        Ok(Self {
            action,
            record_type,
            record_id,
            record,
        })
    }
}

/// What an inbound operation did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No prior record; stored verbatim
    Created,
    /// Merged into an existing record
    Updated { accepted: Vec<String>, rejected: Vec<String> },
    /// Every incoming field lost; nothing written
    Unchanged { rejected: Vec<String> },
    Removed,
    /// `remove` for a record that is not there; nothing written
    NotFound,
}

impl MergeOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated { .. } => "updated",
            Self::Unchanged { .. } => "unchanged",
            Self::Removed => "removed",
            Self::NotFound => "not_found",
        }
    }
}

pub struct MergeHandler {
    records: Arc<dyn RecordStore>,
    schemas: Arc<SchemaRegistry>,
}

impl MergeHandler {
    pub fn new(records: Arc<dyn RecordStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self { records, schemas }
    }

    /// Apply one client operation.
    #[tracing::instrument(
        skip(self, client, sync),
        fields(client_id = %client.client_id, record_type = %sync.record_type, record_id = %sync.record_id, action = %sync.action)
    )]
    pub async fn apply(&self, client: &Client, sync: InboundSync) -> Result<MergeOutcome, SyncError> {
        let _timer = metrics::LatencyTimer::new("merge");
        let policy = self.schemas.policy(&sync.record_type)?;
        if !policy.sync_mode().allows(Direction::Inbound) {
            return Err(SyncError::SyncDirectionRejected {
                record_type: sync.record_type,
                direction: Direction::Inbound,
            });
        }
        let tracked = policy.sync_mode().is_tracked();

        let outcome = match (sync.action, sync.record) {
            (ChangeAction::Wipe, _) => return Err(SyncError::UnsupportedAction(ChangeAction::Wipe)),
            (ChangeAction::Save, Some(record)) => self.save(&sync.record_type, record, tracked).await?,
            (ChangeAction::Save, None) => return Err(RecordError::MissingField("record").into()),
            (ChangeAction::Remove, _) => self.remove(&sync.record_type, &sync.record_id, tracked).await?,
        };

        metrics::record_merge(&sync.record_type, outcome.label());
        match &outcome {
            MergeOutcome::Updated { rejected, .. } | MergeOutcome::Unchanged { rejected } => {
                metrics::record_field_conflicts(&sync.record_type, rejected.len());
            }
            _ => {}
        }
        debug!(outcome = outcome.label(), "Inbound operation applied");
        Ok(outcome)
    }

    async fn save(&self, record_type: &str, incoming: Record, tracked: bool) -> Result<MergeOutcome, SyncError> {
        let mut scope = self.records.begin_write().await?;
        let record_id = incoming.id.clone();

        let outcome = match scope.find_one(record_type, &record_id).await? {
            None => {
                scope.create(record_type, incoming, false).await?;
                MergeOutcome::Created
            }
            Some(existing) => {
                let report = merge_record(&existing, &incoming);
                if !report.changed() {
                    // Dropping the scope discards it
                    return Ok(MergeOutcome::Unchanged {
                        rejected: report.rejected,
                    });
                }
                scope.create(record_type, report.record, true).await?;
                MergeOutcome::Updated {
                    accepted: report.accepted,
                    rejected: report.rejected,
                }
            }
        };

        if tracked {
            scope.record_change(ChangeAction::Save, record_type, &record_id);
        }
        scope.commit().await?;
        Ok(outcome)
    }

    async fn remove(&self, record_type: &str, record_id: &str, tracked: bool) -> Result<MergeOutcome, SyncError> {
        let mut scope = self.records.begin_write().await?;
        if !scope.delete_by_primary_key(record_type, record_id).await? {
            return Ok(MergeOutcome::NotFound);
        }
        if tracked {
            scope.record_change(ChangeAction::Remove, record_type, record_id);
        }
        scope.commit().await?;
        Ok(MergeOutcome::Removed)
    }

    /// Server-side upsert. Replaces the stored record and appends a `save`
    /// change when the type is tracked.
    pub async fn save_local(&self, record_type: &str, record: Record) -> Result<Option<Change>, SyncError> {
        let tracked = self.is_tracked(record_type);
        let record_id = record.id.clone();

        let mut scope = self.records.begin_write().await?;
        scope.create(record_type, record, true).await?;
        if tracked {
            scope.record_change(ChangeAction::Save, record_type, &record_id);
        }
        let change = scope.commit().await?.into_iter().next();
        info!(record_type, record_id = %record_id, tracked, "Local save");
        Ok(change)
    }

    /// Server-side delete. `Ok(None)` when there was nothing to delete or the
    /// type is untracked.
    pub async fn remove_local(&self, record_type: &str, record_id: &str) -> Result<Option<Change>, SyncError> {
        let tracked = self.is_tracked(record_type);

        let mut scope = self.records.begin_write().await?;
        if !scope.delete_by_primary_key(record_type, record_id).await? {
            return Ok(None);
        }
        if tracked {
            scope.record_change(ChangeAction::Remove, record_type, record_id);
        }
        let change = scope.commit().await?.into_iter().next();
        info!(record_type, record_id, tracked, "Local remove");
        Ok(change)
    }

    /// Unregistered types (the facility record, for one) are stored untracked.
    fn is_tracked(&self, record_type: &str) -> bool {
        self.schemas
            .sync_mode(record_type)
            .is_some_and(|mode| mode.is_tracked())
    }
}

/// Convenience for building a sync-in payload.
#[must_use]
pub fn sync_payload(action: ChangeAction, record_type: &str, record: &Record) -> Value {
    serde_json::json!({
        "action": action.as_str().to_ascii_uppercase(),
        "recordType": record_type,
        "recordId": record.id,
        "record": record.to_json(),
    })
}

/// Payload for a `remove` carrying identity only.
#[must_use]
pub fn remove_payload(record_type: &str, record_id: &str) -> Value {
    serde_json::json!({
        "action": "REMOVE",
        "recordType": record_type,
        "recordId": record_id,
        "record": { ID_FIELD: record_id },
    })
}
