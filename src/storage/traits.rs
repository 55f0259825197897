// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator contracts for the record store and the client store.
//!
//! The object database itself is not part of this crate; anything that can
//! honour these traits (including the in-memory reference stores) can back
//! the sync engine. The one hard requirement is the transactional
//! [`WriteScope`]: staged writes become visible to readers all at once on
//! [`WriteScope::commit`], or not at all if the scope is dropped.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::change::{Change, ChangeAction};
use crate::clients::{AuthOutcome, Client};
use crate::record::{Record, Timestamp, ID_FIELD};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("'{record_type}/{id}' already exists")]
    Conflict { record_type: String, id: String },
}

/// Field-equality query for [`RecordStore::find`]. No predicates = all records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    predicates: Vec<(String, Value)>,
}

impl RecordQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `field == value`. `_id` matches the primary key.
    #[must_use]
    pub fn field_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.predicates.push((field.into(), value));
        self
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|(field, expected)| {
            if field == ID_FIELD {
                expected.as_str() == Some(record.id.as_str())
            } else {
                record.get(field) == Some(expected)
            }
        })
    }
}

/// A transactional write in progress.
///
/// Reads through the scope see its own staged writes. Changes recorded with
/// [`record_change`](Self::record_change) are stamped and appended to the
/// change log as part of the commit.
#[async_trait]
pub trait WriteScope: Send {
    async fn find_one(&mut self, record_type: &str, id: &str) -> Result<Option<Record>, StorageError>;

    /// Insert `record`. Without `upsert` an existing record is a [`StorageError::Conflict`].
    async fn create(&mut self, record_type: &str, record: Record, upsert: bool) -> Result<(), StorageError>;

    /// Returns whether a record was present.
    async fn delete_by_primary_key(&mut self, record_type: &str, id: &str) -> Result<bool, StorageError>;

    /// Stage a change log entry for this write.
    fn record_change(&mut self, action: ChangeAction, record_type: &str, record_id: &str);

    /// Apply everything atomically; returns the appended changes.
    async fn commit(self: Box<Self>) -> Result<Vec<Change>, StorageError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find(&self, record_type: &str, query: &RecordQuery) -> Result<Vec<Record>, StorageError>;

    async fn find_one(&self, record_type: &str, id: &str) -> Result<Option<Record>, StorageError>;

    /// All changes with `timestamp > watermark`, oldest first.
    async fn changes_since(&self, watermark: Timestamp) -> Result<Vec<Change>, StorageError>;

    /// Open a write scope. Concurrent scopes are serialized.
    async fn begin_write<'a>(&'a self) -> Result<Box<dyn WriteScope + 'a>, StorageError>;

    /// Committed changes, delivered after they become visible to readers.
    fn subscribe(&self) -> broadcast::Receiver<Change>;
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    /// `client_id` is unique; a duplicate is a [`StorageError::Conflict`].
    async fn insert(&self, client: Client) -> Result<(), StorageError>;

    async fn get(&self, client_id: &str) -> Result<Option<Client>, StorageError>;

    /// Look up by credential pair and stamp `last_active = now` atomically.
    async fn authenticate(&self, client_id: &str, client_secret: &str, now: Timestamp) -> Result<AuthOutcome, StorageError>;

    /// Set `sync_out = max(sync_out, timestamp)`; returns the stored value.
    async fn advance_watermark(&self, client_id: &str, timestamp: Timestamp) -> Result<Timestamp, StorageError>;

    /// Clients with `last_active >= cutoff`.
    async fn active_since(&self, cutoff: Timestamp) -> Result<Vec<Client>, StorageError>;

    async fn remove(&self, client_id: &str) -> Result<bool, StorageError>;
}
