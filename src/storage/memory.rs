// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory reference stores.
//!
//! [`InMemoryRecordStore`] keeps records and the change log behind one
//! `tokio::sync::RwLock`: a write scope holds the write half for its whole
//! life and stages its writes, so readers see either none or all of a
//! commit. Change timestamps are taken from the store's [`LogicalClock`]
//! while that lock is held, which keeps the log strictly ordered.
//!
//! [`InMemoryClientStore`] indexes clients by `client_id` in a `DashMap`;
//! per-entry locking makes authenticate-and-stamp and watermark advances
//! atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock, RwLockWriteGuard};
use uuid::Uuid;

use super::traits::{ClientStore, RecordQuery, RecordStore, StorageError, WriteScope};
use crate::change::{Change, ChangeAction, LogicalClock};
use crate::clients::{AuthOutcome, Client};
use crate::config::SyncServerConfig;
use crate::record::{Record, Timestamp};

const DEFAULT_CHANGE_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    records: HashMap<String, BTreeMap<String, Record>>,
    changes: Vec<Change>,
}

pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    clock: LogicalClock,
    changes_tx: broadcast::Sender<Change>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(LogicalClock::wall(), DEFAULT_CHANGE_CAPACITY)
    }

    /// Wall clock, change broadcast sized by `change_channel_capacity`.
    #[must_use]
    pub fn from_config(config: &SyncServerConfig) -> Self {
        Self::with_clock(LogicalClock::wall(), config.change_channel_capacity)
    }

    /// `capacity` bounds the change broadcast; slow subscribers see `Lagged`.
    #[must_use]
    pub fn with_clock(clock: LogicalClock, capacity: usize) -> Self {
        let (changes_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            changes_tx,
        }
    }

    /// Number of records of `record_type`.
    pub async fn len(&self, record_type: &str) -> usize {
        self.tables
            .read()
            .await
            .records
            .get(record_type)
            .map_or(0, BTreeMap::len)
    }

    /// Number of change log entries.
    pub async fn change_count(&self) -> usize {
        self.tables.read().await.changes.len()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find(&self, record_type: &str, query: &RecordQuery) -> Result<Vec<Record>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .get(record_type)
            .map(|table| table.values().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_one(&self, record_type: &str, id: &str) -> Result<Option<Record>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.records.get(record_type).and_then(|table| table.get(id)).cloned())
    }

    async fn changes_since(&self, watermark: Timestamp) -> Result<Vec<Change>, StorageError> {
        let tables = self.tables.read().await;
        // Appended in timestamp order under the write lock
        let start = tables.changes.partition_point(|c| c.timestamp <= watermark);
        Ok(tables.changes[start..].to_vec())
    }

    async fn begin_write<'a>(&'a self) -> Result<Box<dyn WriteScope + 'a>, StorageError> {
        let guard = self.tables.write().await;
        Ok(Box::new(MemoryWriteScope {
            store: self,
            guard,
            staged: Vec::new(),
            pending_changes: Vec::new(),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes_tx.subscribe()
    }
}

enum Staged {
    Put { record_type: String, record: Record },
    Delete { record_type: String, id: String },
}

struct MemoryWriteScope<'a> {
    store: &'a InMemoryRecordStore,
    guard: RwLockWriteGuard<'a, Tables>,
    staged: Vec<Staged>,
    pending_changes: Vec<(ChangeAction, String, String)>,
}

impl MemoryWriteScope<'_> {
    fn lookup(&self, record_type: &str, id: &str) -> Option<Record> {
        for op in self.staged.iter().rev() {
            match op {
                Staged::Put { record_type: t, record } if t == record_type && record.id == id => {
                    return Some(record.clone());
                }
                Staged::Delete { record_type: t, id: staged_id } if t == record_type && staged_id == id => {
                    return None;
                }
                _ => {}
            }
        }
        self.guard.records.get(record_type).and_then(|table| table.get(id)).cloned()
    }
}

#[async_trait]
impl<'a> WriteScope for MemoryWriteScope<'a> {
    async fn find_one(&mut self, record_type: &str, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.lookup(record_type, id))
    }

    async fn create(&mut self, record_type: &str, record: Record, upsert: bool) -> Result<(), StorageError> {
        if !upsert && self.lookup(record_type, &record.id).is_some() {
            return Err(StorageError::Conflict {
                record_type: record_type.to_string(),
                id: record.id,
            });
        }
        self.staged.push(Staged::Put {
            record_type: record_type.to_string(),
            record,
        });
        Ok(())
    }

    async fn delete_by_primary_key(&mut self, record_type: &str, id: &str) -> Result<bool, StorageError> {
        let existed = self.lookup(record_type, id).is_some();
        self.staged.push(Staged::Delete {
            record_type: record_type.to_string(),
            id: id.to_string(),
        });
        Ok(existed)
    }

    fn record_change(&mut self, action: ChangeAction, record_type: &str, record_id: &str) {
        self.pending_changes
            .push((action, record_type.to_string(), record_id.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result<Vec<Change>, StorageError> {
        let MemoryWriteScope {
            store,
            mut guard,
            staged,
            pending_changes,
        } = *self;

        for op in staged {
            match op {
                Staged::Put { record_type, record } => {
                    guard.records.entry(record_type).or_default().insert(record.id.clone(), record);
                }
                Staged::Delete { record_type, id } => {
                    if let Some(table) = guard.records.get_mut(&record_type) {
                        table.remove(&id);
                    }
                }
            }
        }

        let mut appended = Vec::with_capacity(pending_changes.len());
        for (action, record_type, record_id) in pending_changes {
            let change = Change {
                id: Uuid::new_v4().to_string(),
                action,
                record_id,
                record_type,
                timestamp: store.clock.tick(),
            };
            guard.changes.push(change.clone());
            appended.push(change);
        }
        drop(guard);

        for change in &appended {
            // No subscribers is fine
            let _ = store.changes_tx.send(change.clone());
        }
        Ok(appended)
    }
}

pub struct InMemoryClientStore {
    clients: DashMap<String, Client>,
}

impl InMemoryClientStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for InMemoryClientStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn insert(&self, client: Client) -> Result<(), StorageError> {
        match self.clients.entry(client.client_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::Conflict {
                record_type: "client".to_string(),
                id: client.client_id,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client);
                Ok(())
            }
        }
    }

    async fn get(&self, client_id: &str) -> Result<Option<Client>, StorageError> {
        Ok(self.clients.get(client_id).map(|c| c.value().clone()))
    }

    async fn authenticate(&self, client_id: &str, client_secret: &str, now: Timestamp) -> Result<AuthOutcome, StorageError> {
        let Some(mut client) = self.clients.get_mut(client_id) else {
            return Ok(AuthOutcome::UnknownClient);
        };
        if !client.secret_matches(client_secret) {
            return Ok(AuthOutcome::BadSecret);
        }
        if client.is_expired(now) {
            return Ok(AuthOutcome::Expired);
        }
        client.last_active = client.last_active.max(now);
        Ok(AuthOutcome::Authenticated(client.clone()))
    }

    async fn advance_watermark(&self, client_id: &str, timestamp: Timestamp) -> Result<Timestamp, StorageError> {
        let mut client = self.clients.get_mut(client_id).ok_or(StorageError::NotFound)?;
        client.sync_out = client.sync_out.max(timestamp);
        Ok(client.sync_out)
    }

    async fn active_since(&self, cutoff: Timestamp) -> Result<Vec<Client>, StorageError> {
        Ok(self
            .clients
            .iter()
            .filter(|c| c.last_active >= cutoff)
            .map(|c| c.value().clone())
            .collect())
    }

    async fn remove(&self, client_id: &str) -> Result<bool, StorageError> {
        Ok(self.clients.remove(client_id).is_some())
    }
}
