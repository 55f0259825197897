// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound synchronizer.
//!
//! For one client: read the change log past its watermark, turn each change
//! into a message (or skip it), publish the batch to the client's out
//! channel and only then move the watermark to the batch's highest
//! timestamp.
//!
//! ```text
//!   IDLE ──trigger──▶ SYNCING ──batch ok──▶ IDLE (watermark = max ts)
//!                        │  ▲
//!            trigger ────┘  │ rerun once
//!                        │
//!                        └──batch failed──▶ IDLE + backoff (watermark unchanged)
//! ```
//!
//! Delivery is at-least-once: a failed batch is sent again in full, which is
//! safe because the merge on the receiving side is idempotent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::change::{Change, ChangeAction};
use crate::clients::{Client, ClientRegistry};
use crate::config::SyncServerConfig;
use crate::error::{Direction, SyncError};
use crate::facility::{Facility, FACILITY_RECORD_TYPE};
use crate::metrics;
use crate::record::{Record, Timestamp};
use crate::resilience::{ClientBackoff, RetryConfig};
use crate::schema::{FilterContext, SchemaPolicy, SchemaRegistry};
use crate::storage::traits::{RecordStore, StorageError};
use crate::transport::{Publisher, TransportError};

/// Payload published on `/{syncOut}/{clientId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Current snapshot; `null` for removals
    pub record: Option<Value>,
    pub action: ChangeAction,
    pub record_id: String,
    pub record_type: String,
    pub timestamp: Timestamp,
}

/// Why a client sync was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// Periodic pass over active clients
    Sweep,
    /// A change was committed
    Change,
    /// The client subscribed to its out channel
    Subscribe,
    /// Requested through the API
    Manual,
}

impl SyncTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sweep => "sweep",
            Self::Change => "change",
            Self::Subscribe => "subscribe",
            Self::Manual => "manual",
        }
    }

    /// Subscribe and manual triggers mean someone is waiting on this client.
    #[must_use]
    pub fn overrides_backoff(&self) -> bool {
        matches!(self, Self::Subscribe | Self::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing past the watermark
    UpToDate,
    Delivered {
        published: usize,
        skipped: usize,
        watermark: Timestamp,
    },
    /// Already syncing; this trigger was folded into a rerun
    Busy,
    /// Skipped until the backoff deadline
    BackingOff { retry_in: Duration },
}

impl SyncOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::Delivered { .. } => "delivered",
            Self::Busy => "busy",
            Self::BackingOff { .. } => "backing_off",
        }
    }

    /// Fold a rerun's outcome into the one before it.
    fn then(self, next: SyncOutcome) -> SyncOutcome {
        match (self, next) {
            (
                Self::Delivered { published, skipped, watermark },
                Self::Delivered {
                    published: p,
                    skipped: s,
                    watermark: w,
                },
            ) => Self::Delivered {
                published: published + p,
                skipped: skipped + s,
                watermark: watermark.max(w),
            },
            (delivered @ Self::Delivered { .. }, _) => delivered,
            (_, next) => next,
        }
    }
}

/// Result of one sweep over active clients.
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub clients: usize,
    pub delivered: usize,
    pub published: usize,
    pub up_to_date: usize,
    /// Busy or backing off
    pub deferred: usize,
    pub failed: Vec<(String, SyncError)>,
}

#[derive(Debug, Default)]
struct SyncState {
    rerun: bool,
}

/// Removes the SYNCING entry if the sync future is dropped or errors.
struct SyncingGuard<'a> {
    states: &'a DashMap<String, SyncState>,
    client_id: &'a str,
    armed: bool,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.states.remove(self.client_id);
        }
    }
}

#[derive(Debug, Default)]
struct Prepared {
    messages: Vec<OutboundMessage>,
    skipped_mode: usize,
    skipped_filter: usize,
    skipped_missing: usize,
}

impl Prepared {
    fn skipped(&self) -> usize {
        self.skipped_mode + self.skipped_filter + self.skipped_missing
    }
}

pub struct OutboundSynchronizer {
    records: Arc<dyn RecordStore>,
    clients: Arc<ClientRegistry>,
    schemas: Arc<SchemaRegistry>,
    publisher: Arc<dyn Publisher>,
    out_prefix: String,
    publish_limit: Arc<Semaphore>,
    states: DashMap<String, SyncState>,
    backoff: ClientBackoff,
}

impl OutboundSynchronizer {
    pub fn new(
        config: &SyncServerConfig,
        records: Arc<dyn RecordStore>,
        clients: Arc<ClientRegistry>,
        schemas: Arc<SchemaRegistry>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            records,
            clients,
            schemas,
            publisher,
            out_prefix: config.sync_out.clone(),
            publish_limit: Arc::new(Semaphore::new(config.publish_concurrency.max(1))),
            states: DashMap::new(),
            backoff: ClientBackoff::new(RetryConfig::from_config(config)),
        }
    }

    /// `/{syncOut}/{clientId}`
    #[must_use]
    pub fn out_channel(&self, client_id: &str) -> String {
        format!("/{}/{}", self.out_prefix.trim_matches('/'), client_id)
    }

    #[must_use]
    pub fn backoff(&self) -> &ClientBackoff {
        &self.backoff
    }

    #[must_use]
    pub fn is_syncing(&self, client_id: &str) -> bool {
        self.states.contains_key(client_id)
    }

    /// Sync one client, coalescing with a sync already in flight.
    #[tracing::instrument(skip(self, trigger), fields(trigger = trigger.as_str()))]
    pub async fn sync_client(&self, client_id: &str, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        if trigger.overrides_backoff() {
            self.backoff.clear(client_id);
        } else if let Some(retry_in) = self.backoff.remaining(client_id) {
            debug!(client_id, ?retry_in, "Client backing off");
            metrics::record_sync_batch(trigger.as_str(), "backing_off");
            return Ok(SyncOutcome::BackingOff { retry_in });
        }

        match self.states.entry(client_id.to_string()) {
            Entry::Occupied(mut syncing) => {
                syncing.get_mut().rerun = true;
                debug!(client_id, "Sync in flight; rerun queued");
                metrics::record_sync_batch(trigger.as_str(), "coalesced");
                return Ok(SyncOutcome::Busy);
            }
            Entry::Vacant(slot) => {
                slot.insert(SyncState::default());
            }
        }
        let mut guard = SyncingGuard {
            states: &self.states,
            client_id,
            armed: true,
        };

        let mut outcome = SyncOutcome::UpToDate;
        loop {
            match self.sync_once(client_id).await {
                Ok(next) => {
                    metrics::record_sync_batch(trigger.as_str(), next.label());
                    outcome = outcome.then(next);
                    self.backoff.clear(client_id);
                }
                Err(e) => {
                    let delay = self.backoff.record_failure(client_id);
                    warn!(client_id, error = %e, retry_in = ?delay, "Client sync failed; watermark unchanged");
                    metrics::record_sync_batch(trigger.as_str(), "failed");
                    metrics::record_error("sync_client", e.kind());
                    metrics::record_backoff(delay);
                    return Err(e);
                }
            }

            // Atomic with respect to rerun flags set by concurrent triggers
            if self.states.remove_if(client_id, |_, state| !state.rerun).is_some() {
                guard.armed = false;
                return Ok(outcome);
            }
            if let Some(mut state) = self.states.get_mut(client_id) {
                state.rerun = false;
            }
        }
    }

    /// One pass for one client, without coalescing or backoff.
    pub async fn sync_once(&self, client_id: &str) -> Result<SyncOutcome, SyncError> {
        let _timer = metrics::LatencyTimer::new("sync_client");
        let client = self
            .clients
            .get(client_id)
            .await?
            .ok_or(SyncError::Storage(StorageError::NotFound))?;

        let changes = self.records.changes_since(client.sync_out).await?;
        let Some(max_timestamp) = changes.iter().map(|c| c.timestamp).max() else {
            return Ok(SyncOutcome::UpToDate);
        };
        metrics::record_batch_size(changes.len());

        let facility = self.load_facility(&client).await?;
        let prepared = self.prepare(&client, facility.as_ref(), &changes).await?;
        let published = prepared.messages.len();
        let skipped = prepared.skipped();

        self.publish_batch(&client, prepared.messages).await?;
        let watermark = self.clients.advance_watermark(&client.client_id, max_timestamp).await?;

        metrics::record_changes_published(published);
        metrics::record_changes_skipped("mode", prepared.skipped_mode);
        metrics::record_changes_skipped("filtered", prepared.skipped_filter);
        metrics::record_changes_skipped("missing", prepared.skipped_missing);
        info!(
            client_id = %client.client_id,
            published,
            skipped,
            from = client.sync_out,
            watermark,
            "Client synced"
        );
        Ok(SyncOutcome::Delivered {
            published,
            skipped,
            watermark,
        })
    }

    /// Sync every client active within `window`, concurrently.
    pub async fn sync_active_clients(
        self: &Arc<Self>,
        window: Duration,
        trigger: SyncTrigger,
    ) -> Result<SweepSummary, SyncError> {
        let active = self.clients.active_within(window).await?;
        let mut summary = SweepSummary {
            clients: active.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for client in active {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.sync_client(&client.client_id, trigger).await;
                (client.client_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(SyncOutcome::Delivered { published, .. }))) => {
                    summary.delivered += 1;
                    summary.published += published;
                }
                Ok((_, Ok(SyncOutcome::UpToDate))) => summary.up_to_date += 1,
                Ok((_, Ok(SyncOutcome::Busy | SyncOutcome::BackingOff { .. }))) => summary.deferred += 1,
                Ok((client_id, Err(e))) => summary.failed.push((client_id, e)),
                Err(e) => summary.failed.push((String::new(), SyncError::TaskFailed(e.to_string()))),
            }
        }

        metrics::record_sweep(summary.clients, summary.failed.len());
        if !summary.failed.is_empty() {
            warn!(
                trigger = trigger.as_str(),
                clients = summary.clients,
                failed = summary.failed.len(),
                "Sweep finished with failures"
            );
        }
        Ok(summary)
    }

    async fn load_facility(&self, client: &Client) -> Result<Option<Facility>, SyncError> {
        let Some(hospital_id) = client.hospital_id.as_deref() else {
            return Ok(None);
        };
        match self.records.find_one(FACILITY_RECORD_TYPE, hospital_id).await? {
            Some(record) => Ok(Some(Facility::from_record(&record)?)),
            None => Ok(None),
        }
    }

    async fn prepare(
        &self,
        client: &Client,
        facility: Option<&Facility>,
        changes: &[Change],
    ) -> Result<Prepared, SyncError> {
        let mut prepared = Prepared::default();

        for change in changes {
            let policy = self.schemas.policy(&change.record_type)?;
            if !policy.sync_mode().allows(Direction::Outbound) {
                prepared.skipped_mode += 1;
                continue;
            }

            let record = match change.action {
                ChangeAction::Save => match self.records.find_one(&change.record_type, &change.record_id).await? {
                    Some(record) => Some(record),
                    None => {
                        // A later remove is in the log
                        prepared.skipped_missing += 1;
                        continue;
                    }
                },
                ChangeAction::Remove | ChangeAction::Wipe => None,
            };

            let ctx = FilterContext {
                record: record.as_ref(),
                client,
                change,
            };
            if !policy.is_visible(&ctx) {
                debug!(
                    client_id = %client.client_id,
                    record_type = %change.record_type,
                    record_id = %change.record_id,
                    "Change filtered out"
                );
                prepared.skipped_filter += 1;
                continue;
            }

            prepared.messages.push(OutboundMessage {
                record: record.map(|r| shape(r, policy, facility, change).to_json()),
                action: change.action,
                record_id: change.record_id.clone(),
                record_type: change.record_type.clone(),
                timestamp: change.timestamp,
            });
        }
        Ok(prepared)
    }

    /// Publish every message; the first failure aborts the rest.
    async fn publish_batch(&self, client: &Client, messages: Vec<OutboundMessage>) -> Result<(), SyncError> {
        if messages.is_empty() {
            return Ok(());
        }
        let channel = self.out_channel(&client.client_id);

        let mut tasks = JoinSet::new();
        for message in messages {
            let payload = serde_json::to_value(&message)?;
            let publisher = Arc::clone(&self.publisher);
            let permits = Arc::clone(&self.publish_limit);
            let channel = channel.clone();

            tasks.spawn(async move {
                let publish_error = |source: TransportError| SyncError::TransportPublish {
                    record_type: message.record_type.clone(),
                    record_id: message.record_id.clone(),
                    source,
                };
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| publish_error(TransportError::Closed))?;
                publisher.publish(&channel, payload).await.map_err(publish_error)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| SyncError::TaskFailed(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                tasks.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Full snapshot, or the selector projection when the type declares
/// selectors and the facility has not allow-listed this record.
fn shape(record: Record, policy: &SchemaPolicy, facility: Option<&Facility>, change: &Change) -> Record {
    if policy.selectors().is_empty() {
        return record;
    }
    let fully_synced = facility.is_some_and(|f| f.is_fully_synced(&change.record_type, &change.record_id));
    if fully_synced {
        Record {
            fully_synced: Some(true),
            ..record
        }
    } else {
        record.select(policy.selectors())
    }
}
