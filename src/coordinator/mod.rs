// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync server coordinator.
//!
//! The [`SyncServer`] ties the components together:
//! - Channel authenticator in front of every guarded message
//! - Merge handler for the sync-in channel
//! - Outbound synchronizer driven by sweeps, committed changes and subscribes
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use facility_sync::{SyncServer, SyncServerConfig, ServerState, SchemaRegistry, SchemaPolicy, LocalBus};
//! use facility_sync::storage::{InMemoryClientStore, InMemoryRecordStore};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncServerConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let server = Arc::new(SyncServer::new(
//!     config,
//!     rx,
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(InMemoryClientStore::new()),
//!     SchemaRegistry::builder().register(SchemaPolicy::new("patient")).build(),
//!     Arc::new(LocalBus::new()),
//! ));
//! assert_eq!(server.state(), ServerState::Created);
//!
//! let runner = server.clone();
//! let handle = tokio::spawn(async move { runner.run().await });
//! // ... route transport messages through server.receive(message) ...
//! server.shutdown().await;
//! handle.await.unwrap();
//! # }
//! ```

mod lifecycle;
mod routing;
mod types;

pub use types::{RouteOutcome, ServerState};

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};

use crate::auth::ChannelAuthenticator;
use crate::clients::{ClientRegistry, Credentials};
use crate::config::SyncServerConfig;
use crate::error::SyncError;
use crate::schema::SchemaRegistry;
use crate::storage::traits::{ClientStore, RecordStore};
use crate::sync::{MergeHandler, OutboundSynchronizer, SweepSummary, SyncOutcome, SyncTrigger};
use crate::transport::Publisher;

/// Main sync server coordinator.
///
/// # Thread Safety
///
/// The server is `Send + Sync`; share it behind an `Arc` between the
/// transport and the task running [`run()`](Self::run).
pub struct SyncServer {
    /// Live configuration (updated by the run loop from the watch channel)
    pub(super) config: RwLock<SyncServerConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<SyncServerConfig>>,

    /// Server state (broadcast to watchers)
    pub(super) state: watch::Sender<ServerState>,

    /// Server state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<ServerState>,

    pub(super) records: Arc<dyn RecordStore>,
    pub(super) clients: Arc<ClientRegistry>,
    pub(super) schemas: Arc<SchemaRegistry>,

    pub(super) authenticator: ChannelAuthenticator,
    pub(super) merger: MergeHandler,
    pub(super) outbound: Arc<OutboundSynchronizer>,

    /// Subscribe triggers: client ids waiting for an immediate sync
    pub(super) triggers_tx: mpsc::Sender<String>,

    /// Taken by the first `run()`
    pub(super) triggers_rx: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,

    /// `/{sync_in}`, fixed at construction
    pub(super) sync_in_channel: String,
}

impl SyncServer {
    /// Create a new sync server.
    ///
    /// The server starts in `Created` state. Messages can be routed right
    /// away; outbound delivery starts once [`run()`](Self::run) is polled.
    pub fn new(
        config: SyncServerConfig,
        config_rx: watch::Receiver<SyncServerConfig>,
        records: Arc<dyn RecordStore>,
        client_store: Arc<dyn ClientStore>,
        schemas: SchemaRegistry,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServerState::Created);
        let (triggers_tx, triggers_rx) = mpsc::channel(config.trigger_channel_capacity.max(1));

        let schemas = Arc::new(schemas);
        let clients = Arc::new(ClientRegistry::new(client_store).with_ttl(config.client_ttl()));
        let sync_in_channel = config.sync_in_channel();

        let outbound = Arc::new(OutboundSynchronizer::new(
            &config,
            records.clone(),
            clients.clone(),
            schemas.clone(),
            publisher,
        ));

        Self {
            authenticator: ChannelAuthenticator::new(clients.clone(), sync_in_channel.clone()),
            merger: MergeHandler::new(records.clone(), schemas.clone()),
            outbound,
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            records,
            clients,
            schemas,
            triggers_tx,
            triggers_rx: parking_lot::Mutex::new(Some(triggers_rx)),
            sync_in_channel,
        }
    }

    /// Get current server state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServerState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Snapshot of the live configuration.
    #[must_use]
    pub fn config(&self) -> SyncServerConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    #[must_use]
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    #[must_use]
    pub fn outbound(&self) -> &Arc<OutboundSynchronizer> {
        &self.outbound
    }

    #[must_use]
    pub fn sync_in_channel(&self) -> &str {
        &self.sync_in_channel
    }

    /// `/{sync_out}/{client_id}`
    #[must_use]
    pub fn out_channel(&self, client_id: &str) -> String {
        self.outbound.out_channel(client_id)
    }

    /// Login: issue credentials for a new client.
    pub async fn register_client(
        &self,
        hospital_id: Option<String>,
        facility_id: Option<String>,
    ) -> Result<Credentials, SyncError> {
        Ok(self.clients.register(hospital_id, facility_id).await?)
    }

    /// Logout: forget a client and any backoff it had.
    pub async fn revoke_client(&self, client_id: &str) -> Result<bool, SyncError> {
        self.outbound.backoff().clear(client_id);
        Ok(self.clients.revoke(client_id).await?)
    }

    /// Sync one client now, regardless of backoff.
    pub async fn sync_client(&self, client_id: &str) -> Result<SyncOutcome, SyncError> {
        self.outbound.sync_client(client_id, SyncTrigger::Manual).await
    }

    /// One sweep over clients active within the configured window.
    pub async fn sweep(&self) -> Result<SweepSummary, SyncError> {
        let window = self.config.read().active_window();
        self.outbound.sync_active_clients(window, SyncTrigger::Sweep).await
    }
}
