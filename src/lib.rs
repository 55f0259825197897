//! # Facility Sync
//!
//! Offline-first record sync between a central server and many clients
//! (facility devices), each holding its own copy of the data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Pub/Sub Transport                       │
//! │  • /{syncIn} (client → server), /meta/subscribe            │
//! │  • /{syncOut}/{clientId} (server → client)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Channel Authenticator                     │
//! │  • clientId/clientSecret from message ext                  │
//! │  • Stamps lastActive in the same store operation           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Inbound Merge Handler                     │
//! │  • Field-level last-writer-wins on modifiedFields          │
//! │  • Record + change log entry in one write scope            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (change log entry)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Outbound Synchronizer                     │
//! │  • Changes past each client's watermark                    │
//! │  • Schema filter, selectors, facility allow-list           │
//! │  • Watermark moves only after the whole batch published    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use facility_sync::{LocalBus, Message, SchemaPolicy, SchemaRegistry, SyncServer, SyncServerConfig};
//! use facility_sync::storage::{InMemoryClientStore, InMemoryRecordStore};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncServerConfig::default();
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let bus = Arc::new(LocalBus::new());
//!     let server = Arc::new(SyncServer::new(
//!         config,
//!         rx,
//!         Arc::new(InMemoryRecordStore::new()),
//!         Arc::new(InMemoryClientStore::new()),
//!         SchemaRegistry::builder()
//!             .register(SchemaPolicy::new("patient").with_selectors(["displayId", "firstName"]))
//!             .build(),
//!         bus.clone(),
//!     ));
//!
//!     let runner = server.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     // Login, then push a record
//!     let creds = server.register_client(Some("hospital-1".into()), None).await.unwrap();
//!     let mut inbox = bus.subscribe(&server.out_channel(&creds.client_id));
//!     let reply = server
//!         .receive(
//!             Message::new(server.sync_in_channel())
//!                 .with_data(json!({
//!                     "action": "SAVE",
//!                     "recordType": "patient",
//!                     "record": {"_id": "p1", "displayId": "ABC", "modifiedFields": {"displayId": 1}}
//!                 }))
//!                 .with_credentials(&creds),
//!         )
//!         .await;
//!     assert!(reply.error.is_none());
//!
//!     // The change comes back on the client's out channel
//!     println!("{}", inbox.recv().await.unwrap());
//!
//!     server.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Watermarked delivery**: at-least-once, never skipping a committed change
//! - **Partial sync**: selector fields until a facility allow-lists a record
//! - **Per-type sync modes**: on, off, remote-to-local, local-to-remote
//! - **Per-client backoff**: failed batches retried with exponential spacing
//! - **Coalescing**: triggers during a running sync fold into one rerun
//!
//! ## Configuration
//!
//! See [`SyncServerConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`SyncServer`] and its run loop
//! - [`sync`]: Inbound merge and outbound delivery
//! - [`schema`]: Per-record-type sync policies
//! - [`storage`]: Record and client store traits, in-memory stores
//! - [`transport`]: Pub/sub seam and the in-process [`LocalBus`]
//! - [`resilience`]: Per-client retry backoff

pub mod auth;
pub mod change;
pub mod clients;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod facility;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod transport;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use auth::{ChannelAuthenticator, AUTH_FAILED};
pub use change::{Change, ChangeAction, LogicalClock};
pub use clients::{AuthOutcome, Client, ClientRegistry, Credentials};
pub use config::SyncServerConfig;
pub use coordinator::{RouteOutcome, ServerState, SyncServer};
pub use error::{Direction, SyncError};
pub use facility::Facility;
pub use metrics::LatencyTimer;
pub use record::{ModifiedFields, Record, RecordError, Timestamp};
pub use resilience::{ClientBackoff, RetryConfig};
pub use schema::{FilterContext, SchemaPolicy, SchemaRegistry, SyncMode};
pub use storage::traits::{ClientStore, RecordQuery, RecordStore, StorageError, WriteScope};
pub use sync::{InboundSync, MergeOutcome, OutboundMessage, SweepSummary, SyncOutcome, SyncTrigger};
pub use transport::{Extension, LocalBus, Message, Publisher, TransportError};
