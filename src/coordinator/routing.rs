// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport message routing and server-side writes.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::change::Change;
use crate::error::SyncError;
use crate::metrics;
use crate::record::Record;
use crate::sync::InboundSync;
use crate::transport::{Extension, Message, META_SUBSCRIBE};

use super::{RouteOutcome, SyncServer};

impl SyncServer {
    /// Entry point for every inbound transport message.
    ///
    /// Authenticates guarded channels, then routes. Any failure ends up in
    /// `message.error`; the message itself is always handed back so the
    /// transport can acknowledge it.
    pub async fn receive(&self, message: Message) -> Message {
        let mut message = self.authenticator.incoming(message).await;
        if message.error.is_some() {
            return message;
        }

        match self.route(&message).await {
            Ok(outcome) => {
                debug!(channel = %message.channel, %outcome, "Message routed");
            }
            Err(e) => {
                warn!(
                    channel = %message.channel,
                    client_id = message.client.as_ref().map(|c| c.client_id.as_str()).unwrap_or("-"),
                    error = %e,
                    "Message rejected"
                );
                metrics::record_error("route", e.kind());
                message.error = Some(e.to_string());
            }
        }
        message
    }

    /// Route a message that already went through the authenticator.
    pub async fn route(&self, message: &Message) -> Result<RouteOutcome, SyncError> {
        let is_sync_in = message.channel == self.sync_in_channel;
        let is_subscribe = message.channel == META_SUBSCRIBE;
        if !is_sync_in && !is_subscribe {
            return Ok(RouteOutcome::Ignored);
        }

        let client = match (&message.client, &message.error) {
            (Some(client), None) => client,
            _ => return Err(SyncError::MissingClient),
        };

        if is_sync_in {
            let sync = match &message.data {
                Some(data) => InboundSync::from_payload(data)?,
                None => return Err(SyncError::UnknownSyncAction(None)),
            };
            let outcome = self.merger.apply(client, sync).await?;
            return Ok(RouteOutcome::Merged(outcome));
        }

        // Subscribing to any out channel but your own is refused
        let own = self.out_channel(&client.client_id);
        let out_prefix = self.out_channel("");
        if let Some(subscription) = message.subscription.as_deref() {
            if subscription != own {
                if subscription.starts_with(&out_prefix) {
                    return Err(SyncError::AuthenticationFailure(format!(
                        "client '{}' may not subscribe to '{}'",
                        client.client_id, subscription
                    )));
                }
                return Ok(RouteOutcome::Ignored);
            }
        }

        let queued = match self.triggers_tx.try_send(client.client_id.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(client_id)) => {
                warn!(client_id = %client_id, "Subscribe trigger queue full; leaving it to the next sweep");
                metrics::record_error("subscribe", "trigger_queue_full");
                false
            }
            Err(TrySendError::Closed(client_id)) => {
                debug!(client_id = %client_id, "Run loop not accepting triggers");
                false
            }
        };
        Ok(RouteOutcome::SyncRequested { queued })
    }

    /// Server-side upsert; appends a change for synced types.
    pub async fn save_local(&self, record_type: &str, record: Record) -> Result<Option<Change>, SyncError> {
        self.merger.save_local(record_type, record).await
    }

    /// Server-side delete; appends a change for synced types.
    pub async fn remove_local(&self, record_type: &str, record_id: &str) -> Result<Option<Change>, SyncError> {
        self.merger.remove_local(record_type, record_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::watch;

    use crate::auth::AUTH_FAILED;
    use crate::clients::Credentials;
    use crate::config::SyncServerConfig;
    use crate::schema::{SchemaPolicy, SchemaRegistry, SyncMode};
    use crate::storage::{InMemoryClientStore, InMemoryRecordStore};
    use crate::storage::traits::RecordStore;
    use crate::sync::MergeOutcome;
    use crate::transport::LocalBus;

    use super::*;

    fn server() -> SyncServer {
        let config = SyncServerConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        SyncServer::new(
            config,
            rx,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryClientStore::new()),
            SchemaRegistry::builder()
                .register(SchemaPolicy::new("patient"))
                .register(SchemaPolicy::new("report").with_sync(SyncMode::RemoteToLocal))
                .build(),
            Arc::new(LocalBus::new()),
        )
    }

    fn sync_in(creds: &Credentials, data: serde_json::Value) -> Message {
        Message::new("/in").with_data(data).with_credentials(creds)
    }

    #[tokio::test]
    async fn test_sync_in_save_is_merged() {
        let server = server();
        let creds = server.register_client(None, None).await.unwrap();

        let reply = server
            .receive(sync_in(
                &creds,
                json!({"action": "SAVE", "recordType": "patient", "record": {"_id": "p1", "a": 1}}),
            ))
            .await;

        assert!(reply.error.is_none());
        assert!(server.records().find_one("patient", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unauthenticated_sync_in_is_not_processed() {
        let server = server();
        let creds = Credentials {
            client_id: "nobody".into(),
            client_secret: "nothing".into(),
        };

        let reply = server
            .receive(sync_in(
                &creds,
                json!({"action": "SAVE", "recordType": "patient", "record": {"_id": "p1"}}),
            ))
            .await;

        assert_eq!(reply.error.as_deref(), Some(AUTH_FAILED));
        assert!(server.records().find_one("patient", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_route_refuses_message_without_client() {
        let server = server();
        let err = server.route(&Message::new("/in")).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingClient));
        assert_eq!(server.route(&Message::new("/chat")).await.unwrap(), RouteOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_errors_land_on_the_message() {
        let server = server();
        let creds = server.register_client(None, None).await.unwrap();

        let reply = server.receive(sync_in(&creds, json!({"recordType": "patient"}))).await;
        assert_eq!(reply.error.as_deref(), Some("No action specified"));

        let reply = server.receive(Message::new("/in").with_credentials(&creds)).await;
        assert_eq!(reply.error.as_deref(), Some("No action specified"));

        let reply = server
            .receive(sync_in(
                &creds,
                json!({"action": "save", "recordType": "report", "record": {"_id": "r1"}}),
            ))
            .await;
        assert!(reply.error.unwrap().contains("does not sync client-to-server"));
    }

    #[tokio::test]
    async fn test_subscribe_queues_trigger() {
        let server = server();
        let creds = server.register_client(None, None).await.unwrap();
        let own = server.out_channel(&creds.client_id);

        let message = Message::new(META_SUBSCRIBE)
            .with_subscription(own)
            .with_credentials(&creds);
        let message = server.authenticator.incoming(message).await;
        assert_eq!(
            server.route(&message).await.unwrap(),
            RouteOutcome::SyncRequested { queued: true }
        );

        let queued = server.triggers_rx.lock().as_mut().unwrap().try_recv().unwrap();
        assert_eq!(queued, creds.client_id);
    }

    #[tokio::test]
    async fn test_subscribe_to_foreign_out_channel_refused() {
        let server = server();
        let creds = server.register_client(None, None).await.unwrap();

        let reply = server
            .receive(
                Message::new(META_SUBSCRIBE)
                    .with_subscription(server.out_channel("someone-else"))
                    .with_credentials(&creds),
            )
            .await;
        assert!(reply.error.unwrap().starts_with("authentication failed"));

        let reply = server
            .receive(
                Message::new(META_SUBSCRIBE)
                    .with_subscription("/announcements")
                    .with_credentials(&creds),
            )
            .await;
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_local_writes() {
        let server = server();
        let change = server.save_local("patient", Record::new("p1")).await.unwrap();
        assert!(change.is_some());

        let merged = server
            .merger
            .apply(
                &crate::clients::Client::issue(None, None),
                InboundSync::from_payload(&json!({
                    "action": "save", "recordType": "patient",
                    "record": {"_id": "p1", "a": 1, "modifiedFields": {"a": 1}}
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        assert!(matches!(merged, MergeOutcome::Updated { .. }));

        assert!(server.remove_local("patient", "p1").await.unwrap().is_some());
        assert_eq!(server.records().changes_since(0).await.unwrap().len(), 3);
    }
}
