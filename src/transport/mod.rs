// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pub/sub transport seam.
//!
//! The sync server never talks to sockets. It sees the transport through two
//! traits:
//!
//! - [`Extension`]: a hook every inbound [`Message`] passes through before
//!   it is dispatched (the channel authenticator is one)
//! - [`Publisher`]: fire a JSON payload at a channel
//!
//! [`LocalBus`] is an in-process implementation for tests and embedding.

pub mod local_bus;

pub use local_bus::LocalBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clients::{Client, Credentials};

/// Meta channel a client publishes to when it subscribes to a channel.
pub const META_SUBSCRIBE: &str = "/meta/subscribe";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("publish to '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("transport closed")]
    Closed,
}

/// One transport message.
///
/// `client` is never on the wire: the authenticator attaches it once the
/// credentials in `ext` check out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target channel of a `/meta/subscribe`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub client: Option<Client>,
}

impl Message {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Put `clientId`/`clientSecret` into `ext`, keeping other ext keys.
    #[must_use]
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        let mut ext = match self.ext.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        ext.insert("clientId".into(), Value::String(credentials.client_id.clone()));
        ext.insert("clientSecret".into(), Value::String(credentials.client_secret.clone()));
        self.ext = Some(Value::Object(ext));
        self
    }

    /// Credential pair from `ext`, if both halves are present strings.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        let ext = self.ext.as_ref()?;
        let client_id = ext.get("clientId")?.as_str()?;
        let client_secret = ext.get("clientSecret")?.as_str()?;
        Some(Credentials {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.client.is_some() && self.error.is_none()
    }

    /// Mark the message failed. Detaches any client.
    pub fn reject(&mut self, error: impl Into<String>) {
        self.client = None;
        self.error = Some(error.into());
    }
}

/// Hook run on every inbound message before dispatch.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn incoming(&self, message: Message) -> Message;
}

/// Outbound half of the transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), TransportError>;
}
