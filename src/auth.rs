// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel authenticator.
//!
//! Guards the sync-in channel and `/meta/subscribe`. A guarded message must
//! carry `clientId`/`clientSecret` in its `ext`; on success the resolved
//! [`Client`](crate::Client) is attached and its `lastActive` stamped in the
//! same store operation. On failure the message gets
//! [`AUTH_FAILED`] as its error and no client. Every other channel passes
//! through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::{AuthOutcome, ClientRegistry};
use crate::metrics;
use crate::transport::{Extension, Message, META_SUBSCRIBE};

/// Client-facing error for every authentication failure.
pub const AUTH_FAILED: &str = "Authentication failed";

pub struct ChannelAuthenticator {
    registry: Arc<ClientRegistry>,
    guarded: Vec<String>,
}

impl ChannelAuthenticator {
    /// Guard `sync_in_channel` and `/meta/subscribe`.
    pub fn new(registry: Arc<ClientRegistry>, sync_in_channel: impl Into<String>) -> Self {
        Self {
            registry,
            guarded: vec![sync_in_channel.into(), META_SUBSCRIBE.to_string()],
        }
    }

    #[must_use]
    pub fn guards(&self, channel: &str) -> bool {
        self.guarded.iter().any(|c| c == channel)
    }

    async fn authenticate(&self, mut message: Message) -> Message {
        message.client = None;

        let Some(credentials) = message.credentials() else {
            let reason = if message.ext.is_none() { "missing_ext" } else { "missing_credentials" };
            warn!(channel = %message.channel, reason, "Rejected message without credentials");
            metrics::record_auth(reason);
            message.reject(AUTH_FAILED);
            return message;
        };

        match self
            .registry
            .authenticate(&credentials.client_id, &credentials.client_secret)
            .await
        {
            Ok(AuthOutcome::Authenticated(client)) => {
                debug!(client_id = %client.client_id, channel = %message.channel, "Authenticated");
                metrics::record_auth("authenticated");
                message.client = Some(client);
            }
            Ok(outcome) => {
                warn!(
                    client_id = %credentials.client_id,
                    channel = %message.channel,
                    reason = outcome.label(),
                    "Authentication failed"
                );
                metrics::record_auth(outcome.label());
                message.reject(AUTH_FAILED);
            }
            Err(e) => {
                warn!(client_id = %credentials.client_id, error = %e, "Client store unavailable during authentication");
                metrics::record_auth("store_error");
                metrics::record_error("authenticate", "storage");
                message.reject(AUTH_FAILED);
            }
        }
        message
    }
}

#[async_trait]
impl Extension for ChannelAuthenticator {
    async fn incoming(&self, message: Message) -> Message {
        if !self.guards(&message.channel) {
            return message;
        }
        self.authenticate(message).await
    }
}
