// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client registry: issued credentials, activity and sync watermarks.
//!
//! Each connected device/session is a [`Client`]. Its `sync_out` watermark
//! is the timestamp of the last change it has fully received; it only ever
//! moves forward.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use facility_sync::{ClientRegistry, AuthOutcome};
//! use facility_sync::storage::InMemoryClientStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = ClientRegistry::new(Arc::new(InMemoryClientStore::new()));
//! let creds = registry.register(Some("hospital-1".into()), None).await.unwrap();
//!
//! let outcome = registry.authenticate(&creds.client_id, &creds.client_secret).await.unwrap();
//! assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

use crate::change::now_millis;
use crate::record::Timestamp;
use crate::storage::traits::{ClientStore, StorageError};

/// A connected device/session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    /// Public half of the credential pair; unique
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: String,
    pub hospital_id: Option<String>,
    pub facility_id: Option<String>,
    /// Last authenticated channel operation (epoch ms)
    pub last_active: Timestamp,
    /// Watermark: last change timestamp fully delivered
    pub sync_out: Timestamp,
    /// Credentials are rejected after this instant (epoch ms)
    pub expiry: Option<Timestamp>,
}

impl Client {
    /// New client with fresh random credentials and a zero watermark.
    pub fn issue(hospital_id: Option<String>, facility_id: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: Uuid::new_v4().to_string(),
            client_secret: Uuid::new_v4().simple().to_string(),
            hospital_id,
            facility_id,
            last_active: now,
            sync_out: 0,
            expiry: None,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }

    /// Compares `secret` without short-circuiting on the first differing byte.
    #[must_use]
    pub fn secret_matches(&self, secret: &str) -> bool {
        self.client_secret.as_bytes().ct_eq(secret.as_bytes()).into()
    }
}

/// Credential pair carried in a message's `ext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Result of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Matched; `last_active` already stamped
    Authenticated(Client),
    UnknownClient,
    BadSecret,
    Expired,
}

impl AuthOutcome {
    /// Metric/log label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Authenticated(_) => "authenticated",
            Self::UnknownClient => "unknown_client",
            Self::BadSecret => "bad_secret",
            Self::Expired => "expired",
        }
    }
}

/// Front door to the client store.
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    client_ttl: Option<Duration>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn ClientStore>) -> Self {
        Self { store, client_ttl: None }
    }

    /// Issue credentials that expire `ttl` after registration.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.client_ttl = ttl;
        self
    }

    /// Login: issue and persist a new credential pair.
    #[tracing::instrument(skip(self))]
    pub async fn register(
        &self,
        hospital_id: Option<String>,
        facility_id: Option<String>,
    ) -> Result<Credentials, StorageError> {
        let mut client = Client::issue(hospital_id, facility_id);
        if let Some(ttl) = self.client_ttl {
            client.expiry = Some(client.last_active.saturating_add(millis(ttl)));
        }
        let credentials = client.credentials();
        self.store.insert(client).await?;
        info!(client_id = %credentials.client_id, "Issued client credentials");
        Ok(credentials)
    }

    /// Persist an already built client (imports, tests).
    pub async fn insert(&self, client: Client) -> Result<(), StorageError> {
        self.store.insert(client).await
    }

    /// Check credentials and stamp `last_active` in one atomic step.
    pub async fn authenticate(&self, client_id: &str, client_secret: &str) -> Result<AuthOutcome, StorageError> {
        self.store.authenticate(client_id, client_secret, now_millis()).await
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<Client>, StorageError> {
        self.store.get(client_id).await
    }

    /// Clients whose `last_active` falls inside the trailing `window`.
    pub async fn active_within(&self, window: Duration) -> Result<Vec<Client>, StorageError> {
        let cutoff = now_millis().saturating_sub(millis(window));
        self.store.active_since(cutoff).await
    }

    /// Move the watermark forward to `timestamp`; returns the stored value.
    pub async fn advance_watermark(&self, client_id: &str, timestamp: Timestamp) -> Result<Timestamp, StorageError> {
        let stored = self.store.advance_watermark(client_id, timestamp).await?;
        debug!(client_id, watermark = stored, "Watermark advanced");
        Ok(stored)
    }

    /// Drop a client (logout). Returns whether it existed.
    pub async fn revoke(&self, client_id: &str) -> Result<bool, StorageError> {
        let removed = self.store.remove(client_id).await?;
        if removed {
            info!(client_id, "Client revoked");
        }
        Ok(removed)
    }
}

/// Saturates instead of wrapping for durations past `i64::MAX` ms.
fn millis(duration: Duration) -> Timestamp {
    Timestamp::try_from(duration.as_millis()).unwrap_or(Timestamp::MAX)
}
