// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-record-type sync policies.
//!
//! Each synced record type declares a [`SyncMode`], an optional visibility
//! filter and an ordered list of selector fields. The [`SchemaRegistry`] is
//! built once at startup and shared read-only (behind an `Arc`) by the
//! synchronizer and the merge handler.
//!
//! # Example
//!
//! ```
//! use facility_sync::schema::{SchemaPolicy, SchemaRegistry, SyncMode};
//!
//! let registry = SchemaRegistry::builder()
//!     .register(SchemaPolicy::new("patient").with_selectors(["displayId", "firstName"]))
//!     .register(SchemaPolicy::new("report").with_sync(SyncMode::RemoteToLocal))
//!     .build();
//!
//! assert_eq!(registry.sync_mode("patient"), Some(SyncMode::On));
//! assert_eq!(registry.selectors("patient"), ["displayId", "firstName"]);
//! assert!(registry.selectors("report").is_empty());
//! assert!(registry.policy("unknown").is_err());
//! ```
//!
//! # Design
//!
//! - **Immutable**: no registration after [`SchemaRegistryBuilder::build`]
//! - **Defaults**: no filter = always visible, no selectors = always sent in full
//! - **Last registration wins** when the builder sees a type twice

use std::collections::HashMap;
use std::sync::Arc;

use crate::change::Change;
use crate::clients::Client;
use crate::error::{Direction, SyncError};
use crate::record::Record;

/// Which way records of a type flow.
///
/// Named from the client's side: "local" is the client's database, "remote"
/// is this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Both directions
    #[default]
    On,
    /// Not synced; no change log entries
    Off,
    /// Server → client only
    RemoteToLocal,
    /// Client → server only
    LocalToRemote,
}

impl SyncMode {
    #[must_use]
    pub fn allows(&self, direction: Direction) -> bool {
        match direction {
            Direction::Outbound => matches!(self, Self::On | Self::RemoteToLocal),
            Direction::Inbound => matches!(self, Self::On | Self::LocalToRemote),
        }
    }

    /// Whether mutations are written to the change log.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// What a visibility filter gets to look at.
///
/// `record` is `None` for removals and for records that no longer exist.
pub struct FilterContext<'a> {
    pub record: Option<&'a Record>,
    pub client: &'a Client,
    pub change: &'a Change,
}

pub type SyncFilter = Arc<dyn Fn(&FilterContext<'_>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SchemaPolicy {
    name: String,
    sync: SyncMode,
    filter: Option<SyncFilter>,
    selectors: Vec<String>,
}

impl std::fmt::Debug for SchemaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaPolicy")
            .field("name", &self.name)
            .field("sync", &self.sync)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("selectors", &self.selectors)
            .finish()
    }
}

impl SchemaPolicy {
    /// Policy with sync on, no filter, no selectors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sync: SyncMode::On,
            filter: None,
            selectors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Selector order is preserved; duplicates are dropped.
    #[must_use]
    pub fn with_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors.clear();
        for selector in selectors {
            let selector = selector.into();
            if !self.selectors.contains(&selector) {
                self.selectors.push(selector);
            }
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.sync
    }

    #[must_use]
    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    #[must_use]
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Run the filter; undeclared filters always pass.
    #[must_use]
    pub fn is_visible(&self, ctx: &FilterContext<'_>) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(ctx))
    }
}

/// Immutable record type → policy lookup.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    policies: HashMap<String, SchemaPolicy>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Policy for `record_type`, or [`SyncError::SchemaNotFound`].
    pub fn policy(&self, record_type: &str) -> Result<&SchemaPolicy, SyncError> {
        self.policies
            .get(record_type)
            .ok_or_else(|| SyncError::SchemaNotFound(record_type.to_string()))
    }

    #[must_use]
    pub fn get(&self, record_type: &str) -> Option<&SchemaPolicy> {
        self.policies.get(record_type)
    }

    #[must_use]
    pub fn sync_mode(&self, record_type: &str) -> Option<SyncMode> {
        self.policies.get(record_type).map(SchemaPolicy::sync_mode)
    }

    /// Empty for unknown types and types without selectors.
    #[must_use]
    pub fn selectors(&self, record_type: &str) -> &[String] {
        self.policies.get(record_type).map_or(&[], SchemaPolicy::selectors)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Registered record types, sorted.
    #[must_use]
    pub fn record_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    policies: Vec<SchemaPolicy>,
}

impl SchemaRegistryBuilder {
    #[must_use]
    pub fn register(mut self, policy: SchemaPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    #[must_use]
    pub fn build(self) -> SchemaRegistry {
        let mut policies = HashMap::with_capacity(self.policies.len());
        for policy in self.policies {
            policies.insert(policy.name.clone(), policy);
        }
        SchemaRegistry { policies }
    }
}
