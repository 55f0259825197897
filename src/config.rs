//! Configuration for the sync server.
//!
//! # Example
//!
//! ```
//! use facility_sync::SyncServerConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = SyncServerConfig::default();
//! assert_eq!(config.sync_in_channel(), "/in");
//! assert_eq!(config.out_channel("client-1"), "/out/client-1");
//! assert_eq!(config.active_window(), Duration::from_secs(30 * 60));
//!
//! // Tuned config
//! let config = SyncServerConfig {
//!     sweep_interval_ms: 1_000,
//!     publish_concurrency: 8,
//!     client_ttl_secs: Some(7 * 24 * 3600),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the sync server.
///
/// All fields have sensible defaults. A running server picks up a new value
/// sent on its config `watch` channel; channel names and capacities are read
/// once at construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncServerConfig {
    /// Client → server channel name, without the leading slash
    #[serde(default = "default_sync_in")]
    pub sync_in: String,

    /// Server → client channel prefix; each client gets `/{sync_out}/{clientId}`
    #[serde(default = "default_sync_out")]
    pub sync_out: String,

    /// Clients authenticated within this window are swept (default: 30 min)
    #[serde(default = "default_active_window_secs")]
    pub active_window_secs: u64,

    /// Periodic sweep interval
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Max in-flight publishes per client batch
    #[serde(default = "default_publish_concurrency")]
    pub publish_concurrency: usize,

    /// Backoff after a failed batch
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,

    /// Issued credentials expire after this long (None = never)
    #[serde(default)]
    pub client_ttl_secs: Option<u64>,

    /// Change broadcast buffer for the in-memory store
    #[serde(default = "default_change_channel_capacity")]
    pub change_channel_capacity: usize,

    /// Pending subscribe triggers before new ones are dropped
    #[serde(default = "default_trigger_channel_capacity")]
    pub trigger_channel_capacity: usize,
}

fn default_sync_in() -> String { "in".to_string() }
fn default_sync_out() -> String { "out".to_string() }
fn default_active_window_secs() -> u64 { 30 * 60 }
fn default_sweep_interval_ms() -> u64 { 5_000 }
fn default_publish_concurrency() -> usize { 32 }
fn default_retry_initial_delay_ms() -> u64 { 1_000 }
fn default_retry_max_delay_ms() -> u64 { 300_000 } // 5 minutes
fn default_retry_factor() -> f64 { 2.0 }
fn default_change_channel_capacity() -> usize { 1024 }
fn default_trigger_channel_capacity() -> usize { 256 }

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            sync_in: default_sync_in(),
            sync_out: default_sync_out(),
            active_window_secs: default_active_window_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            publish_concurrency: default_publish_concurrency(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_factor: default_retry_factor(),
            client_ttl_secs: None,
            change_channel_capacity: default_change_channel_capacity(),
            trigger_channel_capacity: default_trigger_channel_capacity(),
        }
    }
}

impl SyncServerConfig {
    /// `/{sync_in}`
    #[must_use]
    pub fn sync_in_channel(&self) -> String {
        format!("/{}", self.sync_in.trim_matches('/'))
    }

    /// `/{sync_out}/{client_id}`
    #[must_use]
    pub fn out_channel(&self, client_id: &str) -> String {
        format!("/{}/{}", self.sync_out.trim_matches('/'), client_id)
    }

    #[must_use]
    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    /// Never zero; `tokio::time::interval` panics on a zero period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    #[must_use]
    pub fn client_ttl(&self) -> Option<Duration> {
        self.client_ttl_secs.map(Duration::from_secs)
    }
}
