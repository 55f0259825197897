// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-client exponential backoff.
//!
//! A failed sync batch leaves the watermark where it was, so the next sweep
//! would retry the exact same batch. [`ClientBackoff`] spaces those retries
//! out per client. Nothing sleeps here: callers ask how long a client still
//! has to wait and skip it until then.
//!
//! # Example
//!
//! ```
//! use facility_sync::resilience::{ClientBackoff, RetryConfig};
//! use std::time::Duration;
//!
//! let backoff = ClientBackoff::new(RetryConfig::daemon());
//! assert_eq!(backoff.record_failure("c1"), Duration::from_secs(1));
//! assert_eq!(backoff.record_failure("c1"), Duration::from_secs(2));
//! assert!(backoff.remaining("c1").is_some());
//!
//! backoff.clear("c1");
//! assert!(backoff.remaining("c1").is_none());
//! ```

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::SyncServerConfig;

/// Exponential backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Never give up; 1s doubling, capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            factor: 2.0,
        }
    }

    /// Minimal delays for tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn from_config(config: &SyncServerConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            factor: config.retry_factor,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..failures {
            if delay >= self.max_delay {
                break;
            }
            let next = delay.as_secs_f64() * self.factor.max(1.0);
            // Out-of-range factors saturate at the cap
            delay = Duration::try_from_secs_f64(next)
                .unwrap_or(self.max_delay)
                .min(self.max_delay);
        }
        delay
    }
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
}

/// Failure count and retry deadline per client.
#[derive(Debug)]
pub struct ClientBackoff {
    config: parking_lot::RwLock<RetryConfig>,
    entries: DashMap<String, BackoffEntry>,
}

impl ClientBackoff {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
            entries: DashMap::new(),
        }
    }

    /// Swap the shape; existing deadlines stand.
    pub fn reconfigure(&self, config: RetryConfig) {
        *self.config.write() = config;
    }

    /// Count a failure and return the delay before the next attempt.
    pub fn record_failure(&self, client_id: &str) -> Duration {
        let config = self.config.read().clone();
        let mut entry = self.entries.entry(client_id.to_string()).or_insert(BackoffEntry {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = config.delay_for(entry.failures);
        entry.retry_at = Instant::now() + delay;
        delay
    }

    /// Time left before `client_id` may be retried, if any.
    #[must_use]
    pub fn remaining(&self, client_id: &str) -> Option<Duration> {
        let entry = self.entries.get(client_id)?;
        let now = Instant::now();
        (entry.retry_at > now).then(|| entry.retry_at - now)
    }

    #[must_use]
    pub fn failures(&self, client_id: &str) -> u32 {
        self.entries.get(client_id).map_or(0, |e| e.failures)
    }

    pub fn clear(&self, client_id: &str) {
        self.entries.remove(client_id);
    }

    /// Number of clients with a failure on record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0, // Aggressive factor
        };

        assert_eq!(config.delay_for(2), Duration::from_secs(5));
        assert_eq!(config.delay_for(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_factor_saturates_at_max() {
        for factor in [1e30, f64::INFINITY, f64::MAX] {
            let config = RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                factor,
            };
            assert_eq!(config.delay_for(2), Duration::from_secs(300));
            assert_eq!(config.delay_for(50), Duration::from_secs(300));
        }

        let backoff = ClientBackoff::new(RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
            factor: 1e30,
        });
        backoff.record_failure("c1");
        assert_eq!(backoff.record_failure("c1"), Duration::from_secs(60));
        assert_eq!(backoff.failures("c1"), 2);
    }

    #[test]
    fn test_daemon_preset() {
        let daemon = RetryConfig::daemon();
        assert_eq!(daemon.initial_delay, Duration::from_secs(1));
        assert_eq!(daemon.max_delay, Duration::from_secs(300));
        assert_eq!(RetryConfig::default(), daemon);
    }

    #[test]
    fn test_from_config() {
        let config = SyncServerConfig {
            retry_initial_delay_ms: 50,
            retry_max_delay_ms: 400,
            retry_factor: 3.0,
            ..Default::default()
        };
        let retry = RetryConfig::from_config(&config);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_millis(400));
        assert_eq!(retry.factor, 3.0);
    }

    #[tokio::test]
    async fn test_failures_grow_and_clear() {
        let backoff = ClientBackoff::new(RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        });

        assert!(backoff.remaining("c1").is_none());
        assert_eq!(backoff.record_failure("c1"), Duration::from_secs(10));
        assert_eq!(backoff.record_failure("c1"), Duration::from_secs(20));
        assert_eq!(backoff.failures("c1"), 2);
        assert!(backoff.remaining("c1").is_some());

        // Other clients are unaffected
        assert!(backoff.remaining("c2").is_none());
        assert_eq!(backoff.failures("c2"), 0);

        backoff.clear("c1");
        assert!(backoff.remaining("c1").is_none());
        assert!(backoff.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_passes() {
        let backoff = ClientBackoff::new(RetryConfig::test());
        backoff.record_failure("c1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backoff.remaining("c1").is_none());
        // Count survives until a success clears it
        assert_eq!(backoff.failures("c1"), 1);
    }

    #[test]
    fn test_reconfigure_applies_to_next_failure() {
        let backoff = ClientBackoff::new(RetryConfig::daemon());
        backoff.reconfigure(RetryConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        });
        assert_eq!(backoff.record_failure("c1"), Duration::from_millis(5));
    }
}
