// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process pub/sub bus.
//!
//! One `tokio::sync::broadcast` channel per channel name, created lazily on
//! first subscribe. Publishing to a channel nobody listens on succeeds and
//! the payload is dropped, same as a real broker. A channel whose receivers
//! have all been dropped is pruned on its next publish.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::{Publisher, TransportError};

const DEFAULT_CAPACITY: usize = 256;

pub struct LocalBus {
    channels: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
    published: AtomicU64,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is per channel; slow subscribers see `Lagged`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.sender(channel).subscribe()
    }

    /// Total payloads accepted since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for LocalBus {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        let sender = self.channels.get(channel).map(|tx| tx.clone());
        let receivers = sender.map_or(0, |tx| tx.send(payload).unwrap_or(0));
        if receivers == 0 {
            // Recheck under the shard lock so a racing subscribe keeps its channel
            self.channels.remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(channel, receivers, "Published");
        Ok(())
    }
}
