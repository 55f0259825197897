//! Server lifecycle: run loop and shutdown.
//!
//! The run loop multiplexes five event sources:
//!
//! | source | action |
//! |--------|--------|
//! | state watch | exit on `ShuttingDown` |
//! | config watch | swap live config, backoff shape, sweep interval |
//! | sweep interval | sweep active clients |
//! | store change feed | sweep active clients (lag degrades to the same) |
//! | subscribe triggers | sync that one client, clearing its backoff |
//!
//! Sync work runs in spawned tasks tracked by a `JoinSet`; shutdown waits
//! for them to finish.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncServerConfig;
use crate::resilience::RetryConfig;
use crate::sync::{OutboundSynchronizer, SyncOutcome, SyncTrigger};

use super::{ServerState, SyncServer};

impl SyncServer {
    /// Run the event loop until [`shutdown()`](Self::shutdown).
    ///
    /// Only the first call does anything; the subscribe trigger queue can
    /// have one consumer.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        let Some(mut triggers) = self.triggers_rx.lock().take() else {
            warn!("Sync server run loop already started");
            return;
        };
        let mut state_rx = self.state.subscribe();
        if *state_rx.borrow_and_update() == ServerState::ShuttingDown {
            return;
        }

        let _ = self.state.send(ServerState::Running);
        crate::metrics::set_server_state("Running");
        info!(
            sync_in = %self.sync_in_channel,
            out = %self.out_channel("{clientId}"),
            "Sync server running"
        );

        let mut config_rx = self.config_rx.lock().await;
        let mut changes = self.records.subscribe();
        let mut change_feed_open = true;
        let mut sweep = sweep_interval(&self.config.read());
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                Ok(()) = state_rx.changed() => {
                    if *state_rx.borrow_and_update() == ServerState::ShuttingDown {
                        break;
                    }
                }

                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    if self.apply_config(new_config) {
                        sweep = sweep_interval(&self.config.read());
                    }
                }

                _ = sweep.tick() => {
                    self.spawn_sweep(&mut tasks, SyncTrigger::Sweep);
                }

                received = changes.recv(), if change_feed_open => {
                    match received {
                        Ok(change) => {
                            let mut coalesced = 1usize;
                            while changes.try_recv().is_ok() {
                                coalesced += 1;
                            }
                            debug!(record_type = %change.record_type, coalesced, "Change committed");
                            self.spawn_sweep(&mut tasks, SyncTrigger::Change);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Change feed lagged; falling back to a full sweep");
                            crate::metrics::record_error("change_feed", "lagged");
                            self.spawn_sweep(&mut tasks, SyncTrigger::Change);
                        }
                        Err(RecvError::Closed) => {
                            warn!("Change feed closed; relying on periodic sweeps");
                            change_feed_open = false;
                        }
                    }
                }

                Some(client_id) = triggers.recv() => {
                    self.spawn_client_sync(&mut tasks, client_id);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Sync task panicked");
                        crate::metrics::record_error("run", "task_failed");
                    }
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight syncs");
        }
        while tasks.join_next().await.is_some() {}
        info!("Sync server run loop stopped");
    }

    /// Initiate graceful shutdown. The run loop finishes in-flight syncs and
    /// returns.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Initiating sync server shutdown...");
        let _ = self.state.send(ServerState::ShuttingDown);
        crate::metrics::set_server_state("ShuttingDown");
    }

    /// Returns whether the sweep interval changed.
    fn apply_config(&self, new_config: SyncServerConfig) -> bool {
        let mut config = self.config.write();
        if new_config.sync_in != config.sync_in || new_config.sync_out != config.sync_out {
            warn!("Channel names cannot change at runtime; keeping the current ones");
        }
        let interval_changed = new_config.sweep_interval_ms != config.sweep_interval_ms;
        self.outbound.backoff().reconfigure(RetryConfig::from_config(&new_config));
        info!(
            sweep_interval_ms = new_config.sweep_interval_ms,
            active_window_secs = new_config.active_window_secs,
            "Config updated"
        );
        *config = new_config;
        interval_changed
    }

    fn spawn_sweep(&self, tasks: &mut JoinSet<()>, trigger: SyncTrigger) {
        let outbound: Arc<OutboundSynchronizer> = Arc::clone(&self.outbound);
        let window = self.config.read().active_window();
        tasks.spawn(async move {
            match outbound.sync_active_clients(window, trigger).await {
                Ok(summary) => {
                    debug!(
                        trigger = trigger.as_str(),
                        clients = summary.clients,
                        published = summary.published,
                        failed = summary.failed.len(),
                        "Sweep done"
                    );
                }
                Err(e) => {
                    warn!(trigger = trigger.as_str(), error = %e, "Sweep could not list active clients");
                    crate::metrics::record_error("sweep", e.kind());
                }
            }
        });
    }

    fn spawn_client_sync(&self, tasks: &mut JoinSet<()>, client_id: String) {
        let outbound = Arc::clone(&self.outbound);
        tasks.spawn(async move {
            match outbound.sync_client(&client_id, SyncTrigger::Subscribe).await {
                Ok(SyncOutcome::Delivered { published, watermark, .. }) => {
                    debug!(client_id = %client_id, published, watermark, "Subscribe sync delivered");
                }
                Ok(_) => {}
                // Already logged and counted by the synchronizer
                Err(_) => {}
            }
        });
    }
}

fn sweep_interval(config: &SyncServerConfig) -> Interval {
    let mut sweep = interval(config.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep
}
