// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Background quota refresh.
//!
//! One tokio task per provider that exposes a refresh interval. Each tick
//! invokes the provider's refresh hook with its usage manager so the
//! provider can pull quota baselines (window limits, reset times) from the
//! upstream and record them. Hook failures are logged and the loop keeps
//! running.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::UsageManager;
use crate::provider::Provider;

/// Handle to one provider's background refresh task
pub struct RefresherHandle {
    provider: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Spawn the refresh loop for a provider, or `None` when the provider
    /// declares no refresh interval. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(provider: Arc<dyn Provider>, usage: Arc<UsageManager>) -> Option<Self> {
        let interval = provider.refresh_interval()?;
        let name = provider.name().to_string();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it
            // so a freshly started process does not hammer the upstream
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(provider = %task_name, "running background quota refresh");
                        if let Err(err) = provider.refresh(&usage).await {
                            warn!(provider = %task_name, %err, "background refresh failed");
                        }
                        usage.maybe_flush().await;
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(provider = %task_name, "background refresher stopped");
        });

        Some(Self {
            provider: name,
            shutdown,
            task,
        })
    }

    /// Provider this refresher serves
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Signal the loop to stop and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(provider = %self.provider, %err, "refresher task join failed");
        }
    }
}
