//! TTL-based cleanup for the in-process fan-out store.
//!
//! Reads already skip expired entries; the reaper bounds memory held by
//! recipients nobody polls for.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::MemoryFanoutStore;

/// Background task that sweeps expired fan-out entries.
pub struct TtlReaper {
    store: Arc<MemoryFanoutStore>,
    interval: Duration,
}

impl TtlReaper {
    /// Create a reaper sweeping every minute.
    pub fn new(store: Arc<MemoryFanoutStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(60),
        }
    }

    /// Set custom cleanup interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the reaper as a background task.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let removed = self.run_once();
                if removed > 0 {
                    debug!(removed, "TTL reaper removed expired fan-out entries");
                }
            }
        })
    }

    /// Run cleanup once (for testing or manual invocation).
    pub fn run_once(&self) -> usize {
        self.store.reap_expired()
    }
}
