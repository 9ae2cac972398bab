//! Periodic sweep that auto-submits attempts left open past the exam end.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::MemoryStore;

/// Spawns the sweep loop on the current runtime.
#[must_use]
pub fn spawn(store: Arc<MemoryStore>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(store, every, cancel))
}

/// Runs the sweep loop until `cancel` fires.
pub async fn run(store: Arc<MemoryStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = every.as_secs(), "Maintenance sweep started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Maintenance sweep stopped");
                break;
            }
            _ = ticker.tick() => {
                let submitted = store.sweep(store.now()).await;
                if !submitted.is_empty() {
                    info!(count = submitted.len(), attempts = ?submitted, "Auto-submitted expired attempts");
                }
            }
        }
    }
}
