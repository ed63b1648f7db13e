//! Periodic queue jobs: claim-and-dispatch, fill, garbage collection.
//!
//! Each job is a small timer loop on the shared runtime; the DB carries all
//! cross-process coordination, so nothing here persists its own schedule.

use crate::queue::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

/// How often the dispatch window is claimed.
const PREPARE_INTERVAL: Duration = Duration::from_millis(200);

/// How often under-filled tokens are topped up.
const FILL_INTERVAL: Duration = Duration::from_secs(30);

/// How often stranded entries are pruned, and how far in the past an entry
/// must be to count as stranded.
const GC_INTERVAL: Duration = Duration::from_secs(120);
const GC_DEPTH_SECONDS: f64 = 120.0;

/// Periodic jobs feeding the worker pool.
#[derive(Clone)]
pub struct Scheduler {
    manager: Arc<QueueManager>,
    job_tx: mpsc::Sender<i32>,
}

impl Scheduler {
    pub fn new(manager: Arc<QueueManager>, job_tx: mpsc::Sender<i32>) -> Self {
        Self { manager, job_tx }
    }

    /// Claim the current time window and hand every claimed entry to the
    /// worker pool.
    pub async fn run_prepare(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = time::interval(PREPARE_INTERVAL);
        // A full worker channel must not be repaid with a burst of catch-up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.manager.next_entries().await {
                        Ok(entries) => {
                            if entries.is_empty() {
                                continue;
                            }
                            info!(count = entries.len(), "Dispatching claimed entries");
                            for entry in entries {
                                if self.job_tx.send(entry.entry.id).await.is_err() {
                                    // Worker pool is gone; nothing left to feed.
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = ?e, "Failed to claim dispatch window"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Prepare loop exiting");
    }

    /// Top up under-filled tokens from the TO_DO base objects.
    pub async fn run_fill(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = time::interval(FILL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.manager.fill().await {
                        warn!(error = ?e, "Queue fill failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Fill loop exiting");
    }

    /// Prune entries stranded far in the past.
    pub async fn run_gc(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = time::interval(GC_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.manager.delete_ancient(GC_DEPTH_SECONDS).await {
                        warn!(error = ?e, "Queue garbage collection failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Garbage-collect loop exiting");
    }
}
