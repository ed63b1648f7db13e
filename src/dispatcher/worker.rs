//! Fetch worker pool.

use crate::dispatcher::handler::LoadHandler;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info};

/// A single worker instance.
///
/// Each worker runs in its own task and pulls claimed entry ids off the
/// shared dispatch channel, processing one entry to completion at a time.
pub struct Worker {
    id: usize, // For logging purposes
    handler: Arc<LoadHandler>,
    jobs: Arc<Mutex<mpsc::Receiver<i32>>>,
}

impl Worker {
    pub fn new(id: usize, handler: Arc<LoadHandler>, jobs: Arc<Mutex<mpsc::Receiver<i32>>>) -> Self {
        Self { id, handler, jobs }
    }

    /// Runs the worker's main loop.
    ///
    /// Shutdown is observed between entries; an in-flight entry runs to
    /// completion first. The loop also ends when the dispatch channel
    /// closes (all scheduler loops gone).
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = self.id, "Worker started");
        loop {
            let next = tokio::select! {
                next = self.next_job() => next,
                _ = shutdown_rx.recv() => break,
            };

            match next {
                Some(entry_id) => {
                    debug!(worker_id = self.id, entry_id, "Picked up entry");
                    self.handler.handle(entry_id).await;
                }
                None => break,
            }
        }
        info!(worker_id = self.id, "Worker exiting");
    }

    async fn next_job(&self) -> Option<i32> {
        self.jobs.lock().await.recv().await
    }
}
