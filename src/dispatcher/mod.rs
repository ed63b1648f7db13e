//! The dispatcher service: periodic queue jobs plus the fetch worker pool.

pub mod handler;
pub mod scheduler;
pub mod worker;

use crate::error::Result;
use crate::queue::QueueManager;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use self::handler::LoadHandler;
use self::scheduler::Scheduler;
use self::worker::Worker;

/// Owns the lifecycle of the scheduler loops and the worker pool.
pub struct DispatcherService {
    manager: Arc<QueueManager>,
    handler: Arc<LoadHandler>,
    worker_count: usize,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl DispatcherService {
    pub fn new(manager: Arc<QueueManager>, handler: Arc<LoadHandler>, worker_count: usize) -> Self {
        Self {
            manager,
            handler,
            worker_count,
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Resets the queue and spawns the periodic jobs and the worker pool.
    ///
    /// The truncate runs first: claims left TO_PROCESS by a previous run
    /// must never be reprocessed, and re-fill restores pacing from scratch.
    pub async fn start(&mut self) -> Result<()> {
        self.manager.truncate().await?;
        info!("Queue truncated at startup");

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Bounded so a slow pool backpressures the prepare loop instead of
        // accumulating claimed-but-unprocessed ids.
        let (job_tx, job_rx) = mpsc::channel::<i32>(self.worker_count * 4);
        let job_rx = Arc::new(Mutex::new(job_rx));

        for id in 0..self.worker_count {
            let worker = Worker::new(id, self.handler.clone(), job_rx.clone());
            let shutdown_rx = shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            }));
        }
        info!(worker_count = self.worker_count, "Spawned fetch workers");

        let scheduler = Scheduler::new(self.manager.clone(), job_tx);

        let prepare = scheduler.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            prepare.run_prepare(shutdown_rx).await;
        }));

        let fill = scheduler.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            fill.run_fill(shutdown_rx).await;
        }));

        let gc = scheduler;
        let shutdown_rx = shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            gc.run_gc(shutdown_rx).await;
        }));

        info!("Dispatcher service started");
        Ok(())
    }

    /// Signal every task and wait for the pool to drain.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(anyhow::anyhow!("dispatcher was never started"));
        };
        let _ = shutdown_tx.send(());

        let results = futures::future::join_all(std::mem::take(&mut self.handles)).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "Some dispatcher tasks panicked during shutdown");
            return Err(anyhow::anyhow!("{failed} task(s) panicked"));
        }

        info!("All dispatcher tasks shut down gracefully");
        Ok(())
    }
}
