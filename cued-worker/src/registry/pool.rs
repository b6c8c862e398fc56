//! Fixed-size worker pool
//!
//! `concurrency` tokio tasks pull jobs from one shared channel and run each
//! to completion in its own task, so a panicking job does not take its worker
//! down. A job whose token is already cancelled when a worker picks it up is
//! discarded unrun.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type PoolTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct PoolJob {
    pub user_id: String,
    pub cancel: CancellationToken,
    pub task: PoolTask,
}

impl PoolJob {
    pub fn new<F>(user_id: impl Into<String>, cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            user_id: user_id.into(),
            cancel,
            task: Box::pin(task),
        }
    }
}

/// Returned by [`WorkerPool::submit`] after shutdown; hands the job back
pub struct PoolClosed(pub PoolJob);

pub struct WorkerPool {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<PoolJob>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl WorkerPool {
    /// Spawn the workers on the current runtime
    pub fn spawn(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<PoolJob>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..concurrency)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&rx))))
            .collect();

        info!(concurrency, "Worker pool started");

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(workers),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn submit(&self, job: PoolJob) -> Result<(), PoolClosed> {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| PoolClosed(e.0)),
            None => Err(PoolClosed(job)),
        }
    }

    /// Stop accepting jobs and wait for the workers to drain the queue
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        drop(sender);

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, rx: Arc<Mutex<mpsc::UnboundedReceiver<PoolJob>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(job) = next else {
            debug!(worker_id, "Job channel closed, worker exiting");
            return;
        };

        if job.cancel.is_cancelled() {
            debug!(worker_id, user_id = %job.user_id, "Discarding job cancelled while waiting");
            continue;
        }

        debug!(worker_id, user_id = %job.user_id, "Worker picked up job");
        if let Err(e) = tokio::spawn(job.task).await {
            warn!(worker_id, user_id = %job.user_id, error = %e, "Job ended abnormally");
        }
    }
}
