//! Worker pool router.
//!
//! Owns the worker clients and runs one consumer task per worker. Every task
//! pulls from the shared priority queue, so the first idle worker always
//! picks up the highest-priority waiting record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::dispatch::queue::PriorityQueue;
use crate::dispatch::worker::{WorkerClient, WorkerError};

pub struct WorkerRouter {
    workers: Vec<Arc<WorkerClient>>,
    queue: Arc<PriorityQueue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRouter {
    /// Build a client for every worker address. Connections are lazy, so
    /// this only fails on a malformed address.
    pub fn new(
        addresses: &[String],
        queue: Arc<PriorityQueue>,
        deadline: Duration,
    ) -> Result<Self, WorkerError> {
        let mut workers = Vec::with_capacity(addresses.len());
        for (i, address) in addresses.iter().enumerate() {
            let id = format!("worker-{}", i);
            let worker = WorkerClient::connect(&id, address, deadline)?;
            tracing::info!("Registered worker {} ({})", id, address);
            workers.push(Arc::new(worker));
        }
        Ok(Self {
            workers,
            queue,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[Arc<WorkerClient>] {
        &self.workers
    }

    /// Launch one consumer loop per worker.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let queue = Arc::clone(&self.queue);
            tasks.push(tokio::spawn(consumer_loop(worker, queue)));
        }
    }

    /// Orderly shutdown: stop accepting submissions, let queued and in-flight
    /// records finish, then reap the consumer tasks.
    ///
    /// The caller bounds this with its graceful-shutdown timeout.
    pub async fn close(&self) {
        self.queue.close().await;
        self.queue.wait_drain().await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("Inference router stopped");
    }
}

async fn consumer_loop(worker: Arc<WorkerClient>, queue: Arc<PriorityQueue>) {
    tracing::info!("Worker {} entering processing loop", worker.id);
    while let Some(request) = queue.pop().await {
        worker.process(request).await;
        queue.done().await;
    }
    tracing::debug!("Worker {} exiting: queue closed", worker.id);
}
