//! Bounded worker pool for batches of independent async tasks
//!
//! - Fixed number of worker tasks pulling from one bounded queue
//! - `submit` waits while the queue is full
//! - `drain` closes the queue and waits for every submitted task
//!
//! The pool is not fail-fast: a failing task does not stop the others, and
//! errors are only inspected once the whole batch has drained.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::types::{KmsError, Result};

type BoxedTask<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Task queued in the pool, tagged with its submission order
struct QueuedTask<T> {
    index: usize,
    task: BoxedTask<T>,
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Maximum queued tasks before `submit` waits
    pub max_queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 1000,
        }
    }
}

/// Result of one task with how long it ran.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub index: usize,
    pub result: Result<T>,
    pub latency: Duration,
}

/// Every outcome of a drained batch, in submission order.
#[derive(Debug)]
pub struct BatchResults<T> {
    pub outcomes: Vec<TaskOutcome<T>>,
}

impl<T> BatchResults<T> {
    /// Error of the earliest submitted task that failed.
    pub fn first_error(&self) -> Option<&KmsError> {
        self.outcomes.iter().find_map(|o| o.result.as_ref().err())
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

pub struct WorkerPool<T> {
    task_tx: mpsc::Sender<QueuedTask<T>>,
    result_rx: mpsc::UnboundedReceiver<TaskOutcome<T>>,
    workers: Vec<JoinHandle<()>>,
    submitted: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create and start a new worker pool
    pub fn new(config: PoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let (task_tx, task_rx) = mpsc::channel::<QueuedTask<T>>(config.max_queue_size.max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let workers = (0..worker_count)
            .map(|i| {
                let task_rx = Arc::clone(&task_rx);
                let result_tx = result_tx.clone();
                tokio::spawn(async move { worker_task(i, task_rx, result_tx).await })
            })
            .collect();

        info!(
            "Worker pool started with {} workers (queue {})",
            worker_count, config.max_queue_size
        );

        Self {
            task_tx,
            result_rx,
            workers,
            submitted: 0,
        }
    }

    /// Queue a task, waiting while the queue is full.
    pub async fn submit<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let queued = QueuedTask {
            index: self.submitted,
            task: Box::pin(task),
        };
        self.task_tx
            .send(queued)
            .await
            .map_err(|_| KmsError::Internal("Worker pool closed".into()))?;
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Close the queue, wait for every task and collect all outcomes.
    pub async fn drain(self) -> BatchResults<T> {
        let Self {
            task_tx,
            mut result_rx,
            workers,
            submitted,
        } = self;
        drop(task_tx);

        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        let mut outcomes = Vec::with_capacity(submitted);
        while let Some(outcome) = result_rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);

        debug!("Worker pool drained {} of {} tasks", outcomes.len(), submitted);
        BatchResults { outcomes }
    }
}

/// Worker task that runs queued tasks until the queue closes
async fn worker_task<T>(
    worker_id: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<QueuedTask<T>>>>,
    result_tx: mpsc::UnboundedSender<TaskOutcome<T>>,
) {
    loop {
        let queued = {
            let mut rx = task_rx.lock().await;
            match rx.recv().await {
                Some(t) => t,
                None => {
                    debug!("Worker {} shutting down (queue closed)", worker_id);
                    return;
                }
            }
        };

        let started = Instant::now();
        let result = queued.task.await;
        let outcome = TaskOutcome {
            index: queued.index,
            result,
            latency: started.elapsed(),
        };

        if result_tx.send(outcome).is_err() {
            return;
        }
    }
}
