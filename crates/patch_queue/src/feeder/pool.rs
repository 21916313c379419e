//! Worker pool used by the feeder to prepare subjects in parallel.
//!
//! - Bounded channels keep at most `buffer_size` tasks and outputs in memory.
//! - Workers pull from one shared task queue, so a slow subject does not hold up
//!   the others.
//! - Dropping the pool signals shutdown, closes the task channel and joins every
//!   thread.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::thread::set_worker_id;

/// Thread pool with one shared task channel and one shared output channel.
///
/// # Type Parameters
/// - `Task`: work items sent to workers
/// - `Output`: results returned from workers
pub(crate) struct WorkerPool<Task, Output> {
    workers: Vec<thread::JoinHandle<()>>,
    task_tx: Option<Sender<Task>>,
    output_rx: Option<Receiver<Output>>,
    shutdown: Arc<AtomicBool>,
}

impl<Task, Output> WorkerPool<Task, Output>
where
    Task: Send + 'static,
    Output: Send + 'static,
{
    /// Spawns `num_workers` threads running `worker_fn`.
    ///
    /// `buffer_size` bounds both channels. Callers that never have more than
    /// `buffer_size` tasks outstanding can rely on workers never blocking on send.
    pub(crate) fn new<F>(num_workers: usize, buffer_size: usize, worker_fn: F) -> Result<Self>
    where
        F: Fn(Receiver<Task>, Sender<Output>, Arc<AtomicBool>) + Send + Sync + 'static,
    {
        if num_workers == 0 {
            return Err(anyhow!(
                "Cannot create WorkerPool with 0 workers. \
                Either set num_workers > 0 or prepare subjects on the calling thread."
            ));
        }

        if buffer_size == 0 {
            return Err(anyhow!(
                "Cannot create WorkerPool with buffer_size 0. \
                Buffer size must be > 0 to prevent deadlocks."
            ));
        }

        let (task_tx, task_rx) = bounded(buffer_size);
        let (output_tx, output_rx) = bounded(buffer_size);

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_fn = Arc::new(worker_fn);
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let task_rx = task_rx.clone();
            let output_tx = output_tx.clone();
            let shutdown_clone = shutdown.clone();
            let worker_fn_clone = worker_fn.clone();

            let handle = thread::Builder::new()
                .name(format!("subject-feeder-{}", worker_id))
                .spawn(move || {
                    set_worker_id(worker_id);
                    worker_fn_clone(task_rx, output_tx, shutdown_clone);
                })
                .with_context(|| format!("Failed to spawn worker thread {}", worker_id))?;

            workers.push(handle);
        }

        Ok(Self {
            workers,
            task_tx: Some(task_tx),
            output_rx: Some(output_rx),
            shutdown,
        })
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queues one task. Blocks while the task channel is full.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.task_tx
            .as_ref()
            .ok_or_else(|| anyhow!("Worker pool is shutting down"))?
            .send(task)
            .map_err(|_| anyhow!("All feeder workers have exited"))
    }

    /// Waits up to `timeout` for the next output from any worker.
    pub(crate) fn receive(&self, timeout: Duration) -> Result<Output> {
        let output_rx = self
            .output_rx
            .as_ref()
            .ok_or_else(|| anyhow!("Worker pool is shutting down"))?;
        output_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => anyhow!(
                "Worker timeout after {:?} - possible deadlock or slow subject loading",
                timeout
            ),
            RecvTimeoutError::Disconnected => {
                anyhow!("Worker channel disconnected - workers may have crashed")
            }
        })
    }
}

impl<Task, Output> Drop for WorkerPool<Task, Output> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Closing the task channel wakes workers blocked on recv; closing the output
        // channel makes a pending send fail instead of blocking forever.
        self.task_tx.take();
        self.output_rx.take();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
