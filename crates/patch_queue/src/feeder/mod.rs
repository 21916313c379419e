//! Subject feeder.
//!
//! Turns a [`SubjectSource`] into a restartable stream of prepared subjects.
//!
//! ```text
//!   SubjectSource ──get(i)──> [worker threads, optional] ──> SubjectStream ──> PatchQueue
//!        ↑                                                        │
//!        └────── IndexSampler::iter(epoch) decides order() ───────┘
//! ```
//!
//! - `stream(epoch)` may be called any number of times; each call draws a new
//!   order (shuffled or sequential) and returns an independent stream.
//! - With `num_workers = 0` the consumer thread calls `source.get` itself.
//! - With `num_workers > 0` up to `num_workers` subjects are prepared concurrently
//!   ahead of the consumer. Results are re-ordered so the stream still yields
//!   subjects one at a time, in `order()`.
//! - After the last subject, `next()` returns `None` (end-of-sequence). Restarting is
//!   the caller's job.

pub(crate) mod pool;
pub mod thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::dataset::SubjectSource;
use crate::sampler::index::{IndexSampler, RandomSampler, SequentialSampler};
use crate::subject::Subject;
use pool::WorkerPool;
use thread::current_worker_id;

/// How often idle workers check for shutdown.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wraps a subject source into per-epoch streams.
pub struct SubjectFeeder {
    source: Arc<dyn SubjectSource>,
    order_sampler: Box<dyn IndexSampler>,
    num_workers: usize,
    worker_timeout: Duration,
}

impl SubjectFeeder {
    /// # Arguments
    /// - `source`: shared, read-only subject source
    /// - `num_workers`: subjects prepared concurrently ahead of consumption (0 = inline)
    /// - `shuffle`: draw a new random order for every stream
    /// - `seed`: base seed for the order; the stream for epoch `e` uses `seed + e`
    /// - `worker_timeout`: longest wait for one prepared subject
    pub fn new(
        source: Arc<dyn SubjectSource>,
        num_workers: usize,
        shuffle: bool,
        seed: u64,
        worker_timeout: Duration,
    ) -> Result<Self> {
        let order_sampler: Box<dyn IndexSampler> = if shuffle {
            Box::new(RandomSampler::new(source.len(), seed)?)
        } else {
            Box::new(SequentialSampler::new(source.len()))
        };

        Ok(Self {
            source,
            order_sampler,
            num_workers,
            worker_timeout,
        })
    }

    pub fn num_subjects(&self) -> usize {
        self.source.len()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Starts a stream over every subject, in the order drawn for `epoch`.
    pub fn stream(&self, epoch: usize) -> Result<SubjectStream> {
        let order: Vec<usize> = self.order_sampler.iter(epoch).collect();
        trace!(
            epoch,
            num_workers = self.num_workers,
            num_subjects = order.len(),
            "creating subject stream"
        );

        let mode = if self.num_workers == 0 {
            StreamMode::Inline {
                source: self.source.clone(),
            }
        } else {
            StreamMode::Parallel(self.spawn_workers(&order)?)
        };

        Ok(SubjectStream {
            order,
            position: 0,
            mode,
        })
    }

    fn spawn_workers(&self, order: &[usize]) -> Result<ParallelState> {
        // Never start more threads than there are subjects to prepare.
        let num_workers = self.num_workers.min(order.len()).max(1);
        let source = self.source.clone();

        let pool = WorkerPool::new(
            num_workers,
            num_workers,
            move |task_rx: Receiver<PrepareTask>,
                  output_tx: Sender<PreparedSubject>,
                  shutdown| {
                while !shutdown.load(Ordering::Relaxed) {
                    match task_rx.recv_timeout(WORKER_POLL_INTERVAL) {
                        Ok(task) => {
                            let result = prepare(source.as_ref(), task.index);
                            let output = PreparedSubject {
                                position: task.position,
                                result,
                            };
                            if output_tx.send(output).is_err() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            },
        )
        .context("Failed to create subject feeder workers")?;

        Ok(ParallelState {
            pool,
            dispatched: 0,
            pending: 0,
            ready: HashMap::new(),
            timeout: self.worker_timeout,
        })
    }
}

/// Loads one subject on a worker thread, turning a panic into an error.
fn prepare(source: &dyn SubjectSource, index: usize) -> Result<Subject> {
    let worker_id = current_worker_id().unwrap_or_default();
    panic::catch_unwind(AssertUnwindSafe(|| source.get(index)))
        .map_err(|_| anyhow!("Worker {} panicked while preparing subject {}", worker_id, index))?
        .with_context(|| format!("Worker {} failed to prepare subject {}", worker_id, index))
}

struct PrepareTask {
    position: usize,
    index: usize,
}

struct PreparedSubject {
    position: usize,
    result: Result<Subject>,
}

struct ParallelState {
    pool: WorkerPool<PrepareTask, PreparedSubject>,
    /// Next position to hand to a worker.
    dispatched: usize,
    /// Tasks submitted whose output has not been received yet, including tasks whose
    /// position was already given up on after a timeout.
    pending: usize,
    /// Finished subjects waiting for their turn.
    ready: HashMap<usize, Result<Subject>>,
    timeout: Duration,
}

enum StreamMode {
    Inline { source: Arc<dyn SubjectSource> },
    Parallel(ParallelState),
}

/// One pass over all subjects. Yields `Result<Subject>`; `None` is end-of-sequence.
///
/// Dropping a parallel stream shuts its workers down.
pub struct SubjectStream {
    order: Vec<usize>,
    position: usize,
    mode: StreamMode,
}

impl SubjectStream {
    /// Source indices in yield order: the `i`-th subject yielded is `order()[i]`.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Number of subjects already yielded.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Subjects handed to workers but not yet yielded.
    pub fn in_flight(&self) -> usize {
        match &self.mode {
            StreamMode::Inline { .. } => 0,
            StreamMode::Parallel(state) => state.pending + state.ready.len(),
        }
    }

    /// Keeps up to one subject per worker in preparation or waiting in `ready`.
    ///
    /// Outstanding outputs never exceed the output channel capacity, so workers never
    /// block on send.
    fn top_up(order: &[usize], position: usize, state: &mut ParallelState) -> Result<()> {
        let limit = state.pool.num_workers();
        // Positions skipped after a timeout are not worth preparing any more.
        state.dispatched = state.dispatched.max(position);
        while state.dispatched < order.len() && state.pending + state.ready.len() < limit {
            let task = PrepareTask {
                position: state.dispatched,
                index: order[state.dispatched],
            };
            state.pool.submit(task)?;
            state.dispatched += 1;
            state.pending += 1;
        }
        Ok(())
    }

    fn next_parallel(order: &[usize], position: usize, state: &mut ParallelState) -> Result<Subject> {
        loop {
            Self::top_up(order, position, state)?;
            if let Some(result) = state.ready.remove(&position) {
                return result;
            }
            let prepared = state.pool.receive(state.timeout).with_context(|| {
                format!(
                    "Failed to receive subject {} from feeder workers",
                    order[position]
                )
            })?;
            state.pending -= 1;
            if prepared.position < position {
                trace!(position = prepared.position, "discarding late subject");
                continue;
            }
            state.ready.insert(prepared.position, prepared.result);
        }
    }
}

impl Iterator for SubjectStream {
    type Item = Result<Subject>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = *self.order.get(self.position)?;
        let result = match &mut self.mode {
            StreamMode::Inline { source } => source.get(index),
            StreamMode::Parallel(state) => Self::next_parallel(&self.order, self.position, state),
        };
        // A failed position is skipped, so a later pull moves on instead of waiting
        // for a result that will never arrive.
        self.position += 1;
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len() - self.position;
        (remaining, Some(remaining))
    }
}
