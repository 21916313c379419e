//! Thread-local worker identification.
//!
//! Feeder worker threads record their index here when they start, so code running
//! inside a worker (subject preparation, error context) can tell which worker it
//! is on. The consumer thread has no id.

use std::cell::Cell;

thread_local! {
    /// Index of the feeder worker running on this thread (`0..num_workers`).
    pub static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Marks the current thread as feeder worker `worker_id`.
pub(crate) fn set_worker_id(worker_id: usize) {
    WORKER_ID.with(|id| id.set(Some(worker_id)));
}

/// The id of the feeder worker on this thread, or `None` off the pool.
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(|id| id.get())
}
