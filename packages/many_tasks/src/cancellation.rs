use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stops a running batch from dispatching any further chunks.
///
/// Cancellation is cooperative: chunks that are already executing run to completion and their
/// results are kept, chunks that were not yet dispatched never run. The batch then returns its
/// partial results, for which [`BatchResults::was_cancelled()`][crate::BatchResults::was_cancelled]
/// is `true`.
///
/// Clones share the same cancellation state, so a clone can be moved to another thread and cancel
/// the batch from there. In thread mode that includes the tasks of the batch itself. A worker
/// process only has a copy of the token, so cancelling it from inside a task has no effect in
/// process mode.
///
/// # Example
///
/// ```
/// use many_tasks::{CancellationToken, WorkerPool, from_fn};
///
/// let token = CancellationToken::new();
/// token.cancel();
///
/// let mut pool = WorkerPool::builder().workers(2).build().unwrap();
/// let tasks = (0..10).map(|i| from_fn(move || Ok(i))).collect();
///
/// let results = pool.execute_cancellable(tasks, 1, &token).unwrap();
/// assert!(results.was_cancelled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every batch this token was passed to.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
