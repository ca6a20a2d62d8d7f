use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;
use serde::{Deserialize, Serialize};

static NEXT_THREAD_SEQUENCE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_SEQUENCE: u64 = NEXT_THREAD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
}

/// Identifies the execution context (worker) that ran a task.
///
/// The identity combines the operating system process ID with a sequence number that is unique
/// per thread within the process. It is stable for the lifetime of a worker, so it can be used
/// as a key when grouping results by the worker that produced them.
///
/// A forked worker process inherits the thread sequence number of the thread that forked it,
/// which is fine because the process ID differs.
///
/// # Example
///
/// ```
/// use many_tasks::current_worker_id;
///
/// let here = current_worker_id();
/// assert_eq!(here.process_id(), std::process::id());
/// assert_eq!(here, current_worker_id());
/// ```
#[derive(
    Clone, Copy, Debug, Display, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[display("{process_id}:{thread_sequence}")]
pub struct WorkerId {
    process_id: u32,
    thread_sequence: u64,
}

impl WorkerId {
    /// The operating system process ID of the worker.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// The sequence number of the worker thread within its process.
    #[must_use]
    pub fn thread_sequence(&self) -> u64 {
        self.thread_sequence
    }
}

/// Returns the identity of the current execution context.
///
/// Inside a task this is the identity of the worker executing the task. Outside of any pool it
/// identifies the calling thread.
#[must_use]
pub fn current_worker_id() -> WorkerId {
    WorkerId {
        process_id: process::id(),
        thread_sequence: THREAD_SEQUENCE.with(|sequence| *sequence),
    }
}
