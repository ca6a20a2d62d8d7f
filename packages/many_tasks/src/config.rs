/// The kind of execution context that workers run in.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ExecutionMode {
    /// Workers are threads in the caller's process and share its memory.
    ///
    /// Task code runs under the pool's global exclusivity lock unless the pool was built with
    /// [`global_lock(false)`][crate::PoolBuilder::global_lock] or the code is inside a
    /// [`parallel_section()`][crate::parallel_section]. Without either, CPU-bound batches run no
    /// faster than sequential execution.
    #[default]
    Thread,

    /// Workers are separate operating system processes with their own memory.
    ///
    /// Each worker process starts from a copy of the caller's memory at the moment the batch is
    /// submitted. Changes a task makes to ordinary memory (including globals) are invisible to
    /// the caller and to other workers; only [`SharedCounter`][crate::SharedCounter] and
    /// [`SharedStore`][crate::SharedStore] are shared. Task outputs are serialized back to the
    /// caller, so they must implement `serde::Serialize` and `serde::Deserialize`.
    ///
    /// Only supported on unix.
    Process,
}

/// How long a worker lives.
///
/// The cost difference between the two is reported per batch by
/// [`DispatchStats::workers_started()`][crate::DispatchStats::workers_started].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum WorkerLifecycle {
    /// Workers are created once and execute many chunks.
    ///
    /// Worker threads live as long as the pool. Worker processes live for one batch, during
    /// which each of them claims chunks until none are left.
    #[default]
    Pooled,

    /// Every task gets a freshly created thread or process that exits once the task is done.
    ///
    /// This is the naive model. It pays the full startup cost of an execution context per task,
    /// which is usually far more than the task itself costs.
    PerTask,
}

/// What happens to the rest of the batch when a task fails.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FailurePolicy {
    /// Every chunk runs; each failure is reported next to the successful results.
    #[default]
    Isolate,

    /// The first failure stops the batch.
    ///
    /// The failing chunk stops at the failed task, chunks that were not yet dispatched are
    /// dropped and the call returns immediately with the partial results plus the failure.
    /// Chunks that are in flight on other workers are treated according to [`InFlight`].
    FailFast(InFlight),
}

/// How chunks that are already executing are treated when a fail-fast batch halts.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum InFlight {
    /// In-flight chunks run to completion in the background; their results are discarded.
    #[default]
    Finish,

    /// Worker processes are killed, discarding any partial progress within their chunks.
    ///
    /// Only available in [`ExecutionMode::Process`] because threads cannot be forcibly
    /// terminated.
    Terminate,
}

impl FailurePolicy {
    pub(crate) fn is_fail_fast(self) -> bool {
        matches!(self, Self::FailFast(_))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Thread);
        assert_eq!(WorkerLifecycle::default(), WorkerLifecycle::Pooled);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Isolate);
        assert_eq!(InFlight::default(), InFlight::Finish);
    }

    #[test]
    fn fail_fast_detection() {
        assert!(!FailurePolicy::Isolate.is_fail_fast());
        assert!(FailurePolicy::FailFast(InFlight::Finish).is_fail_fast());
        assert!(FailurePolicy::FailFast(InFlight::Terminate).is_fail_fast());
    }
}
