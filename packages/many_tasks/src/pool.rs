//! Pool configuration and batch submission.

use std::num::NonZero;
use std::thread;
use std::time::Instant;

use new_zealand::nz;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::thread_workers::ThreadWorkers;
use crate::{
    BatchResults, CancellationToken, Chunk, ExecutionMode, FailurePolicy, InFlight, PoolError,
    Task, WorkerLifecycle, chunk_tasks,
};

/// Used when the host cannot tell how much parallelism it offers.
const FALLBACK_WORKERS: NonZero<usize> = nz!(1);

/// A fixed-size set of workers that executes batches of independent tasks.
///
/// A batch is split into chunks of `chunk_size` tasks. Workers pull chunks from a shared queue
/// until none are left, so a worker that finishes early immediately picks up more work. Each
/// chunk counts as one dispatch event. Results are returned in submission order regardless of
/// which worker ran which chunk and when.
///
/// The pool executes one batch at a time, which [`execute()`][Self::execute] enforces by taking
/// `&mut self`.
///
/// # Execution modes
///
/// * [`ExecutionMode::Thread`]: worker threads live as long as the pool and share the caller's
///   memory. Unless the global lock is disabled, task code runs one task at a time except inside
///   a [`parallel_section()`][crate::parallel_section].
/// * [`ExecutionMode::Process`]: each batch runs in freshly forked worker processes with their own
///   copy of memory. Only [`SharedCounter`][crate::SharedCounter] and
///   [`SharedStore`][crate::SharedStore] are shared with the caller.
///
/// # Example
///
/// ```
/// use many_tasks::{ExecutionMode, WorkerPool, from_fn};
///
/// let mut pool = WorkerPool::builder()
///     .workers(4)
///     .mode(ExecutionMode::Thread)
///     .global_lock(false)
///     .build()
///     .unwrap();
///
/// let tasks = (1..=100_u64).map(|i| from_fn(move || Ok(i * i))).collect();
/// let results = pool.execute(tasks, 10).unwrap();
///
/// assert_eq!(results.stats().chunks_dispatched(), 10);
/// assert_eq!(results.into_values().unwrap().iter().sum::<u64>(), 338_350);
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    workers: NonZero<usize>,
    mode: ExecutionMode,
    lifecycle: WorkerLifecycle,
    failure_policy: FailurePolicy,

    // Only present in thread mode. Worker processes only live as long as one batch.
    threads: Option<ThreadWorkers>,
}

impl WorkerPool {
    /// Creates a builder for configuring the pool.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// The number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.get()
    }

    /// The kind of execution context the workers run in.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Executes a batch of tasks and returns their results in submission order.
    ///
    /// The call returns once every task has run, or earlier if the pool uses
    /// [`FailurePolicy::FailFast`] and a task failed. Task failures do not make this call fail;
    /// they are reported per task in the returned [`BatchResults`].
    ///
    /// Task outputs must be serializable because in process mode they travel from the worker
    /// processes back to the caller. An output that does not survive the trip is reported as a
    /// failure of its task. Thread mode pools can run tasks with any output type through
    /// [`execute_shared()`][Self::execute_shared].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] if `chunk_size` is zero,
    /// [`PoolError::WorkerStartupFailure`] if a worker process cannot be started and
    /// [`PoolError::WorkerLost`] if a worker disappeared before executing all the tasks it was
    /// responsible for.
    pub fn execute<T>(
        &mut self,
        tasks: Vec<T>,
        chunk_size: usize,
    ) -> Result<BatchResults<T::Output>, PoolError>
    where
        T: Task,
        T::Output: Serialize + DeserializeOwned,
    {
        self.execute_cancellable(tasks, chunk_size, &CancellationToken::new())
    }

    /// Like [`execute()`][Self::execute] but stops dispatching chunks once `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`execute()`][Self::execute].
    pub fn execute_cancellable<T>(
        &mut self,
        tasks: Vec<T>,
        chunk_size: usize,
        token: &CancellationToken,
    ) -> Result<BatchResults<T::Output>, PoolError>
    where
        T: Task,
        T::Output: Serialize + DeserializeOwned,
    {
        let (chunks, task_count) = self.prepare(tasks, chunk_size)?;
        let started = Instant::now();

        let results = match self.mode {
            ExecutionMode::Thread => self.run_on_threads(chunks, task_count, token)?,
            #[cfg(unix)]
            ExecutionMode::Process => crate::process_workers::run_batch(
                &chunks,
                task_count,
                self.workers,
                self.lifecycle,
                self.failure_policy,
                token,
            )?,
            #[cfg(not(unix))]
            ExecutionMode::Process => {
                return Err(PoolError::invalid_configuration(
                    "process mode is only supported on unix",
                ));
            }
        };

        log_finished(started, &results);
        Ok(results)
    }

    /// Executes a batch of tasks on the worker threads of a thread mode pool.
    ///
    /// Behaves like [`execute()`][Self::execute], except that outputs stay in the caller's
    /// memory and need not be serializable. Tasks may return shared handles such as `Arc<T>`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] if the pool uses [`ExecutionMode::Process`]
    /// or if `chunk_size` is zero.
    pub fn execute_shared<T: Task>(
        &mut self,
        tasks: Vec<T>,
        chunk_size: usize,
    ) -> Result<BatchResults<T::Output>, PoolError> {
        self.execute_shared_cancellable(tasks, chunk_size, &CancellationToken::new())
    }

    /// Like [`execute_shared()`][Self::execute_shared] but stops dispatching chunks once `token`
    /// is cancelled.
    ///
    /// # Errors
    ///
    /// See [`execute_shared()`][Self::execute_shared].
    pub fn execute_shared_cancellable<T: Task>(
        &mut self,
        tasks: Vec<T>,
        chunk_size: usize,
        token: &CancellationToken,
    ) -> Result<BatchResults<T::Output>, PoolError> {
        if self.mode != ExecutionMode::Thread {
            return Err(PoolError::invalid_configuration(
                "outputs of worker processes must be serializable, use execute()",
            ));
        }

        let (chunks, task_count) = self.prepare(tasks, chunk_size)?;
        let started = Instant::now();

        let results = self.run_on_threads(chunks, task_count, token)?;

        log_finished(started, &results);
        Ok(results)
    }

    fn prepare<T: Task>(
        &self,
        tasks: Vec<T>,
        chunk_size: usize,
    ) -> Result<(Vec<Chunk<T>>, usize), PoolError> {
        let task_count = tasks.len();
        let chunks = chunk_tasks(tasks, chunk_size)?;

        debug!(
            tasks = task_count,
            chunks = chunks.len(),
            mode = ?self.mode,
            "executing batch"
        );

        Ok((chunks, task_count))
    }

    fn run_on_threads<T: Task>(
        &mut self,
        chunks: Vec<Chunk<T>>,
        task_count: usize,
        token: &CancellationToken,
    ) -> Result<BatchResults<T::Output>, PoolError> {
        let threads = self.threads.as_mut().ok_or_else(|| {
            PoolError::invalid_configuration("the pool has no worker threads")
        })?;

        threads.run_batch(
            chunks,
            task_count,
            self.lifecycle,
            self.failure_policy.is_fail_fast(),
            token,
        )
    }
}

fn log_finished<O>(started: Instant, results: &BatchResults<O>) {
    debug!(
        elapsed = ?started.elapsed(),
        chunks_dispatched = results.stats().chunks_dispatched(),
        workers_started = results.stats().workers_started(),
        complete = results.is_complete(),
        "batch finished"
    );
}

/// Builder for configuring a [`WorkerPool`].
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder {
    workers: Option<usize>,
    mode: ExecutionMode,
    lifecycle: WorkerLifecycle,
    failure_policy: FailurePolicy,
    global_lock: bool,
}

impl PoolBuilder {
    fn new() -> Self {
        Self {
            workers: None,
            mode: ExecutionMode::default(),
            lifecycle: WorkerLifecycle::default(),
            failure_policy: FailurePolicy::default(),
            global_lock: true,
        }
    }

    /// Sets the number of workers, which must be at least 1.
    ///
    /// Default is the available parallelism of the host.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    /// Sets the kind of execution context the workers run in.
    ///
    /// Default is [`ExecutionMode::Thread`].
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets how long each worker lives.
    ///
    /// Default is [`WorkerLifecycle::Pooled`].
    pub fn lifecycle(mut self, lifecycle: WorkerLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Sets what happens to the rest of a batch when a task fails.
    ///
    /// Default is [`FailurePolicy::Isolate`].
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets whether task code on worker threads runs under the pool-wide exclusivity lock.
    ///
    /// Only meaningful in [`ExecutionMode::Thread`]. Default is `true`.
    pub fn global_lock(mut self, enabled: bool) -> Self {
        self.global_lock = enabled;
        self
    }

    /// Builds the pool, starting worker threads in thread mode.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] if the worker count is zero, if
    /// [`InFlight::Terminate`] is combined with thread mode or if process mode is requested on a
    /// platform other than unix. Returns [`PoolError::WorkerStartupFailure`] if a worker thread
    /// cannot be started.
    pub fn build(self) -> Result<WorkerPool, PoolError> {
        let workers = match self.workers {
            Some(count) => NonZero::new(count).ok_or_else(|| {
                PoolError::invalid_configuration("a pool needs at least one worker")
            })?,
            None => thread::available_parallelism().unwrap_or(FALLBACK_WORKERS),
        };

        if self.mode == ExecutionMode::Thread
            && self.failure_policy == FailurePolicy::FailFast(InFlight::Terminate)
        {
            return Err(PoolError::invalid_configuration(
                "worker threads cannot be terminated, use InFlight::Finish or process mode",
            ));
        }

        if self.mode == ExecutionMode::Process && !cfg!(unix) {
            return Err(PoolError::invalid_configuration(
                "process mode is only supported on unix",
            ));
        }

        let threads = match self.mode {
            ExecutionMode::Thread => Some(ThreadWorkers::start(workers, self.global_lock)?),
            ExecutionMode::Process => None,
        };

        debug!(
            workers = workers.get(),
            mode = ?self.mode,
            lifecycle = ?self.lifecycle,
            failure_policy = ?self.failure_policy,
            "worker pool built"
        );

        Ok(WorkerPool {
            workers,
            mode: self.mode,
            lifecycle: self.lifecycle,
            failure_policy: self.failure_policy,
            threads,
        })
    }
}

/// Executes one batch on a pool that exists only for the duration of the call.
///
/// A shorthand for building a [`WorkerPool`] with `workers` workers in the given mode and the
/// default lifecycle and failure policy, then calling [`WorkerPool::execute()`]. For outputs
/// that cannot be serialized, build a thread mode pool and call
/// [`WorkerPool::execute_shared()`].
///
/// # Errors
///
/// See [`PoolBuilder::build()`] and [`WorkerPool::execute()`].
///
/// # Example
///
/// ```
/// use many_tasks::{ExecutionMode, from_fn, submit};
///
/// let tasks = (0..10).map(|i| from_fn(move || Ok(i + 1))).collect();
/// let results = submit(tasks, 3, 2, ExecutionMode::Thread).unwrap();
///
/// assert_eq!(results.into_values().unwrap(), (1..=10).collect::<Vec<_>>());
/// ```
pub fn submit<T>(
    tasks: Vec<T>,
    chunk_size: usize,
    workers: usize,
    mode: ExecutionMode,
) -> Result<BatchResults<T::Output>, PoolError>
where
    T: Task,
    T::Output: Serialize + DeserializeOwned,
{
    WorkerPool::builder()
        .workers(workers)
        .mode(mode)
        .build()?
        .execute(tasks, chunk_size)
}
