//! Long-lived worker threads that pull chunks from a shared queue.

use std::io;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use crossbeam::queue::SegQueue;
use tracing::{debug, trace};

use crate::exclusivity::{ExclusivityLock, run_exclusive};
use crate::results::{Collector, Halt};
use crate::task::execute_guarded;
use crate::{
    BatchResults, CancellationToken, Chunk, PoolError, Task, TaskError, TaskResult,
    WorkerLifecycle, current_worker_id,
};

/// A fixed set of threads that live as long as the pool and execute one batch at a time.
#[derive(Debug)]
pub(crate) struct ThreadWorkers {
    command_txs: Vec<mpsc::Sender<Command>>,
    join_handles: Vec<JoinHandle<()>>,
    lock: Option<Arc<ExclusivityLock>>,
}

impl ThreadWorkers {
    /// Starts `count` worker threads. If `global_lock` is set, task code on these threads runs
    /// under a shared exclusivity lock.
    pub(crate) fn start(count: NonZero<usize>, global_lock: bool) -> Result<Self, PoolError> {
        let mut command_txs = Vec::with_capacity(count.get());
        let mut join_handles = Vec::with_capacity(count.get());

        for worker in 0..count.get() {
            let (tx, rx) = mpsc::channel();

            let handle = thread::Builder::new()
                .name(format!("many_tasks-w{worker}"))
                .spawn(move || worker_entrypoint(&rx))
                .map_err(|source| PoolError::WorkerStartupFailure { worker, source })?;

            command_txs.push(tx);
            join_handles.push(handle);
        }

        debug!(workers = count.get(), global_lock, "started worker threads");

        Ok(Self {
            command_txs,
            join_handles,
            lock: global_lock.then(ExclusivityLock::new),
        })
    }

    /// Executes the chunks of one batch, returning once every chunk was executed, the batch was
    /// cancelled or (with `fail_fast`) the first task failed.
    #[cfg_attr(test, mutants::skip)] // If work does not get enqueued, deadlocks are very easy.
    pub(crate) fn run_batch<T: Task>(
        &mut self,
        chunks: Vec<Chunk<T>>,
        task_count: usize,
        lifecycle: WorkerLifecycle,
        fail_fast: bool,
        token: &CancellationToken,
    ) -> Result<BatchResults<T::Output>, PoolError> {
        let chunks_total = chunks.len();
        let mut collector = Collector::new(task_count, chunks_total);

        let queue = SegQueue::new();
        for chunk in chunks {
            queue.push(chunk);
        }

        let batch = Arc::new(ThreadBatch {
            queue,
            cancelled: AtomicBool::new(false),
            dispatched: AtomicUsize::new(0),
            workers_started: AtomicUsize::new(0),
            token: token.clone(),
            lifecycle,
            fail_fast,
            lock: self.lock.clone(),
        });

        let engaged = self.command_txs.len().min(chunks_total);
        let (events_tx, events_rx) = mpsc::channel();

        for (worker, command_tx) in self.command_txs.iter().take(engaged).enumerate() {
            let batch = Arc::clone(&batch);
            let events_tx = events_tx.clone();

            command_tx
                .send(Command::Execute(Box::new(move || {
                    pull_chunks(worker, &batch, &events_tx);
                })))
                .map_err(|_| PoolError::WorkerLost {
                    worker,
                    reason: "worker thread is no longer running".to_string(),
                })?;
        }

        // Once every engaged worker has dropped its sender, the receiver sees a disconnect.
        drop(events_tx);

        let mut finished = vec![false; engaged];
        let mut halt = None;

        for event in events_rx {
            match event {
                ChunkEvent::Completed(results) => {
                    let Some(failure) = collector.accept(results) else {
                        continue;
                    };

                    if fail_fast {
                        batch.cancelled.store(true, Ordering::Release);
                        debug!(task = failure.index(), "halting batch after task failure");
                        halt = Some(Halt::FailFast(failure));
                        break;
                    }
                }
                ChunkEvent::Finished { worker } => {
                    if let Some(flag) = finished.get_mut(worker) {
                        *flag = true;
                    }
                }
            }
        }

        let stats = collector.stats_mut();
        stats.chunks_dispatched = batch.dispatched.load(Ordering::Acquire);
        stats.workers_started = batch.workers_started.load(Ordering::Acquire);

        if halt.is_none() && collector.missing_count() > 0 {
            if token.is_cancelled() {
                halt = Some(Halt::Cancelled);
            } else if let Some(worker) = finished.iter().position(|done| !done) {
                return Err(PoolError::WorkerLost {
                    worker,
                    reason: "worker thread stopped before finishing its chunks".to_string(),
                });
            }
        }

        Ok(collector.finish(halt))
    }
}

impl Drop for ThreadWorkers {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // We are probably in a dirty state and shutting down may hide the original panic.
            return;
        }

        for tx in self.command_txs.drain(..) {
            // A worker that already exited needs no shutdown command.
            _ = tx.send(Command::Shutdown);
        }

        for handle in self.join_handles.drain(..) {
            _ = handle.join();
        }
    }
}

enum Command {
    Execute(Box<dyn FnOnce() + Send>),
    Shutdown,
}

enum ChunkEvent<O> {
    Completed(Vec<TaskResult<O>>),
    Finished { worker: usize },
}

/// The state of one batch shared by all worker threads taking part in it.
struct ThreadBatch<T> {
    queue: SegQueue<Chunk<T>>,
    cancelled: AtomicBool,
    dispatched: AtomicUsize,
    workers_started: AtomicUsize,
    token: CancellationToken,
    lifecycle: WorkerLifecycle,
    fail_fast: bool,
    lock: Option<Arc<ExclusivityLock>>,
}

impl<T> ThreadBatch<T> {
    fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    fn claim(&self) -> Option<Chunk<T>> {
        if self.should_stop() {
            return None;
        }

        let chunk = self.queue.pop()?;
        self.dispatched.fetch_add(1, Ordering::AcqRel);

        Some(chunk)
    }
}

#[cfg_attr(test, mutants::skip)] // Impractical to test that the worker stops doing things.
fn worker_entrypoint(rx: &mpsc::Receiver<Command>) {
    while let Ok(Command::Execute(f)) = rx.recv() {
        f();
    }
}

fn pull_chunks<T: Task>(
    worker: usize,
    batch: &ThreadBatch<T>,
    events_tx: &mpsc::Sender<ChunkEvent<T::Output>>,
) {
    while let Some(chunk) = batch.claim() {
        trace!(worker, chunk = chunk.index(), "executing chunk");

        let results = execute_chunk(chunk, batch);

        // The caller stops listening after a fail-fast halt; the results are discarded then.
        if events_tx.send(ChunkEvent::Completed(results)).is_err() {
            break;
        }
    }

    _ = events_tx.send(ChunkEvent::Finished { worker });
}

fn execute_chunk<T: Task>(chunk: Chunk<T>, batch: &ThreadBatch<T>) -> Vec<TaskResult<T::Output>> {
    let first_task = chunk.task_indexes().start;
    let mut results = Vec::with_capacity(chunk.len());

    for (offset, task) in chunk.into_tasks().into_iter().enumerate() {
        // Cannot overflow: bounded by the number of tasks in the batch.
        let index = first_task.wrapping_add(offset);

        let result = match batch.lifecycle {
            WorkerLifecycle::PerTask => execute_on_new_thread(index, task, batch),
            WorkerLifecycle::Pooled => TaskResult::new(
                index,
                current_worker_id(),
                run_exclusive(batch.lock.as_ref(), || execute_guarded(&task)),
            ),
        };

        let failed = !result.is_ok();
        results.push(result);

        if failed && batch.fail_fast {
            batch.cancelled.store(true, Ordering::Release);
            break;
        }
    }

    results
}

/// Executes a single task on a thread created just for it.
fn execute_on_new_thread<T: Task>(
    index: usize,
    task: T,
    batch: &ThreadBatch<T>,
) -> TaskResult<T::Output> {
    let lock = batch.lock.clone();

    let spawned = thread::Builder::new()
        .name(format!("many_tasks-t{index}"))
        .spawn(move || {
            let outcome = run_exclusive(lock.as_ref(), || execute_guarded(&task));
            TaskResult::new(index, current_worker_id(), outcome)
        });

    let handle = match spawned {
        Ok(handle) => handle,
        Err(error) => return startup_failure(index, &error),
    };

    batch.workers_started.fetch_add(1, Ordering::AcqRel);

    // Task panics are captured inside the thread. This only sees panics around the task.
    handle.join().unwrap_or_else(|payload| {
        TaskResult::new(
            index,
            current_worker_id(),
            Err(TaskError::from_panic(payload.as_ref())),
        )
    })
}

fn startup_failure<O>(index: usize, error: &io::Error) -> TaskResult<O> {
    TaskResult::new(
        index,
        current_worker_id(),
        Err(TaskError::new(format!(
            "failed to start a thread for the task: {error}"
        ))),
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;

    use new_zealand::nz;

    use super::*;
    use crate::{chunk_tasks, from_fn};

    fn squares(count: u64) -> Vec<impl Task<Output = u64>> {
        (0..count).map(|i| from_fn(move || Ok(i * i))).collect()
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn executes_all_chunks_in_order() {
        let mut workers = ThreadWorkers::start(nz!(3), false).unwrap();

        let chunks = chunk_tasks(squares(50), 4).unwrap();
        let results = workers
            .run_batch(
                chunks,
                50,
                WorkerLifecycle::Pooled,
                false,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(results.stats().chunks_total(), 13);
        assert_eq!(results.stats().chunks_dispatched(), 13);
        assert_eq!(results.stats().workers_started(), 0);

        let values = results.into_values().unwrap();
        assert_eq!(values, (0..50).map(|i| i * i).collect::<Vec<_>>());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn workers_are_reused_across_batches() {
        let mut workers = ThreadWorkers::start(nz!(2), true).unwrap();

        let mut seen = HashSet::new();

        for _ in 0..3 {
            let tasks = (0..8)
                .map(|_| from_fn(|| Ok(current_worker_id())))
                .collect::<Vec<_>>();

            let results = workers
                .run_batch(
                    chunk_tasks(tasks, 1).unwrap(),
                    8,
                    WorkerLifecycle::Pooled,
                    false,
                    &CancellationToken::new(),
                )
                .unwrap();

            seen.extend(results.into_values().unwrap());
        }

        assert!(seen.len() <= 2);
        assert!(!seen.contains(&current_worker_id()));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn per_task_lifecycle_starts_a_thread_per_task() {
        let mut workers = ThreadWorkers::start(nz!(2), true).unwrap();

        let tasks = (0..6)
            .map(|_| from_fn(|| Ok(current_worker_id())))
            .collect::<Vec<_>>();

        let results = workers
            .run_batch(
                chunk_tasks(tasks, 2).unwrap(),
                6,
                WorkerLifecycle::PerTask,
                false,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(results.stats().workers_started(), 6);

        let distinct = results
            .into_values()
            .unwrap()
            .into_iter()
            .collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 6);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn pre_cancelled_batch_runs_nothing() {
        let mut workers = ThreadWorkers::start(nz!(2), false).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let results = workers
            .run_batch(
                chunk_tasks(squares(10), 1).unwrap(),
                10,
                WorkerLifecycle::Pooled,
                false,
                &token,
            )
            .unwrap();

        assert!(results.was_cancelled());
        assert!(results.is_empty());
        assert_eq!(results.stats().chunks_dispatched(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn fail_fast_stops_the_failing_chunk() {
        let mut workers = ThreadWorkers::start(nz!(1), false).unwrap();

        let tasks = (0..5_u32)
            .map(|i| {
                from_fn(move || {
                    if i == 1 {
                        Err(TaskError::new("second task fails"))
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect::<Vec<_>>();

        let results = workers
            .run_batch(
                chunk_tasks(tasks, 5).unwrap(),
                5,
                WorkerLifecycle::Pooled,
                true,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(results.halted_by().unwrap().index(), 1);
        assert_eq!(results.len(), 2);
    }
}
