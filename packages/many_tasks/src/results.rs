use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{BatchFailure, TaskError, TaskFailure, WorkerId};

/// The outcome of one task, tagged with its sequence index and the worker that ran it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TaskResult<O> {
    index: usize,
    worker: WorkerId,
    outcome: Result<O, TaskError>,
}

impl<O> TaskResult<O> {
    pub(crate) fn new(index: usize, worker: WorkerId, outcome: Result<O, TaskError>) -> Self {
        Self {
            index,
            worker,
            outcome,
        }
    }

    /// The sequence index of the task in the submitted batch.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The worker that executed the task.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The output of the task or the error it reported.
    #[must_use]
    pub fn outcome(&self) -> &Result<O, TaskError> {
        &self.outcome
    }

    /// Whether the task succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The failure of this task, if it failed.
    #[must_use]
    pub fn failure(&self) -> Option<TaskFailure> {
        self.outcome
            .as_ref()
            .err()
            .map(|error| TaskFailure::new(self.index, self.worker, error.clone()))
    }

    /// Consumes the result, returning the outcome.
    #[must_use]
    pub fn into_outcome(self) -> Result<O, TaskError> {
        self.outcome
    }
}

/// Counters describing how a batch was dispatched.
///
/// These make the dispatch-overhead trade-off observable: for a fixed number of tasks, each
/// dispatch event carries a fixed cost, so larger chunks mean fewer dispatches and less overhead,
/// up to the point where workers sit idle because the remaining work is stuck in a few big
/// chunks.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DispatchStats {
    pub(crate) chunks_total: usize,
    pub(crate) chunks_dispatched: usize,
    pub(crate) workers_started: usize,
}

impl DispatchStats {
    /// The number of chunks the batch was split into.
    #[must_use]
    pub fn chunks_total(&self) -> usize {
        self.chunks_total
    }

    /// The number of chunks that were handed to a worker (dispatch events).
    ///
    /// Less than [`chunks_total()`][Self::chunks_total] if the batch was halted early.
    #[must_use]
    pub fn chunks_dispatched(&self) -> usize {
        self.chunks_dispatched
    }

    /// The number of execution contexts (threads or processes) created for this batch.
    ///
    /// Zero for a pooled thread-mode batch, because its workers already existed.
    #[must_use]
    pub fn workers_started(&self) -> usize {
        self.workers_started
    }
}

/// Why a batch stopped before all of its tasks ran.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Halt {
    FailFast(TaskFailure),
    Cancelled,
}

/// The results of one submitted batch, in task submission order.
///
/// Unless the batch was halted early (fail-fast or cancellation), there is exactly one
/// [`TaskResult`] per submitted task. A halted batch holds the results of the tasks that
/// finished before the halt, still in submission order.
#[derive(Debug)]
pub struct BatchResults<O> {
    results: Vec<TaskResult<O>>,
    task_count: usize,
    stats: DispatchStats,
    halt: Option<Halt>,
}

impl<O> BatchResults<O> {
    /// The number of tasks that produced a result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no task produced a result.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The number of tasks that were submitted.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Whether every submitted task produced a result (successful or not).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.task_count
    }

    /// The failure that halted a fail-fast batch.
    #[must_use]
    pub fn halted_by(&self) -> Option<&TaskFailure> {
        match &self.halt {
            Some(Halt::FailFast(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Whether the batch was stopped through a [`CancellationToken`][crate::CancellationToken].
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        matches!(self.halt, Some(Halt::Cancelled))
    }

    /// How the batch was dispatched.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Iterates over the results in submission order.
    pub fn iter(&self) -> std::slice::Iter<'_, TaskResult<O>> {
        self.results.iter()
    }

    /// Iterates over the failed tasks in submission order.
    pub fn failures(&self) -> impl Iterator<Item = TaskFailure> {
        self.results.iter().filter_map(TaskResult::failure)
    }

    /// Whether any task failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|result| !result.is_ok())
    }

    /// Returns the outputs of all tasks in submission order.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchFailure`] listing every failed task if any task failed or if the batch
    /// was halted before all tasks ran.
    pub fn into_values(self) -> Result<Vec<O>, BatchFailure> {
        Ok(self
            .into_tagged()?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Returns the outputs of all tasks in submission order, tagged with the producing worker.
    ///
    /// This is the input shape expected by [`Reducer::reduce_by_worker()`][crate::Reducer].
    ///
    /// # Errors
    ///
    /// Returns a [`BatchFailure`] listing every failed task if any task failed or if the batch
    /// was halted before all tasks ran.
    pub fn into_tagged(self) -> Result<Vec<(WorkerId, O)>, BatchFailure> {
        let partial = !self.is_complete();

        if partial || self.has_failures() {
            let mut failures = self.failures().collect::<Vec<_>>();

            if let Some(Halt::FailFast(trigger)) = self.halt {
                if !failures.contains(&trigger) {
                    failures.push(trigger);
                    failures.sort_by_key(TaskFailure::index);
                }
            }

            return Err(BatchFailure::new(failures, partial));
        }

        Ok(self
            .results
            .into_iter()
            .filter_map(|result| {
                let worker = result.worker;
                result.outcome.ok().map(|value| (worker, value))
            })
            .collect())
    }

    /// Consumes the batch, returning the individual results in submission order.
    #[must_use]
    pub fn into_results(self) -> Vec<TaskResult<O>> {
        self.results
    }
}

impl<'a, O> IntoIterator for &'a BatchResults<O> {
    type Item = &'a TaskResult<O>;
    type IntoIter = std::slice::Iter<'a, TaskResult<O>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Reassembles results that arrive in completion order into submission order.
#[derive(Debug)]
pub(crate) struct Collector<O> {
    slots: Vec<Option<TaskResult<O>>>,
    stats: DispatchStats,
}

impl<O> Collector<O> {
    pub(crate) fn new(task_count: usize, chunks_total: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(task_count).collect(),
            stats: DispatchStats {
                chunks_total,
                ..DispatchStats::default()
            },
        }
    }

    /// Files the results of one chunk, returning the first failure among them.
    pub(crate) fn accept(&mut self, results: Vec<TaskResult<O>>) -> Option<TaskFailure> {
        let mut first_failure = None;

        for result in results {
            if first_failure.is_none() {
                first_failure = result.failure();
            }

            if let Some(slot) = self.slots.get_mut(result.index) {
                *slot = Some(result);
            }
        }

        first_failure
    }

    /// Marks every task in `indexes` that has no result yet as failed with `error`.
    pub(crate) fn fail_missing(
        &mut self,
        indexes: Range<usize>,
        worker: WorkerId,
        error: &TaskError,
    ) {
        for index in indexes {
            if let Some(slot @ None) = self.slots.get_mut(index) {
                *slot = Some(TaskResult::new(index, worker, Err(error.clone())));
            }
        }
    }

    pub(crate) fn missing_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub(crate) fn stats_mut(&mut self) -> &mut DispatchStats {
        &mut self.stats
    }

    pub(crate) fn finish(self, halt: Option<Halt>) -> BatchResults<O> {
        let task_count = self.slots.len();

        BatchResults {
            results: self.slots.into_iter().flatten().collect(),
            task_count,
            stats: self.stats,
            halt,
        }
    }
}
