use std::any::Any;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WorkerId;

/// Errors that stop the pool from accepting, running or reporting a batch as a whole.
///
/// Failures of individual tasks are not reported through this type. They are collected per task
/// as [`TaskFailure`] values inside [`BatchResults`][crate::BatchResults].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The caller asked for something the pool cannot do, such as zero workers or a chunk size
    /// of zero.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        reason: String,
    },

    /// A bounded wait for exclusive access to a shared resource exceeded its limit.
    #[error("timed out after {waited:?} waiting for exclusive access to {resource}")]
    SharedResourceTimeout {
        /// The kind of resource that could not be acquired.
        resource: &'static str,

        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// A worker thread or worker process could not be created.
    #[error("failed to start worker {worker}")]
    WorkerStartupFailure {
        /// Index of the worker slot that failed to start.
        worker: usize,

        /// The operating system error.
        #[source]
        source: io::Error,
    },

    /// Memory shared between worker processes could not be mapped.
    #[error("failed to map shared memory")]
    SharedMemory {
        /// The operating system error.
        #[source]
        source: io::Error,
    },

    /// A shared store was addressed outside of its bounds.
    #[error("slot {index} is out of range for a shared store with {len} slots")]
    SlotOutOfRange {
        /// The requested slot.
        index: usize,

        /// The number of slots in the store.
        len: usize,
    },

    /// A worker disappeared without accounting for all the work it had claimed.
    #[error("worker {worker} was lost: {reason}")]
    WorkerLost {
        /// Index of the worker slot that was lost.
        worker: usize,

        /// A human-readable description of what went wrong.
        reason: String,
    },
}

impl PoolError {
    pub(crate) fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// The error a task reports when it cannot produce its output.
///
/// Task errors cross process boundaries when tasks run in worker processes, so they carry only a
/// message and whether they originated from a panic.
///
/// # Example
///
/// ```
/// use many_tasks::TaskError;
///
/// let error = TaskError::new("input out of range");
/// assert_eq!(error.message(), "input out of range");
/// assert!(!error.is_panic());
/// ```
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
#[error("{message}")]
pub struct TaskError {
    message: String,
    panicked: bool,
}

impl TaskError {
    /// Creates a task error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };

        Self {
            message,
            panicked: true,
        }
    }

    /// The human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the task panicked instead of returning an error.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A task that failed, tagged with its position in the submitted batch.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("task {index} failed on worker {worker}: {error}")]
pub struct TaskFailure {
    index: usize,
    worker: WorkerId,
    #[source]
    error: TaskError,
}

impl TaskFailure {
    pub(crate) fn new(index: usize, worker: WorkerId, error: TaskError) -> Self {
        Self {
            index,
            worker,
            error,
        }
    }

    /// The sequence index of the failed task in the submitted batch.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The worker that executed the failed task.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The error reported by the task.
    #[must_use]
    pub fn error(&self) -> &TaskError {
        &self.error
    }
}

/// Returned when the outputs of a batch are requested but the batch did not fully succeed.
///
/// Lists every task failure that was observed and whether some tasks never ran because the
/// batch was halted early (fail-fast or cancellation).
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{}", describe_batch_failure(failures, *partial))]
pub struct BatchFailure {
    failures: Vec<TaskFailure>,
    partial: bool,
}

impl BatchFailure {
    pub(crate) fn new(failures: Vec<TaskFailure>, partial: bool) -> Self {
        Self { failures, partial }
    }

    /// The failed tasks, in submission order.
    #[must_use]
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Whether some tasks in the batch produced no result at all.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

fn describe_batch_failure(failures: &[TaskFailure], partial: bool) -> String {
    let mut text = format!("{} task(s) failed", failures.len());

    if let Some(first) = failures.first() {
        text.push_str(&format!(", first: {first}"));
    }

    if partial {
        text.push_str(" (batch halted before all tasks ran)");
    }

    text
}
