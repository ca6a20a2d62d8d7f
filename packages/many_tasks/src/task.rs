use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::TaskError;

/// One opaque, independently executable unit of work.
///
/// The pool never inspects a task beyond calling [`execute()`][Self::execute]. Tasks in a batch
/// are assumed to be independent of each other, so they may run in any order and on any worker.
///
/// A task is executed by shared reference. In process-isolated mode the worker process operates
/// on its own copy of the task (inherited through `fork`), so any state the task mutates through
/// interior mutability stays inside that worker unless it is explicitly shared through
/// [`SharedCounter`][crate::SharedCounter] or [`SharedStore`][crate::SharedStore].
///
/// Panics inside `execute()` are captured and reported as a [`TaskError`] for which
/// [`TaskError::is_panic()`] returns `true`.
///
/// # Example
///
/// ```
/// use many_tasks::{Task, TaskError};
///
/// struct Square(u64);
///
/// impl Task for Square {
///     type Output = u64;
///
///     fn execute(&self) -> Result<u64, TaskError> {
///         self.0.checked_mul(self.0).ok_or_else(|| TaskError::new("overflow"))
///     }
/// }
///
/// assert_eq!(Square(12).execute(), Ok(144));
/// ```
pub trait Task: Send + 'static {
    /// The value produced by a successful execution.
    type Output: Send + 'static;

    /// Performs the work.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] if the task cannot produce its output.
    fn execute(&self) -> Result<Self::Output, TaskError>;
}

/// A [`Task`] backed by a closure. Created by [`from_fn()`].
pub struct FnTask<F> {
    f: F,
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

impl<F, R> Task for FnTask<F>
where
    F: Fn() -> Result<R, TaskError> + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn execute(&self) -> Result<R, TaskError> {
        (self.f)()
    }
}

/// Creates a [`Task`] from a closure.
///
/// # Example
///
/// ```
/// use many_tasks::{Task, from_fn};
///
/// let task = from_fn(|| Ok(6 * 7));
/// assert_eq!(task.execute(), Ok(42));
/// ```
pub fn from_fn<F, R>(f: F) -> FnTask<F>
where
    F: Fn() -> Result<R, TaskError> + Send + 'static,
    R: Send + 'static,
{
    FnTask { f }
}

/// Executes a task, converting a panic into a [`TaskError`].
pub(crate) fn execute_guarded<T: Task>(task: &T) -> Result<T::Output, TaskError> {
    panic::catch_unwind(AssertUnwindSafe(|| task.execute()))
        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload.as_ref())))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn closure_output_passes_through() {
        let task = from_fn(|| Ok("done"));

        assert_eq!(execute_guarded(&task), Ok("done"));
    }

    #[test]
    fn closure_error_passes_through() {
        let task = from_fn(|| -> Result<u8, TaskError> { Err("no luck".into()) });

        let error = execute_guarded(&task).unwrap_err();
        assert_eq!(error.message(), "no luck");
        assert!(!error.is_panic());
    }

    #[test]
    fn panic_becomes_error() {
        let task = from_fn(|| -> Result<u8, TaskError> { panic!("exploded") });

        let error = execute_guarded(&task).unwrap_err();
        assert_eq!(error.message(), "exploded");
        assert!(error.is_panic());
    }

    #[test]
    fn task_can_run_repeatedly() {
        let task = from_fn(|| Ok(1_u8));

        assert_eq!(execute_guarded(&task), Ok(1));
        assert_eq!(execute_guarded(&task), Ok(1));
    }
}
