//! The pool-wide exclusivity lock of thread-shared mode and the [`parallel_section()`] marker
//! that lets a workload step outside of it.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

thread_local! {
    /// The lock held by the current worker thread while it executes task code, if any.
    ///
    /// Taken out while inside a parallel section, so nested sections do not release twice.
    static HELD_LOCK: RefCell<Option<Arc<ExclusivityLock>>> = const { RefCell::new(None) };
}

/// A lock that at most one worker thread of a pool holds while running task code.
///
/// Unlike a `Mutex<()>`, acquisition and release are separate calls without a guard, because the
/// lock is released and re-acquired from inside task code via [`parallel_section()`].
#[derive(Default)]
pub(crate) struct ExclusivityLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl fmt::Debug for ExclusivityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusivityLock")
            .field("held", &*self.held.lock())
            .finish_non_exhaustive()
    }
}

impl ExclusivityLock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self) {
        let mut held = self.held.lock();

        while *held {
            self.released.wait(&mut held);
        }

        *held = true;
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }
}

/// Runs task code while holding the exclusivity lock, if one is given.
pub(crate) fn run_exclusive<R>(lock: Option<&Arc<ExclusivityLock>>, f: impl FnOnce() -> R) -> R {
    let Some(lock) = lock else {
        return f();
    };

    lock.acquire();
    HELD_LOCK.with(|held| *held.borrow_mut() = Some(Arc::clone(lock)));

    let _release = scopeguard::guard(Arc::clone(lock), |lock| {
        HELD_LOCK.with(|held| held.borrow_mut().take());
        lock.release();
    });

    f()
}

/// Marks a region of task code that runs with genuine concurrency.
///
/// In thread-shared mode with the global lock enabled (the default), worker threads execute task
/// code one at a time: a CPU-bound batch gains nothing over sequential execution. Inside a
/// parallel section the current worker releases the lock, so other workers can run their task
/// code at the same time. The lock is re-acquired before `parallel_section()` returns, also when
/// `f` panics.
///
/// Code inside the section must only touch data that is safe to access concurrently, which the
/// borrow checker already enforces for data shared between threads.
///
/// Outside of a thread-mode worker (on the caller's thread, in a worker process, or in a pool
/// without the global lock) this simply calls `f`.
///
/// # Example
///
/// ```
/// use many_tasks::{ExecutionMode, WorkerPool, from_fn, parallel_section};
///
/// let mut pool = WorkerPool::builder()
///     .workers(2)
///     .mode(ExecutionMode::Thread)
///     .build()
///     .unwrap();
///
/// let tasks = (0..4_u64)
///     .map(|i| from_fn(move || Ok(parallel_section(|| (0..1000).map(|x| x * i).sum::<u64>()))))
///     .collect();
///
/// let results = pool.execute(tasks, 1).unwrap();
/// assert_eq!(results.into_values().unwrap()[1], 499_500);
/// ```
pub fn parallel_section<R>(f: impl FnOnce() -> R) -> R {
    let Some(lock) = HELD_LOCK.with(|held| held.borrow_mut().take()) else {
        return f();
    };

    lock.release();

    let _reacquire = scopeguard::guard(lock, |lock| {
        lock.acquire();
        HELD_LOCK.with(|held| *held.borrow_mut() = Some(lock));
    });

    f()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn holds_lock() -> bool {
        HELD_LOCK.with(|held| held.borrow().is_some())
    }

    #[test]
    fn without_lock_runs_directly() {
        assert_eq!(run_exclusive(None, || 5), 5);
        assert_eq!(parallel_section(|| 6), 6);
        assert!(!holds_lock());
    }

    #[test]
    fn lock_is_released_after_run() {
        let lock = ExclusivityLock::new();

        run_exclusive(Some(&lock), || assert!(holds_lock()));

        assert!(!holds_lock());
        assert!(!*lock.held.lock());
    }

    #[test]
    fn parallel_section_releases_and_restores() {
        let lock = ExclusivityLock::new();

        run_exclusive(Some(&lock), || {
            parallel_section(|| {
                assert!(!holds_lock());
                assert!(!*lock.held.lock());

                // Nested sections are harmless.
                parallel_section(|| assert!(!holds_lock()));
            });

            assert!(holds_lock());
            assert!(*lock.held.lock());
        });
    }

    #[test]
    fn panic_in_section_restores_lock() {
        let lock = ExclusivityLock::new();

        run_exclusive(Some(&lock), || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                parallel_section::<()>(|| panic!("inside section"));
            }));

            assert!(result.is_err());
            assert!(holds_lock());
        });

        assert!(!*lock.held.lock());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn lock_serializes_threads() {
        let lock = ExclusivityLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let threads = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);

                thread::spawn(move || {
                    for _ in 0..5 {
                        run_exclusive(Some(&lock), || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(1));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
