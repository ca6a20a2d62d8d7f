use std::cell::UnsafeCell;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::PoolError;
use crate::shared_region::SharedRegion;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// How many times a waiter spins on the lock word before it starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// The counter as laid out in shared memory: a lock word next to the value it protects.
#[repr(C)]
struct CounterCell {
    lock: AtomicU32,
    value: UnsafeCell<i64>,
}

// SAFETY: `value` is only accessed while `lock` is held, which grants exclusive access.
unsafe impl Sync for CounterCell {}

/// A single integer shared by all workers, updated under mutual exclusion.
///
/// The counter lives in memory that is genuinely shared with worker processes forked after the
/// counter was created, and every read-modify-write happens while holding a lock word stored
/// next to the value. No increment can be lost, whether the counter is updated from threads or
/// from isolated worker processes.
///
/// Create the counter before submitting the batch that uses it and move clones into the tasks.
/// A counter created inside a worker process is private to that process.
///
/// The lock is the only shared primitive held during an update and it is never held while
/// acquiring another one. Callers combining several shared resources must acquire them in a
/// consistent order to avoid the circular wait that causes deadlock.
///
/// A worker process that is killed (see [`InFlight::Terminate`][crate::InFlight::Terminate])
/// while inside [`with_exclusive()`][Self::with_exclusive] leaves the lock held. Use the
/// `try_*_for()` methods if that can happen.
///
/// # Example
///
/// ```
/// use many_tasks::{ExecutionMode, SharedCounter, from_fn, submit};
///
/// let counter = SharedCounter::new(0).unwrap();
///
/// let tasks = (0..100)
///     .map(|_| {
///         let counter = counter.clone();
///         from_fn(move || Ok(counter.increment()))
///     })
///     .collect();
///
/// submit(tasks, 10, 4, ExecutionMode::Thread).unwrap();
///
/// assert_eq!(counter.get(), 100);
/// ```
#[derive(Clone, Debug)]
pub struct SharedCounter {
    region: Arc<SharedRegion<CounterCell>>,
}

impl SharedCounter {
    /// Creates a counter with the given initial value.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SharedMemory`] if the shared memory cannot be mapped.
    pub fn new(initial: i64) -> Result<Self, PoolError> {
        let region = SharedRegion::new(1, |_| CounterCell {
            lock: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(initial),
        })?;

        Ok(Self {
            region: Arc::new(region),
        })
    }

    fn cell(&self) -> &CounterCell {
        self.region
            .as_slice()
            .first()
            .expect("type invariant - the region always holds exactly one cell")
    }

    /// Atomically adds 1, returning the new value.
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Atomically adds `delta`, returning the new value. Wraps on overflow.
    pub fn add(&self, delta: i64) -> i64 {
        self.with_exclusive(|value| {
            *value = value.wrapping_add(delta);
            *value
        })
    }

    /// Returns the current value.
    ///
    /// The value reflects every update that completed before this call.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.with_exclusive(|value| *value)
    }

    /// Runs `f` with exclusive access to the value, for updates that are more than an addition.
    ///
    /// `f` must not access this counter again, since that would deadlock.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut i64) -> R) -> R {
        match self.lock_until(None) {
            Ok(guard) => guard.apply(f),
            Err(()) => unreachable!("waiting without a deadline never times out"),
        }
    }

    /// Atomically adds 1, waiting at most `timeout` for exclusive access.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SharedResourceTimeout`] if the lock was not acquired in time.
    pub fn try_increment_for(&self, timeout: Duration) -> Result<i64, PoolError> {
        self.try_with_exclusive_for(timeout, |value| {
            *value = value.wrapping_add(1);
            *value
        })
    }

    /// Like [`with_exclusive()`][Self::with_exclusive] but waits at most `timeout` for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SharedResourceTimeout`] if the lock was not acquired in time.
    pub fn try_with_exclusive_for<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut i64) -> R,
    ) -> Result<R, PoolError> {
        let started = Instant::now();

        let guard = self
            // A deadline too far in the future to represent means waiting without one.
            .lock_until(started.checked_add(timeout))
            .map_err(|()| PoolError::SharedResourceTimeout {
                resource: "shared counter",
                waited: started.elapsed(),
            })?;

        Ok(guard.apply(f))
    }

    fn lock_until(&self, deadline: Option<Instant>) -> Result<CounterGuard<'_>, ()> {
        let cell = self.cell();
        let mut spins = 0_u32;

        loop {
            if cell
                .lock
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(CounterGuard { cell });
            }

            if spins < SPINS_BEFORE_YIELD {
                spins = spins.wrapping_add(1);
                hint::spin_loop();
                continue;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(());
            }

            // The holder may be another process, so there is nothing to park on.
            thread::yield_now();
        }
    }
}

struct CounterGuard<'a> {
    cell: &'a CounterCell,
}

impl CounterGuard<'_> {
    fn apply<R>(self, f: impl FnOnce(&mut i64) -> R) -> R {
        // SAFETY: Holding the lock grants exclusive access to the value until the guard drops.
        let value = unsafe { &mut *self.cell.value.get() };
        f(value)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.cell.lock.store(UNLOCKED, Ordering::Release);
    }
}
