use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

/// A counter that is deliberately **not** safe to update concurrently.
///
/// This type exists to demonstrate what [`SharedCounter`][crate::SharedCounter] prevents. It has
/// two failure modes, one per execution mode:
///
/// * **Lost updates between threads.** An increment reads the value, yields the time slice and
///   then writes back the value plus one. When two workers interleave, both read the same old
///   value and one of the two increments is lost. Under thread-shared mode this only happens
///   when the increments run concurrently, that is inside a
///   [`parallel_section()`][crate::parallel_section] or in a pool without the global lock.
/// * **Invisible updates between processes.** The value lives in ordinary process memory. A
///   worker process increments its own copy, which the caller and other workers never see.
///
/// Never use this type for real work; it has no other purpose than serving as the negative
/// example in tests and demos.
///
/// # Example
///
/// ```
/// use many_tasks::RacyCounter;
///
/// let counter = RacyCounter::default();
/// counter.increment();
///
/// // Single-threaded use is fine; concurrent use is where updates get lost.
/// assert_eq!(counter.get(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RacyCounter {
    value: Arc<AtomicI64>,
}

impl RacyCounter {
    /// Increments the counter with a non-atomic read-modify-write.
    pub fn increment(&self) {
        let observed = self.value.load(Ordering::Relaxed);

        // Widens the window between the read and the write so the race is easy to observe.
        thread::yield_now();

        self.value.store(observed.wrapping_add(1), Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}
