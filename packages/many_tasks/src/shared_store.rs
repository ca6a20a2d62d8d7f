use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::PoolError;
use crate::shared_region::SharedRegion;

/// One slot of a shared store, alone on its cache line so neighboring slots never contend.
#[repr(C, align(64))]
struct Slot {
    value: AtomicI64,
}

/// A fixed-size array of integers shared by all workers, with independent slots.
///
/// Each slot is updated with an atomic read-modify-write, so concurrent accumulations into the
/// same slot are serialized and none are lost. Each slot also sits on its own cache line:
/// concurrent accumulations into different slots do not wait for each other and do not suffer
/// from false sharing.
///
/// Like [`SharedCounter`][crate::SharedCounter], the store lives in memory shared with worker
/// processes forked after it was created.
///
/// # Example
///
/// ```
/// use many_tasks::{ExecutionMode, SharedStore, TaskError, from_fn, submit};
///
/// let store = SharedStore::new(10, 0).unwrap();
///
/// let tasks = (0..100_i64)
///     .map(|i| {
///         let store = store.clone();
///         from_fn(move || {
///             store
///                 .accumulate((i % 10) as usize, i)
///                 .map_err(|e| TaskError::new(e.to_string()))
///         })
///     })
///     .collect();
///
/// submit(tasks, 5, 4, ExecutionMode::Thread).unwrap();
///
/// assert_eq!(store.total(), (0..100).sum::<i64>());
/// ```
#[derive(Clone, Debug)]
pub struct SharedStore {
    region: Arc<SharedRegion<Slot>>,
}

impl SharedStore {
    /// Creates a store of `size` slots, each holding `initial`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfiguration`] if `size` is zero and
    /// [`PoolError::SharedMemory`] if the shared memory cannot be mapped.
    pub fn new(size: usize, initial: i64) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::invalid_configuration(
                "a shared store needs at least one slot",
            ));
        }

        let region = SharedRegion::new(size, |_| Slot {
            value: AtomicI64::new(initial),
        })?;

        Ok(Self {
            region: Arc::new(region),
        })
    }

    fn slot(&self, index: usize) -> Result<&Slot, PoolError> {
        self.region
            .as_slice()
            .get(index)
            .ok_or(PoolError::SlotOutOfRange {
                index,
                len: self.len(),
            })
    }

    /// The number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.as_slice().len()
    }

    /// Whether the store has no slots. Always `false`, stores have at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region.as_slice().is_empty()
    }

    /// Atomically adds `delta` to the slot at `index`, returning the slot's new value.
    /// Wraps on overflow.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SlotOutOfRange`] if `index` is not less than [`len()`][Self::len].
    pub fn accumulate(&self, index: usize, delta: i64) -> Result<i64, PoolError> {
        let previous = self.slot(index)?.value.fetch_add(delta, Ordering::AcqRel);

        Ok(previous.wrapping_add(delta))
    }

    /// Returns the current value of the slot at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SlotOutOfRange`] if `index` is not less than [`len()`][Self::len].
    pub fn get(&self, index: usize) -> Result<i64, PoolError> {
        Ok(self.slot(index)?.value.load(Ordering::Acquire))
    }

    /// Returns the values of all slots, in index order.
    ///
    /// Each slot value includes every accumulation into that slot that completed before this
    /// call. The snapshot is not atomic across slots while accumulations are still running.
    #[must_use]
    pub fn snapshot(&self) -> Vec<i64> {
        self.region
            .as_slice()
            .iter()
            .map(|slot| slot.value.load(Ordering::Acquire))
            .collect()
    }

    /// Returns the sum of all slots. Wraps on overflow.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.snapshot().into_iter().fold(0, i64::wrapping_add)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::mem;
    use std::ptr;
    use std::sync::Barrier;
    use std::thread;

    use static_assertions::{assert_impl_all, const_assert_eq};

    use super::*;

    assert_impl_all!(SharedStore: Send, Sync, Clone);
    const_assert_eq!(mem::size_of::<Slot>(), 64);
    const_assert_eq!(mem::align_of::<Slot>(), 64);

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            SharedStore::new(0, 0),
            Err(PoolError::InvalidConfiguration { .. })
        ));
    }

    #[cfg_attr(miri, ignore)] // Miri does not support mmap.
    #[test]
    fn initial_values_and_accumulation() {
        let store = SharedStore::new(3, 5).unwrap();

        assert_eq!(store.len(), 3);
        assert!(!store.is_empty());
        assert_eq!(store.snapshot(), vec![5, 5, 5]);

        assert_eq!(store.accumulate(1, 10).unwrap(), 15);
        assert_eq!(store.accumulate(1, -3).unwrap(), 12);

        assert_eq!(store.get(1).unwrap(), 12);
        assert_eq!(store.snapshot(), vec![5, 12, 5]);
        assert_eq!(store.total(), 22);
    }

    #[cfg_attr(miri, ignore)] // Miri does not support mmap.
    #[test]
    fn out_of_range_is_error() {
        let store = SharedStore::new(2, 0).unwrap();

        assert!(matches!(
            store.accumulate(2, 1),
            Err(PoolError::SlotOutOfRange { index: 2, len: 2 })
        ));
        assert!(matches!(
            store.get(7),
            Err(PoolError::SlotOutOfRange { index: 7, len: 2 })
        ));
    }

    #[cfg_attr(miri, ignore)] // Miri does not support mmap.
    #[test]
    fn slots_are_on_distinct_cache_lines() {
        let store = SharedStore::new(4, 0).unwrap();

        let addresses = store
            .region
            .as_slice()
            .iter()
            .map(|slot| ptr::from_ref(slot).addr())
            .collect::<Vec<_>>();

        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], 64);
        }
        assert!(addresses.iter().all(|address| address % 64 == 0));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_accumulation_is_exact() {
        const THREADS: usize = 8;
        const ROUNDS: i64 = 5_000;

        let store = SharedStore::new(4, 0).unwrap();
        let barrier = Arc::new(Barrier::new(THREADS));

        let threads = (0..THREADS)
            .map(|thread_index| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();

                    for _ in 0..ROUNDS {
                        // Two threads per slot: distinct slots run side by side, shared slots
                        // must serialize.
                        store.accumulate(thread_index % 4, 1).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(store.snapshot(), vec![2 * ROUNDS; 4]);
    }
}
