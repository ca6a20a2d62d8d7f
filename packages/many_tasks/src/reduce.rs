use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// Combines many values into one using a caller-supplied rule.
///
/// The combine rule must be associative and commutative. Results reach the reducer in submission
/// order, but per-worker groupings depend on which worker happened to claim which chunk, so a rule
/// that is sensitive to grouping or order produces results that vary from run to run. The reducer
/// does not detect or correct this.
///
/// # Example
///
/// ```
/// use many_tasks::Reducer;
///
/// let sum = Reducer::sum();
/// assert_eq!(sum.reduce(vec![1, 2, 3, 4]), Some(10));
///
/// let max = Reducer::new(|a: u32, b: u32| a.max(b));
/// assert_eq!(max.reduce(vec![3, 9, 2]), Some(9));
/// assert_eq!(max.reduce(Vec::new()), None);
/// ```
pub struct Reducer<T> {
    combine: Box<dyn Fn(T, T) -> T + Send + Sync>,
}

impl<T> fmt::Debug for Reducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer").finish_non_exhaustive()
    }
}

impl<T> Reducer<T> {
    /// Creates a reducer from an associative and commutative combine rule.
    #[must_use]
    pub fn new(combine: impl Fn(T, T) -> T + Send + Sync + 'static) -> Self {
        Self {
            combine: Box::new(combine),
        }
    }

    /// Combines all values into one, or returns `None` if there are none.
    pub fn reduce(&self, values: impl IntoIterator<Item = T>) -> Option<T> {
        values.into_iter().reduce(|a, b| (self.combine)(a, b))
    }

    /// Combines values separately for each worker that produced them.
    ///
    /// Accepts the output of [`BatchResults::into_tagged()`][crate::BatchResults::into_tagged].
    pub fn reduce_by_worker(
        &self,
        tagged: impl IntoIterator<Item = (WorkerId, T)>,
    ) -> BTreeMap<WorkerId, T> {
        let mut groups = BTreeMap::<WorkerId, T>::new();

        for (worker, value) in tagged {
            let merged = match groups.remove(&worker) {
                Some(existing) => (self.combine)(existing, value),
                None => value,
            };

            groups.insert(worker, merged);
        }

        groups
    }
}

impl<T> Reducer<T>
where
    T: Add<Output = T> + 'static,
{
    /// A reducer that adds values together.
    #[must_use]
    pub fn sum() -> Self {
        Self::new(|a: T, b: T| a + b)
    }
}

/// A count of samples together with the sum of their values.
///
/// This is the accumulator of the copy-then-reduce idiom: every worker fills in a private tally
/// without any synchronization and the tallies are merged once the batch has completed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Tally<V> {
    /// How many samples were taken.
    pub count: u64,

    /// The accumulated value of the samples.
    pub sum: V,
}

impl<V> Tally<V> {
    /// Creates a tally.
    #[must_use]
    pub fn new(count: u64, sum: V) -> Self {
        Self { count, sum }
    }
}

impl<V: Add<Output = V>> Tally<V> {
    /// Merges two tallies. Wraps the count on overflow.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            count: self.count.wrapping_add(other.count),
            sum: self.sum + other.sum,
        }
    }
}

/// A [`Tally`] produced by one task, tagged with the worker that produced it.
///
/// # Example
///
/// ```
/// use many_tasks::{PartialTally, Tally, current_worker_id, tally};
///
/// let partials = vec![
///     PartialTally::new(current_worker_id(), Tally::new(10, 7_u64)),
///     PartialTally::new(current_worker_id(), Tally::new(10, 9_u64)),
/// ];
///
/// assert_eq!(tally(partials), Tally::new(20, 16));
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PartialTally<V> {
    /// The worker that produced the tally.
    pub worker: WorkerId,

    /// The partial result.
    pub tally: Tally<V>,
}

impl<V> PartialTally<V> {
    /// Creates a partial tally.
    #[must_use]
    pub fn new(worker: WorkerId, tally: Tally<V>) -> Self {
        Self { worker, tally }
    }
}

/// Merges partial tallies into a grand total.
///
/// Runs entirely in the caller, after the batch has completed, outside of any shared-memory
/// critical section.
pub fn tally<V>(partials: impl IntoIterator<Item = PartialTally<V>>) -> Tally<V>
where
    V: Add<Output = V> + Default,
{
    partials
        .into_iter()
        .map(|partial| partial.tally)
        .fold(Tally::default(), Tally::merge)
}

/// Merges partial tallies separately for each worker.
pub fn tally_by_worker<V>(
    partials: impl IntoIterator<Item = PartialTally<V>>,
) -> BTreeMap<WorkerId, Tally<V>>
where
    V: Add<Output = V> + Default,
{
    let mut groups = BTreeMap::<WorkerId, Tally<V>>::new();

    for partial in partials {
        let merged = groups
            .remove(&partial.worker)
            .unwrap_or_default()
            .merge(partial.tally);

        groups.insert(partial.worker, merged);
    }

    groups
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::current_worker_id;

    assert_impl_all!(Reducer<u64>: Send, Sync);

    #[test]
    fn sum_of_empty_is_none() {
        assert_eq!(Reducer::<i64>::sum().reduce(Vec::new()), None);
    }

    #[test]
    fn sum_of_values() {
        assert_eq!(Reducer::sum().reduce(1..=100_u64), Some(5050));
    }

    #[test]
    fn custom_rule() {
        let product = Reducer::new(|a: u64, b: u64| a * b);

        assert_eq!(product.reduce([2, 3, 7]), Some(42));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn grouped_by_worker() {
        let here = current_worker_id();
        let there = thread::spawn(current_worker_id).join().unwrap();

        let groups =
            Reducer::sum().reduce_by_worker([(here, 1), (there, 10), (here, 2), (there, 20)]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&here], 3);
        assert_eq!(groups[&there], 30);
    }

    #[test]
    fn tally_merges_counts_and_sums() {
        let worker = current_worker_id();

        let total = tally([
            PartialTally::new(worker, Tally::new(100, 78.0)),
            PartialTally::new(worker, Tally::new(100, 80.0)),
        ]);

        assert_eq!(total.count, 200);
        assert!((total.sum - 158.0_f64).abs() < f64::EPSILON);
    }

    #[test]
    fn tally_of_nothing_is_zero() {
        assert_eq!(tally(Vec::<PartialTally<u64>>::new()), Tally::new(0, 0));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn tally_grouped_by_worker() {
        let here = current_worker_id();
        let there = thread::spawn(current_worker_id).join().unwrap();

        let groups = tally_by_worker([
            PartialTally::new(here, Tally::new(1, 5_u64)),
            PartialTally::new(there, Tally::new(2, 6_u64)),
            PartialTally::new(here, Tally::new(3, 7_u64)),
        ]);

        assert_eq!(groups[&here], Tally::new(4, 12));
        assert_eq!(groups[&there], Tally::new(2, 6));
    }

    #[test]
    fn partial_tally_survives_json() {
        let partial = PartialTally::new(current_worker_id(), Tally::new(3, 2_u64));
        let json = serde_json::to_string(&partial).unwrap();

        assert_eq!(
            serde_json::from_str::<PartialTally<u64>>(&json).unwrap(),
            partial
        );
    }
}
