#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples of the `many_tasks` workspace.

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// This function wraps a test closure with a timeout mechanism. If the test
/// takes longer than the timeout to complete, the test panics instead of
/// hanging the CI/build system.
///
/// The timeout is 30 seconds under normal conditions, which leaves room for
/// tests that fork worker processes on a busy machine, and 120 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     // Your test code here
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Check if we are running under mutation testing.
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        // Under mutation testing, disable the watchdog to allow hanging mutations.
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    // Run the test in a separate thread
    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // Send the result back - if this fails, the receiver has timed out
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(30)
    };

    // Wait for either the test to complete or timeout.
    match rx.recv_timeout(timeout) {
        Ok(result) => {
            // Test completed successfully, join the thread to clean up
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // Test timed out - this indicates the test is hanging
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            // Thread panicked, join it to get the panic
            match test_handle.join() {
                Ok(()) => panic!("Test thread disconnected unexpectedly"),
                Err(e) => std::panic::resume_unwind(e),
            }
        }
    }
}

/// Keeps the current thread busy on the CPU for at least `duration`.
///
/// Unlike `thread::sleep()`, this does not give up the processor, which makes it a stand-in for
/// CPU-bound work in tests that measure how much work overlaps.
pub fn spin_for(duration: Duration) {
    let started = Instant::now();
    let mut counter = 0_u64;

    while started.elapsed() < duration {
        for _ in 0..1_000 {
            counter = black_box(counter.wrapping_add(1));
        }
    }

    black_box(counter);
}

/// Tracks how many threads are inside a section of code at the same time.
///
/// # Example
///
/// ```rust
/// use testing::ConcurrencyGauge;
///
/// let gauge = ConcurrencyGauge::default();
/// gauge.measure(|| {});
///
/// assert_eq!(gauge.max(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    inside: AtomicUsize,
    max_inside: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Runs `f`, counting it as inside the measured section while it runs.
    pub fn measure<R>(&self, f: impl FnOnce() -> R) -> R {
        let now = self.inside.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.max_inside.fetch_max(now, Ordering::SeqCst);

        let result = f();

        self.inside.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// The highest number of concurrent callers of [`measure()`][Self::measure] observed so far.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max_inside.load(Ordering::SeqCst)
    }
}

/// A minimal linear congruential generator, deterministic for a given seed.
///
/// Good enough to produce sample points for Monte Carlo workloads in tests and examples. It is
/// not suitable for anything that needs statistical quality.
#[derive(Clone, Debug)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    /// Creates a generator from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x5_DEEC_E66D,
        }
    }

    /// Returns the next value, uniformly distributed in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);

        // The top 53 bits fill the mantissa of an f64 exactly.
        let mantissa = (self.state >> 11) as f64;

        mantissa / (1_u64 << 53) as f64
    }
}

/// Counts how many of `samples` random points in the unit square fall inside the quarter circle.
///
/// Four times the ratio of hits to samples approximates π.
#[must_use]
pub fn monte_carlo_hits(seed: u64, samples: u64) -> u64 {
    let mut rng = Lcg::new(seed);
    let mut hits = 0_u64;

    for _ in 0..samples {
        let x = rng.next_f64();
        let y = rng.next_f64();

        if x.mul_add(x, y * y) <= 1.0 {
            hits = hits.wrapping_add(1);
        }
    }

    hits
}

/// Calculates the difference between two f64 values and considers
/// them equal if the difference is not more than `close_enough`.
///
/// This is a "correctly performed" floating point equality comparison.
#[must_use]
pub fn f64_diff_abs(a: f64, b: f64, close_enough: f64) -> f64 {
    let diff = (a - b).abs();

    if diff <= close_enough { 0.0 } else { diff }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn watchdog_allows_fast_tests() {
        let result = with_watchdog(|| {
            // A test that completes quickly
            42
        });
        assert_eq!(result, 42);
    }

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    fn spin_for_takes_at_least_the_duration() {
        let started = Instant::now();
        spin_for(Duration::from_millis(5));

        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn gauge_sees_overlap() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let threads = (0..2)
            .map(|_| {
                let gauge = Arc::clone(&gauge);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || gauge.measure(|| barrier.wait()))
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(gauge.max(), 2);
    }

    #[test]
    fn lcg_is_deterministic_and_in_range() {
        let mut a = Lcg::new(7);
        let mut b = Lcg::new(7);

        for _ in 0..1_000 {
            let value = a.next_f64();
            assert!((0.0..1.0).contains(&value));
            assert!(f64_diff_abs(value, b.next_f64(), 0.0) == 0.0);
        }
    }

    #[cfg_attr(miri, ignore)] // Slow under Miri.
    #[test]
    fn monte_carlo_approximates_pi() {
        let samples = 200_000;
        let hits = monte_carlo_hits(1, samples);

        let estimate = 4.0 * hits as f64 / samples as f64;

        assert_eq!(f64_diff_abs(estimate, std::f64::consts::PI, 0.05), 0.0);
    }
}
