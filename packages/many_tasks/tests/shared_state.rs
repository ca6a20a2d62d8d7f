//! Integration tests for state shared between workers, and for state that is not.

use std::collections::BTreeMap;
use std::sync::Barrier;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use many_tasks::{
    ExecutionMode, RacyCounter, SharedCounter, SharedStore, TaskError, WorkerId, WorkerPool,
    from_fn, parallel_section, submit,
};
use testing::{ConcurrencyGauge, with_watchdog};

fn modes() -> Vec<ExecutionMode> {
    if cfg!(unix) {
        vec![ExecutionMode::Thread, ExecutionMode::Process]
    } else {
        vec![ExecutionMode::Thread]
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn shared_counter_loses_no_increments() {
    with_watchdog(|| {
        for mode in modes() {
            let counter = SharedCounter::new(0).unwrap();

            let tasks = (0..1_000)
                .map(|_| {
                    let counter = counter.clone();
                    from_fn(move || Ok(counter.increment()))
                })
                .collect();

            let results = submit(tasks, 10, 4, mode).unwrap();

            assert_eq!(counter.get(), 1_000);

            // Every increment observed a distinct intermediate value.
            let mut observed = results.into_values().unwrap();
            observed.sort_unstable();
            assert_eq!(observed, (1..=1_000).collect::<Vec<_>>());
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shared_counter_survives_parallel_sections() {
    with_watchdog(|| {
        let counter = SharedCounter::new(0).unwrap();

        let tasks = (0..8)
            .map(|_| {
                let counter = counter.clone();
                from_fn(move || {
                    parallel_section(|| {
                        for _ in 0..1_000 {
                            counter.increment();
                        }
                    });
                    Ok(())
                })
            })
            .collect();

        submit(tasks, 1, 4, ExecutionMode::Thread).unwrap();

        assert_eq!(counter.get(), 8_000);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn racy_counter_loses_updates_between_threads() {
    with_watchdog(|| {
        let mut pool = WorkerPool::builder()
            .workers(4)
            .mode(ExecutionMode::Thread)
            .build()
            .unwrap();

        let lost_in_some_trial = (0..10).any(|_| {
            let racy = RacyCounter::default();

            let tasks = (0..4)
                .map(|_| {
                    let racy = racy.clone();
                    from_fn(move || {
                        parallel_section(|| {
                            for _ in 0..2_000 {
                                racy.increment();
                            }
                        });
                        Ok(())
                    })
                })
                .collect();

            pool.execute(tasks, 1).unwrap();

            racy.get() < 8_000
        });

        assert!(lost_in_some_trial);
    });
}

#[cfg(unix)]
#[cfg_attr(miri, ignore)]
#[test]
fn racy_counter_is_invisible_across_processes() {
    with_watchdog(|| {
        let racy = RacyCounter::default();

        let tasks = (0..20)
            .map(|_| {
                let racy = racy.clone();
                from_fn(move || {
                    racy.increment();
                    Ok(racy.get())
                })
            })
            .collect();

        let seen_by_workers = submit(tasks, 5, 4, ExecutionMode::Process)
            .unwrap()
            .into_values()
            .unwrap();

        // Each worker process counted in its own copy; the caller never sees any of it.
        assert_eq!(racy.get(), 0);
        assert!(seen_by_workers.iter().all(|&value| value >= 1));
    });
}

#[cfg(unix)]
static PROCESS_LOCAL: AtomicU64 = AtomicU64::new(0);

#[cfg(unix)]
#[cfg_attr(miri, ignore)]
#[test]
fn globals_are_private_to_each_worker_process() {
    with_watchdog(|| {
        let tasks = (0..40)
            .map(|_| {
                from_fn(|| {
                    let value = PROCESS_LOCAL.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((many_tasks::current_worker_id(), value))
                })
            })
            .collect();

        let results = submit(tasks, 4, 4, ExecutionMode::Process)
            .unwrap()
            .into_values()
            .unwrap();

        assert_eq!(PROCESS_LOCAL.load(Ordering::SeqCst), 0);

        let mut per_worker = BTreeMap::<WorkerId, Vec<u64>>::new();
        for (worker, value) in results {
            per_worker.entry(worker).or_default().push(value);
        }

        // Every worker process started from a zero it inherited and counted only its own tasks.
        for values in per_worker.values_mut() {
            values.sort_unstable();
            let expected = (1..=values.len()).map(|n| n as u64).collect::<Vec<_>>();
            assert_eq!(*values, expected);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn store_slots_accumulate_exactly() {
    with_watchdog(|| {
        for mode in modes() {
            let store = SharedStore::new(10, 0).unwrap();

            let tasks = (0..100_i64)
                .map(|i| {
                    let store = store.clone();
                    from_fn(move || {
                        store
                            .accumulate(usize::try_from(i % 10).unwrap(), i)
                            .map_err(|e| TaskError::new(e.to_string()))
                    })
                })
                .collect();

            submit(tasks, 3, 4, mode).unwrap().into_values().unwrap();

            assert_eq!(store.total(), (0..100).sum::<i64>());

            let expected = (0..10_i64)
                .map(|slot| (0..10).map(|round| round * 10 + slot).sum::<i64>())
                .collect::<Vec<_>>();
            assert_eq!(store.snapshot(), expected);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn store_rejects_out_of_range_slot_from_task() {
    with_watchdog(|| {
        let store = SharedStore::new(2, 0).unwrap();

        let tasks = (0..3_usize)
            .map(|i| {
                let store = store.clone();
                from_fn(move || {
                    store
                        .accumulate(i, 1)
                        .map_err(|e| TaskError::new(e.to_string()))
                })
            })
            .collect();

        let results = submit(tasks, 1, 2, ExecutionMode::Thread).unwrap();

        let failures = results.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index(), 2);
        assert!(failures[0].error().message().contains("out of range"));
        assert_eq!(store.snapshot(), vec![1, 1]);
    });
}

const ACCUMULATIONS_PER_THREAD: usize = 200_000;

/// Accumulates from `threads` threads at once, thread `n` into slot `slot_of(n)`. Returns the
/// best wall time of several rounds.
fn best_accumulation_time(
    store: &SharedStore,
    threads: usize,
    gauge: &ConcurrencyGauge,
    slot_of: impl Fn(usize) -> usize + Sync,
) -> Duration {
    (0..5)
        .map(|_| {
            let start = Barrier::new(threads);

            let started = Instant::now();

            thread::scope(|scope| {
                for thread_index in 0..threads {
                    let start = &start;
                    let slot_of = &slot_of;

                    scope.spawn(move || {
                        start.wait();

                        gauge.measure(|| {
                            for _ in 0..ACCUMULATIONS_PER_THREAD {
                                store.accumulate(slot_of(thread_index), 1).unwrap();
                            }
                        });
                    });
                }
            });

            started.elapsed()
        })
        .min()
        .expect("five rounds were measured")
}

#[cfg_attr(miri, ignore)]
#[test]
fn distinct_slots_do_not_contend() {
    with_watchdog(|| {
        let threads = thread::available_parallelism().map_or(1, |n| n.get().min(4));

        if threads < 2 {
            // Nothing can overlap on a single core.
            return;
        }

        let store = SharedStore::new(threads, 0).unwrap();
        let gauge = ConcurrencyGauge::default();

        let same_slot = best_accumulation_time(&store, threads, &gauge, |_| 0);
        let distinct_slots = best_accumulation_time(&store, threads, &gauge, |n| n);

        // The threads genuinely ran side by side.
        assert_eq!(gauge.max(), threads);

        // Every thread owns its slot, so accumulating is no slower than fighting over one slot.
        assert!(
            distinct_slots < same_slot,
            "distinct slots took {distinct_slots:?}, one shared slot took {same_slot:?}"
        );

        let rounds = i64::try_from(ACCUMULATIONS_PER_THREAD * 5).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.first().copied(), Some(rounds * i64::try_from(threads + 1).unwrap()));
        assert!(snapshot.iter().skip(1).all(|&value| value == rounds));
    });
}
