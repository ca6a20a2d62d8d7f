//! Estimates π by scattering random points over many tasks and merging per-worker tallies.
//!
//! Every task counts the hits of its own samples without touching any shared state. The
//! partial tallies are merged only after the batch has completed.

use many_tasks::{
    ExecutionMode, PartialTally, Tally, WorkerPool, current_worker_id, from_fn, tally,
    tally_by_worker,
};

const TASK_COUNT: u64 = 400;
const SAMPLES_PER_TASK: u64 = 25_000;

fn main() {
    let mode = if cfg!(unix) {
        ExecutionMode::Process
    } else {
        ExecutionMode::Thread
    };

    let mut pool = WorkerPool::builder().mode(mode).build().unwrap();

    let tasks = (0..TASK_COUNT)
        .map(|seed| {
            from_fn(move || {
                let hits = testing::monte_carlo_hits(seed, SAMPLES_PER_TASK);
                Ok(PartialTally::new(
                    current_worker_id(),
                    Tally::new(SAMPLES_PER_TASK, hits),
                ))
            })
        })
        .collect();

    let results = pool.execute(tasks, 25).unwrap();
    println!(
        "{} tasks in {} chunks on {} {mode:?} workers",
        results.len(),
        results.stats().chunks_dispatched(),
        pool.worker_count()
    );

    let partials = results.into_values().unwrap();

    for (worker, subtotal) in tally_by_worker(partials.iter().copied()) {
        println!("{worker}: {} hits of {} samples", subtotal.sum, subtotal.count);
    }

    let total = tally(partials);

    let estimate = 4.0 * total.sum as f64 / total.count as f64;

    println!("π ≈ {estimate:.5}");
}
