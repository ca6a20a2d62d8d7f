//! Worker processes forked per batch that claim chunks through a cursor in shared memory.
//!
//! Forking from a multithreaded caller only duplicates the forking thread. Locks held by other
//! threads at that moment stay locked forever in the child, so the child code path avoids
//! anything that may take a process-wide lock it does not own: no logging, no channels, no
//! exit handlers. It talks to the caller exclusively through its pipe and the shared control
//! region, and leaves through `_exit`.
//!
//! The default panic hook writes to stderr under the stderr lock, so the child replaces it with
//! a silent hook before running any task. Panics still become task errors, whose message comes
//! from the panic payload.
//!
//! Task outputs are encoded one at a time in the child and decoded one at a time in the caller.
//! An output that does not survive the trip becomes a failure of its own task only.

use std::fs::File;
use std::io::{self, BufReader};
use std::num::NonZero;
use std::ops::Range;
use std::os::fd::{FromRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::frame::{read_message, write_message};
use crate::results::{Collector, Halt};
use crate::shared_region::SharedRegion;
use crate::task::execute_guarded;
use crate::{
    BatchResults, CancellationToken, Chunk, FailurePolicy, InFlight, PoolError, Task, TaskError,
    TaskResult, WorkerId, WorkerLifecycle, current_worker_id,
};

/// How often the caller checks the cancellation token while waiting for worker messages.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit code of a worker process whose own bookkeeping panicked.
const EXIT_PANICKED: i32 = 101;

/// Dispatch state shared between the caller and all worker processes of one batch.
#[repr(C)]
struct DispatchControl {
    next_chunk: AtomicUsize,
    dispatched: AtomicUsize,
    workers_started: AtomicUsize,
    cancelled: AtomicBool,
}

impl DispatchControl {
    /// Claims the next chunk, or returns `None` if the batch was halted or no chunks are left.
    fn claim(&self, chunks_total: usize) -> Option<usize> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }

        let chunk = self.next_chunk.fetch_add(1, Ordering::AcqRel);

        if chunk >= chunks_total {
            return None;
        }

        self.dispatched.fetch_add(1, Ordering::AcqRel);
        Some(chunk)
    }
}

/// A message from a worker process to the caller.
#[derive(Debug, Deserialize, Serialize)]
enum Frame {
    Started { worker: WorkerId },
    Claimed { chunk: usize },
    Completed { chunk: usize, results: Vec<EncodedResult> },
    Done,
}

#[derive(Debug)]
enum Event {
    Frame { slot: usize, frame: Frame },
    Undecodable { slot: usize, error: String },
    Closed { slot: usize },
}

/// The result of one task with its output already encoded.
///
/// Each output is encoded on its own, so one output that cannot be encoded or decoded does not
/// take the results of the other tasks in its chunk down with it.
#[derive(Debug, Deserialize, Serialize)]
struct EncodedResult {
    index: usize,
    worker: WorkerId,
    outcome: Result<serde_json::Value, TaskError>,
}

impl EncodedResult {
    fn new<O: Serialize>(index: usize, worker: WorkerId, outcome: Result<O, TaskError>) -> Self {
        let outcome = outcome.and_then(|output| {
            serde_json::to_value(output)
                .map_err(|error| TaskError::new(format!("output could not be encoded: {error}")))
        });

        Self {
            index,
            worker,
            outcome,
        }
    }

    fn failed(index: usize, message: String) -> Self {
        Self {
            index,
            worker: current_worker_id(),
            outcome: Err(TaskError::new(message)),
        }
    }

    fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    fn decode<O: DeserializeOwned>(self) -> TaskResult<O> {
        let outcome = self.outcome.and_then(|value| {
            serde_json::from_value(value)
                .map_err(|error| TaskError::new(format!("output could not be decoded: {error}")))
        });

        TaskResult::new(self.index, self.worker, outcome)
    }
}

/// What the caller knows about one worker process.
#[derive(Debug, Default)]
struct SlotState {
    worker: Option<WorkerId>,
    claimed: Option<usize>,
    done: bool,
}

#[derive(Debug)]
struct ChildProcess {
    pid: libc::pid_t,
    reader: Option<JoinHandle<()>>,
}

/// The worker processes of one batch.
#[derive(Debug, Default)]
struct Children {
    processes: Vec<ChildProcess>,
}

impl Children {
    /// Kills every worker process together with any per-task processes it started.
    fn kill_all(&self) {
        for child in &self.processes {
            // SAFETY: No memory safety preconditions. The child is not reaped yet, so its pid
            // (and process group id) cannot have been reused.
            let result = unsafe { libc::killpg(child.pid, libc::SIGKILL) };

            if result != 0 {
                // The child may not have entered its own process group yet.
                // SAFETY: As above.
                unsafe {
                    libc::kill(child.pid, libc::SIGKILL);
                }
            }
        }
    }

    /// Waits for every worker process to exit and for its pipe to be drained.
    #[cfg_attr(test, mutants::skip)] // Impractical to observe zombie processes in tests.
    fn reap(self) {
        for mut child in self.processes {
            wait_for_exit(child.pid);

            if let Some(reader) = child.reader.take() {
                _ = reader.join();
            }
        }
    }

    /// Reaps the worker processes on a background thread, so the caller can return immediately.
    fn reap_in_background(self) {
        let spawned = thread::Builder::new()
            .name("many_tasks-reaper".to_string())
            .spawn(move || self.reap());

        if let Err(error) = spawned {
            warn!(%error, "cannot start reaper thread, finished worker processes stay zombies");
        }
    }
}

fn wait_for_exit(pid: libc::pid_t) {
    let mut status = 0;

    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let result = unsafe { libc::waitpid(pid, &raw mut status, 0) };

        if result != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return;
        }
    }
}

fn create_pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];

    // SAFETY: `fds` has room for the two descriptors `pipe()` writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let [read_fd, write_fd] = fds;

    // SAFETY: Both descriptors were just created and nothing else owns them.
    let read = unsafe { File::from_raw_fd(read_fd) };
    // SAFETY: As above.
    let write = unsafe { OwnedFd::from_raw_fd(write_fd) };

    Ok((read, write))
}

/// Runs one batch on freshly forked worker processes.
#[cfg_attr(test, mutants::skip)] // Mutations here mostly turn into hangs.
pub(crate) fn run_batch<T>(
    chunks: &[Chunk<T>],
    task_count: usize,
    workers: NonZero<usize>,
    lifecycle: WorkerLifecycle,
    failure_policy: FailurePolicy,
    token: &CancellationToken,
) -> Result<BatchResults<T::Output>, PoolError>
where
    T: Task,
    T::Output: Serialize + DeserializeOwned,
{
    let chunks_total = chunks.len();
    let mut collector = Collector::new(task_count, chunks_total);

    let region = SharedRegion::new(1, |_| DispatchControl {
        next_chunk: AtomicUsize::new(0),
        dispatched: AtomicUsize::new(0),
        workers_started: AtomicUsize::new(0),
        cancelled: AtomicBool::new(token.is_cancelled()),
    })?;
    let control = region
        .as_slice()
        .first()
        .expect("type invariant - the region always holds exactly one element");

    let chunk_ranges = chunks.iter().map(Chunk::task_indexes).collect::<Vec<_>>();
    let settings = ChildSettings {
        lifecycle,
        fail_fast: failure_policy.is_fail_fast(),
    };

    let process_count = workers.get().min(chunks_total);
    let (events_tx, events_rx) = mpsc::channel();
    let mut children = Children::default();

    for slot in 0..process_count {
        match spawn_worker(slot, chunks, control, settings, &events_tx) {
            Ok(child) => children.processes.push(child),
            Err(source) => {
                control.cancelled.store(true, Ordering::Release);
                children.kill_all();
                children.reap();

                return Err(PoolError::WorkerStartupFailure {
                    worker: slot,
                    source,
                });
            }
        }
    }

    drop(events_tx);

    debug!(processes = process_count, chunks = chunks_total, "started worker processes");

    let mut slots = std::iter::repeat_with(SlotState::default)
        .take(process_count)
        .collect::<Vec<_>>();
    let mut open = process_count;
    let mut halt = None;

    while open > 0 {
        if token.is_cancelled() {
            control.cancelled.store(true, Ordering::Release);
        }

        let event = match events_rx.recv_timeout(CANCELLATION_POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            Event::Frame { slot, frame } => {
                let Some(state) = slots.get_mut(slot) else {
                    continue;
                };

                match frame {
                    Frame::Started { worker } => state.worker = Some(worker),
                    Frame::Claimed { chunk } => {
                        trace!(slot, chunk, "worker process claimed chunk");
                        state.claimed = Some(chunk);
                    }
                    Frame::Completed { chunk, results } => {
                        if state.claimed == Some(chunk) {
                            state.claimed = None;
                        }

                        let failure = collector
                            .accept(results.into_iter().map(EncodedResult::decode).collect());

                        if let Some(failure) = failure.filter(|_| settings.fail_fast) {
                            control.cancelled.store(true, Ordering::Release);
                            debug!(task = failure.index(), "halting batch after task failure");
                            halt = Some(Halt::FailFast(failure));
                            break;
                        }
                    }
                    Frame::Done => state.done = true,
                }
            }
            Event::Undecodable { slot, error } => {
                if let Some(state) = slots.get_mut(slot) {
                    fail_undecodable_chunk(slot, state, &error, &chunk_ranges, &mut collector);
                }
            }
            Event::Closed { slot } => {
                open = open.saturating_sub(1);

                if let Some(state) = slots.get(slot) {
                    fail_lost_chunk(slot, state, &chunk_ranges, &mut collector);
                }
            }
        }
    }

    let stats = collector.stats_mut();
    stats.chunks_dispatched = control.dispatched.load(Ordering::Acquire);
    stats.workers_started = match lifecycle {
        WorkerLifecycle::PerTask => control.workers_started.load(Ordering::Acquire),
        WorkerLifecycle::Pooled => process_count,
    };

    match (&halt, failure_policy) {
        (Some(_), FailurePolicy::FailFast(InFlight::Terminate)) => {
            children.kill_all();
            children.reap();
        }
        (Some(_), _) => children.reap_in_background(),
        (None, _) => children.reap(),
    }

    if halt.is_none() && collector.missing_count() > 0 {
        if token.is_cancelled() {
            halt = Some(Halt::Cancelled);
        } else {
            let worker = slots.iter().position(|state| !state.done).unwrap_or(0);

            return Err(PoolError::WorkerLost {
                worker,
                reason: "worker processes exited before all chunks were executed".to_string(),
            });
        }
    }

    Ok(collector.finish(halt))
}

/// Reports every task of the chunk a worker process was executing when it exited as failed.
fn fail_lost_chunk<O>(
    slot: usize,
    state: &SlotState,
    chunk_ranges: &[Range<usize>],
    collector: &mut Collector<O>,
) {
    if state.done {
        return;
    }

    let (Some(chunk), Some(worker)) = (state.claimed, state.worker) else {
        warn!(slot, "worker process exited without reporting completion");
        return;
    };

    warn!(slot, chunk, %worker, "worker process exited in the middle of a chunk");

    if let Some(range) = chunk_ranges.get(chunk) {
        collector.fail_missing(
            range.clone(),
            worker,
            &TaskError::new("worker process exited before reporting"),
        );
    }
}

/// Reports the tasks of the chunk a worker process was executing as failed when one of its
/// messages could not be decoded.
///
/// The worker keeps running, so a later message about the same chunk still fills in whatever
/// results are not known yet.
fn fail_undecodable_chunk<O>(
    slot: usize,
    state: &mut SlotState,
    error: &str,
    chunk_ranges: &[Range<usize>],
    collector: &mut Collector<O>,
) {
    warn!(slot, error, "cannot decode message from worker process");

    let (Some(chunk), Some(worker)) = (state.claimed.take(), state.worker) else {
        return;
    };

    if let Some(range) = chunk_ranges.get(chunk) {
        collector.fail_missing(
            range.clone(),
            worker,
            &TaskError::new(format!("output could not be decoded: {error}")),
        );
    }
}

#[derive(Clone, Copy, Debug)]
struct ChildSettings {
    lifecycle: WorkerLifecycle,
    fail_fast: bool,
}

fn spawn_worker<T>(
    slot: usize,
    chunks: &[Chunk<T>],
    control: &DispatchControl,
    settings: ChildSettings,
    events_tx: &mpsc::Sender<Event>,
) -> io::Result<ChildProcess>
where
    T: Task,
    T::Output: Serialize,
{
    let (read, write) = create_pipe()?;

    // SAFETY: The child only runs code that is safe after forking a multithreaded process
    // (see module docs) and never returns from `run_worker()`.
    let pid = unsafe { libc::fork() };

    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            drop(read);
            run_worker(chunks, control, settings, File::from(write))
        }
        pid => {
            drop(write);

            // Both sides set the process group so it is in place before either relies on it.
            // SAFETY: No memory safety preconditions.
            unsafe {
                libc::setpgid(pid, pid);
            }

            let events_tx = events_tx.clone();
            let reader = thread::Builder::new()
                .name(format!("many_tasks-r{slot}"))
                .spawn(move || forward_frames(slot, read, &events_tx));

            match reader {
                Ok(reader) => Ok(ChildProcess {
                    pid,
                    reader: Some(reader),
                }),
                Err(error) => {
                    let orphan = Children {
                        processes: vec![ChildProcess { pid, reader: None }],
                    };
                    orphan.kill_all();
                    orphan.reap();

                    Err(error)
                }
            }
        }
    }
}

/// Forwards the messages of one worker process until its pipe is closed.
///
/// Keeps draining the pipe after the caller stopped listening, so the worker never blocks on a
/// full pipe. A message that cannot be decoded is reported and skipped.
fn forward_frames(slot: usize, read: File, events_tx: &mpsc::Sender<Event>) {
    let mut reader = BufReader::new(read);

    while let Ok(Some(message)) = read_message::<Frame>(&mut reader) {
        let event = match message {
            Ok(frame) => Event::Frame { slot, frame },
            Err(error) => Event::Undecodable {
                slot,
                error: error.to_string(),
            },
        };

        _ = events_tx.send(event);
    }

    _ = events_tx.send(Event::Closed { slot });
}

/// The body of a worker process.
#[cfg_attr(test, mutants::skip)] // Runs in a forked child, invisible to mutation testing.
fn run_worker<T>(
    chunks: &[Chunk<T>],
    control: &DispatchControl,
    settings: ChildSettings,
    mut pipe: File,
) -> !
where
    T: Task,
    T::Output: Serialize,
{
    // SAFETY: No memory safety preconditions.
    unsafe {
        libc::setpgid(0, 0);
    }

    panic::set_hook(Box::new(|_| {}));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        claim_and_execute(chunks, control, settings, &mut pipe)
    }));

    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(_)) => 1,
        Err(_) => EXIT_PANICKED,
    };

    // SAFETY: Leaving without running exit handlers or destructors, which belong to the caller.
    unsafe { libc::_exit(code) }
}

fn claim_and_execute<T>(
    chunks: &[Chunk<T>],
    control: &DispatchControl,
    settings: ChildSettings,
    pipe: &mut File,
) -> io::Result<()>
where
    T: Task,
    T::Output: Serialize,
{
    write_message(
        pipe,
        &Frame::Started {
            worker: current_worker_id(),
        },
    )?;

    if settings.lifecycle == WorkerLifecycle::Pooled {
        control.workers_started.fetch_add(1, Ordering::AcqRel);
    }

    while let Some(chunk) = control.claim(chunks.len()) {
        let Some(tasks) = chunks.get(chunk) else {
            break;
        };

        write_message(pipe, &Frame::Claimed { chunk })?;

        let mut results = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.indexed_tasks() {
            let result = match settings.lifecycle {
                WorkerLifecycle::PerTask => execute_in_new_process(index, task, control),
                WorkerLifecycle::Pooled => {
                    EncodedResult::new(index, current_worker_id(), execute_guarded(task))
                }
            };

            let failed = !result.is_ok();
            results.push(result);

            if failed && settings.fail_fast {
                control.cancelled.store(true, Ordering::Release);
                break;
            }
        }

        write_message(pipe, &Frame::Completed { chunk, results })?;
    }

    write_message(pipe, &Frame::Done)
}

/// Executes a single task in a process forked just for it. Runs inside a worker process.
fn execute_in_new_process<T>(
    index: usize,
    task: &T,
    control: &DispatchControl,
) -> EncodedResult
where
    T: Task,
    T::Output: Serialize,
{
    let (read, write) = match create_pipe() {
        Ok(pipe) => pipe,
        Err(error) => {
            return EncodedResult::failed(
                index,
                format!("failed to create a pipe for the task: {error}"),
            );
        }
    };

    // SAFETY: The worker process is single-threaded, so the fork duplicates all of its state.
    let pid = unsafe { libc::fork() };

    match pid {
        -1 => EncodedResult::failed(
            index,
            format!(
                "failed to start a process for the task: {}",
                io::Error::last_os_error()
            ),
        ),
        0 => {
            drop(read);
            let mut pipe = File::from(write);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let result = EncodedResult::new(index, current_worker_id(), execute_guarded(task));
                write_message(&mut pipe, &result)
            }));

            let code = if matches!(outcome, Ok(Ok(()))) { 0 } else { 1 };

            // SAFETY: Leaving without running exit handlers or destructors, which belong to the
            // worker process.
            unsafe { libc::_exit(code) }
        }
        pid => {
            drop(write);
            control.workers_started.fetch_add(1, Ordering::AcqRel);

            let result = read_message::<EncodedResult>(&mut BufReader::new(read));
            wait_for_exit(pid);

            match result {
                Ok(Some(Ok(result))) => result,
                Ok(Some(Err(error))) => EncodedResult::failed(
                    index,
                    format!("task process sent an unreadable result: {error}"),
                ),
                Ok(None) | Err(_) => {
                    EncodedResult::failed(index, "task process exited before reporting".to_string())
                }
            }
        }
    }
}
