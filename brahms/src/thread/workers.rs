//! Worker pool.
//!
//! The worker pool owns one `Worker` thread per assignment slot. Outside the
//! run phase, workers idle on a command queue and execute the jobs sent to
//! them, which is how lifecycle events reach processes that must not change
//! thread. In the run phase each worker executes its own run loop until all
//! its processes reached the stop time.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::component::{CommonEvent, ComponentCell, EventReply, ModuleFlags};
use crate::error::{Error, ErrorCode};
use crate::params::ExecParams;
use crate::sync::{CancelFlag, Signal, WAIT_STEP};
use crate::thread::{panic_payload_message, Thread, ThreadClass, ThreadContext, ThreadId};

/// A job executed on a worker thread.
pub(crate) type Job = Box<dyn FnOnce(&mut ThreadContext) + Send>;

/// The run loop of a worker.
pub(crate) type RunLoop = Box<dyn FnOnce(&mut ThreadContext) -> Result<(), Error> + Send>;

enum Command {
    Job(Job),
    Quit,
}

/// Placement constraints of a process.
#[derive(Clone, Debug)]
pub(crate) struct Placement<'a> {
    pub(crate) class: &'a str,
    pub(crate) flags: ModuleFlags,
    pub(crate) hint: Option<usize>,
}

/// Assignment of processes to worker threads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Assignment {
    /// Number of worker threads.
    pub(crate) threads: usize,
    /// Worker index of each process.
    pub(crate) worker_of: Vec<usize>,
}

/// Assigns processes to worker threads.
///
/// All processes of a class flagged `NO_CONCURRENCY` share one thread.
/// Explicit hints are honoured modulo the thread count and the remaining
/// processes are dealt round-robin. No more threads are created than there
/// are independently schedulable processes, nor more than `max_threads`
/// (0 meaning the number of CPUs).
pub(crate) fn assign_threads(processes: &[Placement<'_>], max_threads: usize) -> Assignment {
    let limit = if max_threads == 0 {
        num_cpus::get()
    } else {
        max_threads
    };

    let mut classes = Vec::new();
    let mut units = 0;
    for p in processes {
        if p.flags.contains(ModuleFlags::NO_CONCURRENCY) {
            if !classes.contains(&p.class) {
                classes.push(p.class);
                units += 1;
            }
        } else {
            units += 1;
        }
    }
    let threads = units.min(limit).max(1);

    let mut class_worker: HashMap<&str, usize> = HashMap::new();
    let mut next = 0;
    let mut worker_of = Vec::with_capacity(processes.len());
    for p in processes {
        let shared = p.flags.contains(ModuleFlags::NO_CONCURRENCY);
        if let Some(&worker) = class_worker.get(p.class).filter(|_| shared) {
            worker_of.push(worker);
            continue;
        }
        let worker = match p.hint {
            Some(hint) => hint % threads,
            None => {
                next += 1;
                (next - 1) % threads
            }
        };
        if shared {
            class_worker.insert(p.class, worker);
        }
        worker_of.push(worker);
    }

    Assignment { threads, worker_of }
}

/// A component to deliver a common event to.
#[derive(Clone)]
pub(crate) struct EventTarget {
    /// Caller-defined key returned along with the reply.
    pub(crate) key: usize,
    /// Worker owning the component, if any.
    pub(crate) worker: Option<usize>,
    /// The event must be handled on the owning worker.
    pub(crate) pinned: bool,
    pub(crate) cell: Arc<Mutex<ComponentCell>>,
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("key", &self.key)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Progress of the run phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunStatus {
    /// At least one worker is still running.
    Active,
    /// Every worker left its run loop.
    Finished,
    /// A running worker did not emit a heartbeat within the hang timeout.
    Hung(ThreadId),
}

const RUN_IDLE: u8 = 0;
const RUN_RUNNING: u8 = 1;
const RUN_DONE: u8 = 2;

struct WorkerStatus {
    run: AtomicU8,
    error: Mutex<Option<Error>>,
}

struct Worker {
    thread: Thread,
    commands: Sender<Command>,
    status: Arc<WorkerStatus>,
}

/// The worker threads of an engine.
pub(crate) struct Workers {
    workers: Vec<Worker>,
    hang_timeout: Duration,
    term_timeout: Duration,
}

impl Workers {
    /// Starts `count` worker threads.
    pub(crate) fn new(count: usize, params: &ExecParams) -> Result<Self, Error> {
        let mut workers = Self {
            workers: Vec::with_capacity(count),
            hang_timeout: params.thread_hang_timeout,
            term_timeout: params.thread_term_timeout,
        };

        for index in 0..count {
            let (commands, queue) = mpsc::channel();
            let mut thread = Thread::new(ThreadClass::Worker, index + 1, params.thread_priorities);
            let status = Arc::new(WorkerStatus {
                run: AtomicU8::new(RUN_IDLE),
                error: Mutex::new(None),
            });
            // On error, dropping `workers` quits the threads started so far.
            thread.start(params.thread_start_timeout, move |cx| idle_loop(cx, queue))?;
            workers.workers.push(Worker {
                thread,
                commands,
                status,
            });
        }
        tracing::debug!("started {} worker threads", count);

        Ok(workers)
    }

    /// Returns the number of workers.
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns the worker threads.
    pub(crate) fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.workers.iter().map(|w| &w.thread)
    }

    /// Executes a closure on a worker thread and waits for its result.
    ///
    /// A worker that does not reply within the hang timeout is flagged hung.
    pub(crate) fn call_on<R, F>(&self, worker: usize, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut ThreadContext) -> R + Send + 'static,
    {
        let target = self.worker(worker)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        target
            .commands
            .send(Command::Job(Box::new(move |cx| {
                let _ = reply_tx.send(f(cx));
            })))
            .map_err(|_| exited(target.thread.id()))?;

        self.wait_reply(target, &reply_rx, Instant::now() + self.hang_timeout)
    }

    /// Delivers a common event to a set of components.
    ///
    /// Serial events are delivered one component at a time, from the
    /// calling thread unless the component is pinned to its worker. Parallel
    /// events are handed to every worker at once, each worker handling its
    /// own components in order, while utilities and unassigned components
    /// are handled by the calling thread. Components of hung workers are
    /// skipped.
    pub(crate) fn fire_common_event(
        &self,
        event: CommonEvent,
        targets: &[EventTarget],
    ) -> Vec<(usize, Result<EventReply, Error>)> {
        let mut replies = Vec::with_capacity(targets.len());
        let live: Vec<&EventTarget> = targets
            .iter()
            .filter(|t| match t.worker {
                Some(w) if self.is_hung(w) => {
                    tracing::warn!("skipping {:?} on a hung worker", event);
                    false
                }
                _ => true,
            })
            .collect();

        if !event.is_parallel() {
            for target in live {
                let reply = match (target.pinned, target.worker) {
                    (true, Some(worker)) => {
                        let cell = target.cell.clone();
                        self.call_on(worker, move |cx| {
                            cx.begin_phase(event.phase());
                            let reply = cell.lock().unwrap().fire_common(event);
                            cx.end_phase();
                            reply
                        })
                        .and_then(|reply| reply)
                    }
                    _ => target.cell.lock().unwrap().fire_common(event),
                };
                replies.push((target.key, reply));
            }

            return replies;
        }

        let mut pending = Vec::new();
        let mut local = Vec::new();
        let mut per_worker: Vec<Vec<EventTarget>> = vec![Vec::new(); self.workers.len()];
        for target in live {
            match target.worker {
                Some(w) if w < self.workers.len() => per_worker[w].push(target.clone()),
                _ => local.push(target),
            }
        }
        for (index, batch) in per_worker.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let keys: Vec<usize> = batch.iter().map(|t| t.key).collect();
            let (reply_tx, reply_rx) = mpsc::channel();
            let job: Job = Box::new(move |cx| {
                cx.begin_phase(event.phase());
                let results: Vec<_> = batch
                    .iter()
                    .map(|t| (t.key, t.cell.lock().unwrap().fire_common(event)))
                    .collect();
                cx.end_phase();
                let _ = reply_tx.send(results);
            });
            let worker = &self.workers[index];
            if worker.commands.send(Command::Job(job)).is_err() {
                let e = exited(worker.thread.id());
                replies.extend(keys.into_iter().map(|k| (k, Err(e.clone()))));
            } else {
                pending.push((index, keys, reply_rx));
            }
        }

        for target in local {
            replies.push((target.key, target.cell.lock().unwrap().fire_common(event)));
        }

        let deadline = Instant::now() + self.hang_timeout;
        for (index, keys, reply_rx) in pending {
            match self.wait_reply(&self.workers[index], &reply_rx, deadline) {
                Ok(results) => replies.extend(results),
                Err(e) => replies.extend(keys.into_iter().map(|k| (k, Err(e.clone())))),
            }
        }

        replies
    }

    /// Releases every worker into its run loop.
    ///
    /// The loops are dispatched first and then started together through a
    /// shared signal. A loop that fails stores its error, which can be
    /// collected with [`Workers::take_run_errors`].
    pub(crate) fn run(&self, loops: Vec<RunLoop>, cancel: &CancelFlag) -> Result<(), Error> {
        let release = Arc::new(Signal::new());

        for (worker, run_loop) in self.workers.iter().zip(loops) {
            let status = worker.status.clone();
            let release = release.clone();
            let cancel = cancel.clone();
            status.run.store(RUN_RUNNING, Ordering::Release);
            let job: Job = Box::new(move |cx| {
                let outcome = loop {
                    match release.wait_for(WAIT_STEP, &cancel) {
                        Ok(true) => {
                            break panic::catch_unwind(AssertUnwindSafe(|| run_loop(cx)))
                                .unwrap_or_else(|payload| {
                                    Err(Error::new(
                                        ErrorCode::ThreadError,
                                        format!(
                                            "run loop panicked: {}",
                                            panic_payload_message(payload.as_ref())
                                        ),
                                    ))
                                })
                        }
                        Ok(false) => cx.still_active(),
                        Err(e) => break Err(e),
                    }
                };
                if let Err(e) = outcome {
                    *status.error.lock().unwrap() = Some(e);
                }
                status.run.store(RUN_DONE, Ordering::Release);
            });
            if worker.commands.send(Command::Job(job)).is_err() {
                worker.status.run.store(RUN_DONE, Ordering::Release);
                return Err(exited(worker.thread.id()));
            }
        }
        release.set();

        Ok(())
    }

    /// Reports the progress of the run phase.
    ///
    /// A running worker whose last heartbeat is older than `hang_timeout` is
    /// flagged hung.
    pub(crate) fn run_phase_status(&self, hang_timeout: Duration) -> RunStatus {
        let mut status = RunStatus::Finished;
        for worker in &self.workers {
            if worker.status.run.load(Ordering::Acquire) == RUN_RUNNING {
                if worker.thread.since_heartbeat() > hang_timeout {
                    worker.thread.flag_hung();
                    tracing::error!(thread = %worker.thread.id(), "worker thread hung");

                    return RunStatus::Hung(worker.thread.id());
                }
                status = RunStatus::Active;
            }
        }

        status
    }

    /// Returns `true` if a run loop stopped with an error.
    pub(crate) fn run_failed(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.status.error.lock().unwrap().is_some())
    }

    /// Collects the errors of the run loops.
    pub(crate) fn take_run_errors(&self) -> Vec<Error> {
        self.workers
            .iter()
            .filter_map(|w| w.status.error.lock().unwrap().take())
            .collect()
    }

    /// Stops the worker threads.
    pub(crate) fn terminate(&mut self) {
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Quit);
        }
        for worker in &mut self.workers {
            worker.thread.terminate(self.term_timeout);
        }
    }

    fn worker(&self, index: usize) -> Result<&Worker, Error> {
        self.workers.get(index).ok_or_else(|| {
            Error::new(
                ErrorCode::Internal,
                format!("no worker thread with index {}", index),
            )
        })
    }

    fn is_hung(&self, index: usize) -> bool {
        self.workers
            .get(index)
            .map(|w| w.thread.is_hung())
            .unwrap_or(false)
    }

    fn wait_reply<R>(
        &self,
        worker: &Worker,
        reply_rx: &Receiver<R>,
        deadline: Instant,
    ) -> Result<R, Error> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                worker.thread.flag_hung();
                Err(Error::new(
                    ErrorCode::ThreadHung,
                    format!(
                        "thread {} did not complete its job within {:?}",
                        worker.thread.id(),
                        self.hang_timeout
                    ),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(exited(worker.thread.id())),
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Quit);
        }
    }
}

impl fmt::Debug for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workers")
            .field("count", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn exited(id: ThreadId) -> Error {
    Error::new(
        ErrorCode::ThreadError,
        format!("thread {} exited unexpectedly", id),
    )
}

fn idle_loop(cx: &mut ThreadContext, queue: Receiver<Command>) {
    loop {
        cx.still_active();
        match queue.recv_timeout(WAIT_STEP) {
            Ok(Command::Job(job)) => job(cx),
            Ok(Command::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
