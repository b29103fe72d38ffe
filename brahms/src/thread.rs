//! Engine threads.
//!
//! Every OS thread started by the engine is wrapped in a [`Thread`], which
//! tracks its lifecycle state, emits heartbeats used for hang detection and
//! accumulates wallclock and CPU time per execution phase. The procedure run
//! by a thread receives a [`ThreadContext`] through which it reports
//! activity.
//!
//! Threads come in classes ([`ThreadClass`]): the caller thread that drives
//! the engine, the worker threads that service components and the three
//! thread roles of a communication channel. Identifiers are made of the class
//! letter and a 1-based index, e.g. `W1` or `D2`.

mod cpu;
pub(crate) mod workers;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self as os_thread, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::error::{Error, ErrorCode};
use crate::sync::{CancelFlag, Signal};

use cpu::CpuTimes;

/// Role of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadClass {
    /// The thread driving the engine.
    Caller,
    /// A thread servicing components.
    Worker,
    /// A thread writing messages to a channel.
    Sender,
    /// A thread reading messages from a channel.
    Receiver,
    /// A thread dispatching received messages.
    Deliverer,
}

impl ThreadClass {
    /// Returns the letter used in thread identifiers.
    pub fn letter(self) -> char {
        match self {
            Self::Caller => 'C',
            Self::Worker => 'W',
            Self::Sender => 'S',
            Self::Receiver => 'R',
            Self::Deliverer => 'D',
        }
    }

    /// Returns the relative priority of the class; higher is more urgent.
    ///
    /// A thread that others depend on to make progress ranks above them:
    /// senders feed remote voices, workers feed senders, and received
    /// messages are only useful once the workers have consumed earlier ones.
    pub fn priority(self) -> i32 {
        match self {
            Self::Receiver => 0,
            Self::Deliverer => 1,
            Self::Worker | Self::Caller => 2,
            Self::Sender => 3,
        }
    }

    fn niceness(self) -> i32 {
        Self::Sender.priority() - self.priority()
    }
}

/// Identifier of a thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    class: ThreadClass,
    index: usize,
}

impl ThreadId {
    /// Creates the identifier of the `index`-th (1-based) thread of a class.
    pub fn new(class: ThreadClass, index: usize) -> Self {
        Self { class, index }
    }

    /// Returns the thread class.
    pub fn class(&self) -> ThreadClass {
        self.class
    }

    /// Returns the 1-based index within the class.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class.letter(), self.index)
    }
}

/// Lifecycle state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadState {
    /// Not started yet.
    Virgin,
    /// Running its procedure.
    Active,
    /// The procedure returned.
    Finished,
    /// The OS refused to create the thread.
    StartFailed,
    /// Terminated by its owner.
    Terminated,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Virgin,
            1 => Self::Active,
            2 => Self::Finished,
            3 => Self::StartFailed,
            _ => Self::Terminated,
        }
    }
}

/// Execution phase, for timing purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Module creation up to the end of the connect phase.
    Init,
    /// The run phase.
    Run,
    /// Termination.
    Term,
}

/// Time spent in one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhaseTiming {
    /// Elapsed wallclock time.
    pub wall: Duration,
    /// CPU time in user mode.
    pub user: Duration,
    /// CPU time in kernel mode.
    pub kernel: Duration,
}

/// Time spent by a thread in each phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadTiming {
    /// Initialization.
    pub init: PhaseTiming,
    /// Run phase.
    pub run: PhaseTiming,
    /// Termination.
    pub term: PhaseTiming,
}

impl ThreadTiming {
    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseTiming {
        match phase {
            Phase::Init => &mut self.init,
            Phase::Run => &mut self.run,
            Phase::Term => &mut self.term,
        }
    }
}

struct ThreadShared {
    id: ThreadId,
    state: AtomicU8,
    epoch: Instant,
    heartbeat: CachePadded<AtomicU64>,
    hung: AtomicBool,
    timing: Mutex<ThreadTiming>,
    panic: Mutex<Option<String>>,
}

impl ThreadShared {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: AtomicU8::new(ThreadState::Virgin as u8),
            epoch: Instant::now(),
            heartbeat: CachePadded::new(AtomicU64::new(0)),
            hung: AtomicBool::new(false),
            timing: Mutex::new(ThreadTiming::default()),
            panic: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn beat(&self) {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        self.heartbeat.store(nanos, Ordering::Relaxed);
    }
}

/// Handle through which a thread procedure reports its activity.
pub struct ThreadContext {
    shared: Arc<ThreadShared>,
    phase: Option<(Phase, Instant, CpuTimes)>,
}

impl ThreadContext {
    fn new(shared: Arc<ThreadShared>) -> Self {
        Self {
            shared,
            phase: None,
        }
    }

    /// Returns the identifier of the thread.
    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    /// Emits a heartbeat.
    pub fn still_active(&self) {
        self.shared.beat();
    }

    /// Starts accounting time to `phase`, closing the current phase if any.
    pub fn begin_phase(&mut self, phase: Phase) {
        self.end_phase();
        self.phase = Some((phase, Instant::now(), cpu::thread_cpu_times()));
    }

    /// Stops accounting time to the current phase.
    pub fn end_phase(&mut self) {
        if let Some((phase, wall_start, cpu_start)) = self.phase.take() {
            let cpu_end = cpu::thread_cpu_times();
            let mut timing = self.shared.timing.lock().unwrap();
            let acc = timing.phase_mut(phase);
            acc.wall += wall_start.elapsed();
            acc.user += cpu_end.user.saturating_sub(cpu_start.user);
            acc.kernel += cpu_end.kernel.saturating_sub(cpu_start.kernel);
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.end_phase();
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// An engine thread.
pub struct Thread {
    shared: Arc<ThreadShared>,
    handle: Option<JoinHandle<()>>,
    priorities: bool,
    terminated: bool,
}

impl Thread {
    /// Creates a thread object in the `Virgin` state.
    ///
    /// If `priorities` is set, the thread lowers its OS priority according
    /// to its class when started.
    pub fn new(class: ThreadClass, index: usize, priorities: bool) -> Self {
        Self {
            shared: Arc::new(ThreadShared::new(ThreadId::new(class, index))),
            handle: None,
            priorities,
            terminated: false,
        }
    }

    /// Wraps the calling thread as the `Caller` thread of an engine.
    pub fn caller() -> (Self, ThreadContext) {
        let shared = Arc::new(ThreadShared::new(ThreadId::new(ThreadClass::Caller, 1)));
        shared.set_state(ThreadState::Active);
        shared.beat();
        let thread = Self {
            shared: shared.clone(),
            handle: None,
            priorities: false,
            terminated: false,
        };

        (thread, ThreadContext::new(shared))
    }

    /// Returns the identifier of the thread.
    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ThreadState {
        if self.terminated {
            ThreadState::Terminated
        } else {
            self.shared.state()
        }
    }

    /// Returns `true` while the thread runs its procedure.
    pub fn is_active(&self) -> bool {
        self.state() == ThreadState::Active
    }

    /// Returns the time elapsed since the last heartbeat.
    pub fn since_heartbeat(&self) -> Duration {
        let now = self.shared.epoch.elapsed();
        let last = Duration::from_nanos(self.shared.heartbeat.load(Ordering::Relaxed));

        now.saturating_sub(last)
    }

    /// Flags the thread as hung.
    pub fn flag_hung(&self) {
        self.shared.hung.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if the thread was flagged as hung.
    pub fn is_hung(&self) -> bool {
        self.shared.hung.load(Ordering::Relaxed)
    }

    /// Returns the accumulated phase timings.
    pub fn timing(&self) -> ThreadTiming {
        *self.shared.timing.lock().unwrap()
    }

    /// Returns the message of a panic that escaped the thread procedure.
    pub fn panic_message(&self) -> Option<String> {
        self.shared.panic.lock().unwrap().clone()
    }

    /// Starts the thread and waits until it is running.
    ///
    /// Only a `Virgin` thread can be started. A panic escaping `proc` is
    /// caught, logged and recorded; thread procedures are expected to report
    /// errors through their own channels.
    pub fn start<F>(&mut self, timeout: Duration, proc: F) -> Result<(), Error>
    where
        F: FnOnce(&mut ThreadContext) + Send + 'static,
    {
        if self.state() != ThreadState::Virgin {
            return Err(Error::new(
                ErrorCode::Internal,
                format!("thread {} started twice", self.id()),
            ));
        }

        let started = Arc::new(Signal::new());
        let shared = self.shared.clone();
        let niceness = if self.priorities {
            self.id().class().niceness()
        } else {
            0
        };

        // Set before spawning so that a fast procedure cannot have its
        // `Finished` state overwritten.
        self.shared.set_state(ThreadState::Active);
        let spawned = os_thread::Builder::new()
            .name(self.id().to_string())
            .spawn({
                let started = started.clone();
                move || {
                    if !cpu::set_thread_niceness(niceness) {
                        tracing::debug!(thread = %shared.id, "could not adjust thread priority");
                    }
                    let mut cx = ThreadContext::new(shared.clone());
                    cx.still_active();
                    started.set();

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| proc(&mut cx)));
                    cx.end_phase();
                    if let Err(payload) = outcome {
                        let message = panic_payload_message(payload.as_ref());
                        tracing::error!(
                            thread = %shared.id,
                            "thread procedure panicked: {}",
                            message
                        );
                        *shared.panic.lock().unwrap() = Some(message);
                    }
                    shared.set_state(ThreadState::Finished);
                }
            });

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                self.shared.set_state(ThreadState::StartFailed);
                return Err(Error::new(
                    ErrorCode::ThreadError,
                    format!("could not start thread {}: {}", self.id(), e),
                ));
            }
        }

        match started.wait_for(timeout, &CancelFlag::new()) {
            Ok(true) => Ok(()),
            _ => Err(Error::new(
                ErrorCode::ThreadError,
                format!("thread {} did not start within {:?}", self.id(), timeout),
            )),
        }
    }

    /// Terminates the thread.
    ///
    /// Waits up to `timeout` for an active thread to finish, polling every
    /// millisecond. A thread that does not finish in time is abandoned: its
    /// OS thread is detached and keeps running until the process exits.
    /// Calling `terminate` again has no effect.
    pub fn terminate(&mut self, timeout: Duration) {
        match self.state() {
            ThreadState::Terminated => return,
            ThreadState::Virgin | ThreadState::StartFailed => {}
            ThreadState::Finished => self.join(),
            ThreadState::Active => {
                if self.handle.is_some() {
                    let deadline = Instant::now() + timeout;
                    while self.is_active() && Instant::now() < deadline {
                        spin_sleep::sleep(Duration::from_millis(1));
                    }
                }
                if self.is_active() && self.handle.is_some() {
                    if !self.is_hung() {
                        tracing::warn!(
                            thread = %self.id(),
                            "thread did not terminate within {:?} and was abandoned (not good)",
                            timeout
                        );
                    }
                    self.handle = None;
                } else {
                    self.join();
                }
            }
        }
        self.terminated = true;
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Panics are caught by the wrapper, so joining cannot fail.
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Best effort only: a running thread is detached.
        if self.state() == ThreadState::Finished {
            self.join();
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use std::sync::mpsc;

    #[test]
    fn identifiers() {
        assert_eq!(ThreadId::new(ThreadClass::Worker, 1).to_string(), "W1");
        assert_eq!(ThreadId::new(ThreadClass::Deliverer, 12).to_string(), "D12");
        assert!(ThreadClass::Sender.priority() > ThreadClass::Worker.priority());
        assert!(ThreadClass::Receiver.priority() < ThreadClass::Deliverer.priority());
    }

    #[test]
    fn lifecycle() {
        let mut thread = Thread::new(ThreadClass::Worker, 1, false);
        assert_eq!(thread.state(), ThreadState::Virgin);

        let (tx, rx) = mpsc::channel::<()>();
        thread
            .start(Duration::from_secs(5), move |cx| {
                cx.begin_phase(Phase::Run);
                let _ = rx.recv();
            })
            .unwrap();
        assert!(thread.is_active());

        let err = thread
            .start(Duration::from_secs(5), |_| {})
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        drop(tx);
        thread.terminate(Duration::from_secs(5));
        assert_eq!(thread.state(), ThreadState::Terminated);
        assert!(thread.timing().run.wall > Duration::ZERO);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut virgin = Thread::new(ThreadClass::Sender, 1, false);
        virgin.terminate(Duration::from_millis(10));
        virgin.terminate(Duration::from_millis(10));
        assert_eq!(virgin.state(), ThreadState::Terminated);

        let mut finished = Thread::new(ThreadClass::Receiver, 1, false);
        finished.start(Duration::from_secs(5), |_| {}).unwrap();
        for _ in 0..3 {
            finished.terminate(Duration::from_secs(5));
            assert_eq!(finished.state(), ThreadState::Terminated);
        }
    }

    #[test]
    fn stuck_thread_is_abandoned() {
        let mut thread = Thread::new(ThreadClass::Worker, 2, false);
        let (tx, rx) = mpsc::channel::<()>();
        thread
            .start(Duration::from_secs(5), move |_| {
                let _ = rx.recv();
            })
            .unwrap();

        let start = Instant::now();
        thread.terminate(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(thread.state(), ThreadState::Terminated);

        thread.terminate(Duration::from_millis(20));
        drop(tx);
    }

    #[test]
    fn escaped_panic_is_recorded() {
        let mut thread = Thread::new(ThreadClass::Deliverer, 1, false);
        thread
            .start(Duration::from_secs(5), |_| panic!("bad procedure"))
            .unwrap();
        thread.terminate(Duration::from_secs(5));

        assert_eq!(thread.panic_message().as_deref(), Some("bad procedure"));
    }

    #[test]
    fn heartbeat_age() {
        let (thread, cx) = Thread::caller();
        cx.still_active();
        assert!(thread.since_heartbeat() < Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(thread.since_heartbeat() >= Duration::from_millis(20));
    }
}
