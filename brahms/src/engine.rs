//! Execution engine.
//!
//! An [`Engine`] drives one voice of an execution through its lifecycle:
//!
//! ```text
//!   open ───────────────────────────────────────────────┐
//!   │ ModuleCreate, StateSet, InitPreconnect             │
//!   │ connect phase (InitConnect, over several passes)   │  init
//!   │ base-rate negotiation, ring buffers                │
//!   │ InitPostconnect, barrier                           │
//!   execute ────────────────────────────────────────────┤
//!   │ BeginRunPhase                                      │  run
//!   │ worker run loops (RunService) until the stop time  │
//!   close ──────────────────────────────────────────────┤
//!   │ EndRunPhase, BeginTermPhase, StateGet              │  term
//!   │ ModuleDestroy, barrier, comms shutdown             │
//!   └─ Report ───────────────────────────────────────────┘
//! ```
//!
//! Every voice of an execution runs its own engine with the same system
//! description; voices cooperate through their [`Comms`]. An error on any
//! voice aborts all of them, and [`Engine::close`] always performs the
//! cleanup that remains possible before returning the [`Report`].
//!
//! # Examples
//!
//! ```
//! use brahms::comms::Comms;
//! use brahms::component::{Component, Context, Event, EventReply};
//! use brahms::engine::Engine;
//! use brahms::error::Error;
//! use brahms::params::ExecParams;
//! use brahms::ports::DataSpec;
//! use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
//! use brahms::time::SampleRate;
//!
//! /// Emits the number of services so far.
//! struct Ticker(u64);
//!
//! impl Component for Ticker {
//!     fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
//!         match event {
//!             Event::InitConnect(mut connect) if !connect.has_output("out") => {
//!                 connect.create_output("out", DataSpec::new("std/u64", 8))?;
//!             }
//!             Event::RunService(mut service) => {
//!                 self.0 += 1;
//!                 service.write_output(0, &self.0.to_le_bytes())?;
//!             }
//!             _ => {}
//!         }
//!         Ok(EventReply::Done)
//!     }
//! }
//!
//! /// Keeps the last value received.
//! struct Last(u64);
//!
//! impl Component for Last {
//!     fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
//!         match event {
//!             Event::RunService(service) => {
//!                 let bytes = service.input(0)?;
//!                 self.0 = u64::from_le_bytes(bytes.try_into().unwrap());
//!             }
//!             Event::StateGet => return Ok(EventReply::State(self.0.to_le_bytes().to_vec())),
//!             _ => {}
//!         }
//!         Ok(EventReply::Done)
//!     }
//! }
//!
//! let rate = SampleRate::hz(100)?;
//! let system = SystemBuilder::new()
//!     .stop_time(0.1)
//!     .add_process(ProcessSpec::new("ticker", "demo/ticker", rate, || Ticker(0)))
//!     .add_process(ProcessSpec::new("last", "demo/last", rate, || Last(0)))
//!     .link(LinkSpec::new("ticker>>out", "last<<in"));
//!
//! let mut engine = Engine::new(Comms::solo(), ExecParams::default());
//! engine.open(system)?;
//! engine.execute(None)?;
//! let report = engine.close();
//!
//! // The last service reads, with a lag of one sample, the 9th value.
//! assert!(report.is_ok());
//! assert_eq!(report.final_state("last"), Some(&9u64.to_le_bytes()[..]));
//! # Ok::<(), Error>(())
//! ```

pub mod monitor;
pub mod report;
pub(crate) mod runner;

pub use monitor::{Monitor, MonitorControl, Progress};
pub use report::{
    ComponentKind, ComponentReport, Environment, Report, ThreadReport, EXIT_ERROR,
    EXIT_INVOCATION, EXIT_SUCCESS,
};

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::comms::Comms;
use crate::component::{CommonEvent, EventReply};
use crate::error::{Error, ErrorCode, ErrorStack};
use crate::params::{ExecParams, VoiceConfig};
use crate::sync::CancelFlag;
use crate::system::{negotiate_base_rate, System, SystemBuilder};
use crate::thread::workers::{assign_threads, RunLoop, RunStatus, Workers};
use crate::thread::{Phase, Thread, ThreadContext};
use crate::time::AdaptiveInterval;

use runner::Runner;

/// Poll step while waiting for aborted run loops to unwind.
const UNWIND_STEP: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Created,
    Opened,
    Executed,
    Failed,
    Closed,
}

/// The execution engine of one voice.
pub struct Engine {
    comms: Comms,
    params: ExecParams,
    cancel: CancelFlag,
    caller: Thread,
    caller_cx: ThreadContext,
    system: Option<System>,
    workers: Option<Workers>,
    errors: ErrorStack,
    stage: Stage,
    run_began: bool,
    states: HashMap<String, Vec<u8>>,
    started: Instant,
}

impl Engine {
    /// Creates an engine communicating through `comms`.
    pub fn new(mut comms: Comms, params: ExecParams) -> Self {
        let cancel = CancelFlag::new();
        comms.set_cancel(cancel.clone());
        let (caller, caller_cx) = Thread::caller();

        Self {
            comms,
            params,
            cancel,
            caller,
            caller_cx,
            system: None,
            workers: None,
            errors: ErrorStack::new(),
            stage: Stage::Created,
            run_began: false,
            states: HashMap::new(),
            started: Instant::now(),
        }
    }

    /// Returns the local voice.
    pub fn voice(&self) -> VoiceConfig {
        self.comms.voice()
    }

    /// Returns the execution parameters.
    pub fn params(&self) -> &ExecParams {
        &self.params
    }

    /// Returns a flag that cancels the execution when raised, from any
    /// thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Returns the errors recorded so far.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.errors()
    }

    /// Instantiates the local part of a system and runs the initialization
    /// phase, up to the barrier preceding the run phase.
    pub fn open(&mut self, system: SystemBuilder) -> Result<(), Error> {
        if self.stage != Stage::Created {
            return Err(Error::new(
                ErrorCode::Internal,
                "an engine can only open one system",
            ));
        }
        tracing::info!(voice = self.voice().index, "initialization phase");

        self.caller_cx.begin_phase(Phase::Init);
        let result = self.init_phase(system);
        self.caller_cx.end_phase();

        match result {
            Ok(()) => {
                self.stage = Stage::Opened;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Runs the run phase to completion.
    ///
    /// The optional monitor is called periodically with the progress of the
    /// execution and may cancel it.
    pub fn execute(&mut self, monitor: Option<&mut dyn Monitor>) -> Result<(), Error> {
        if self.stage != Stage::Opened {
            return Err(Error::new(
                ErrorCode::Internal,
                "execute requires a successfully opened engine",
            ));
        }
        tracing::info!(voice = self.voice().index, "run phase");

        self.caller_cx.begin_phase(Phase::Run);
        let result = self.run_phase(monitor);
        self.caller_cx.end_phase();

        match result {
            Ok(()) => {
                self.stage = Stage::Executed;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Terminates the execution and reports its outcome.
    ///
    /// Termination events are delivered to every live component even after a
    /// failure, and the voices synchronize one last time unless an error
    /// occurred.
    pub fn close(mut self) -> Report {
        self.shutdown();

        let mut environment = Environment::new(self.voice());
        let mut components = Vec::new();
        if let Some(system) = &self.system {
            environment.base_rate = system.base_rate();
            environment.stop_time = system.stop_time();
            environment.execution_stop = system.execution_stop();
            components = system.summaries();
            for c in &mut components {
                c.final_state = self.states.remove(&c.name);
            }
        }
        environment.workers = self.workers.as_ref().map(|w| w.len()).unwrap_or(0);

        let mut threads = vec![thread_report(&self.caller)];
        if let Some(workers) = &self.workers {
            threads.extend(workers.threads().map(thread_report));
        }
        threads.extend(self.comms.threads().map(thread_report));

        Report::new(
            environment,
            threads,
            components,
            self.errors.errors(),
            self.started.elapsed(),
        )
    }

    fn init_phase(&mut self, builder: SystemBuilder) -> Result<(), Error> {
        let mut system = builder.build(self.comms.voice())?;
        let assignment = assign_threads(&system.placements(), self.params.max_threads);
        system.set_workers(&assignment.worker_of)?;
        self.system = Some(system);
        self.workers = Some(Workers::new(assignment.threads, &self.params)?);

        self.fire(CommonEvent::ModuleCreate, true)?;
        self.fire(CommonEvent::StateSet, true)?;
        self.fire(CommonEvent::InitPreconnect, false)?;

        let (system, workers) = open_parts(&mut self.system, &self.workers)?;
        let timeout = self.params.comms_timeout;
        system.connect(&self.comms, workers, timeout)?;
        let base = negotiate_base_rate(&self.comms, &system.rates(), timeout)?;
        system.set_timing(base)?;
        system.build_rings(&self.comms)?;

        self.fire(CommonEvent::InitPostconnect, false)?;
        self.comms.synchronize(self.params.sync_timeout)
    }

    fn run_phase(&mut self, mut monitor: Option<&mut dyn Monitor>) -> Result<(), Error> {
        self.run_began = true;
        self.fire(CommonEvent::BeginRunPhase, false)?;

        let params = self.params.clone();
        let cancel = self.cancel.clone();
        let (system, workers) = open_parts(&mut self.system, &self.workers)?;
        let stop = system.execution_stop();
        let loops = system
            .service_plans(workers.len(), &self.comms, params.stream_buffers)?
            .into_iter()
            .map(|plans| {
                let runner = Runner::new(plans, stop, cancel.clone());
                Box::new(move |cx: &mut ThreadContext| runner.run(cx)) as RunLoop
            })
            .collect();
        workers.run(loops, &cancel)?;

        let start = Instant::now();
        let poll = AdaptiveInterval::new(params.poll_interval_min, params.poll_interval_max);
        let reports =
            AdaptiveInterval::new(params.monitor_interval_min, params.monitor_interval_max);
        let mut next_report = start;

        loop {
            spin_sleep::sleep(poll.at(start.elapsed()));

            if let Some(e) = self.comms.abort_error() {
                return Err(self.abort_run(Some(e)));
            }
            if cancel.is_cancelled() {
                let e = Error::new(ErrorCode::Cancelled, "execution cancelled");
                return Err(self.abort_run(Some(e)));
            }
            let (system, workers) = open_parts(&mut self.system, &self.workers)?;
            if workers.run_failed() {
                return Err(self.abort_run(None));
            }

            if let Some(monitor) = monitor.as_deref_mut() {
                let now = Instant::now();
                if now >= next_report {
                    let elapsed = now - start;
                    let progress = Progress {
                        fraction: system.progress(),
                        elapsed,
                    };
                    if monitor.progress(progress) == MonitorControl::Cancel {
                        tracing::info!("execution cancelled by the monitor");
                        cancel.cancel();
                        continue;
                    }
                    next_report = now + reports.at(elapsed);
                }
            }

            match workers.run_phase_status(params.thread_hang_timeout) {
                RunStatus::Active => {}
                RunStatus::Finished if workers.run_failed() => return Err(self.abort_run(None)),
                RunStatus::Finished => break,
                RunStatus::Hung(id) => {
                    let e = Error::new(
                        ErrorCode::ThreadHung,
                        format!(
                            "worker thread {} gave no sign of life for {:?}",
                            id, params.thread_hang_timeout
                        ),
                    );
                    return Err(self.abort_run(Some(e)));
                }
            }
        }
        tracing::info!(
            "run phase completed in {:.3} s",
            start.elapsed().as_secs_f64()
        );

        Ok(())
    }

    /// Stops the run loops after a failure and returns the primary error.
    ///
    /// Without an explicit error, the first run loop error that is not an
    /// interrupted wait or a cancellation is the primary one. Other run loop
    /// errors are recorded, except cancellations.
    fn abort_run(&mut self, primary: Option<Error>) -> Error {
        self.cancel.cancel();
        let Ok((system, workers)) = open_parts(&mut self.system, &self.workers) else {
            return primary.unwrap_or_else(|| Error::new(ErrorCode::Internal, "run aborted"));
        };
        system.abort_rings();

        let deadline = Instant::now() + self.params.thread_term_timeout;
        while workers.run_phase_status(self.params.thread_hang_timeout) == RunStatus::Active
            && Instant::now() < deadline
        {
            spin_sleep::sleep(UNWIND_STEP);
        }

        let mut errors = workers.take_run_errors();
        let primary = match primary {
            Some(e) => e,
            None => {
                // Interrupted waits and cancellations only echo the abort.
                let echo = |e: &Error| {
                    matches!(e.code(), ErrorCode::Cancelled | ErrorCode::ThreadError)
                };
                match errors.iter().position(|e| !echo(e)) {
                    Some(i) => errors.remove(i),
                    None if !errors.is_empty() => errors.remove(0),
                    None => Error::new(ErrorCode::Internal, "run aborted"),
                }
            }
        };
        for e in errors {
            if e.code() != ErrorCode::Cancelled {
                self.errors.push(e);
            }
        }

        primary
    }

    /// Records an error and informs the peers, unless it came from them.
    fn fail(&mut self, error: Error) -> Error {
        tracing::error!("{}", error);
        self.stage = Stage::Failed;
        if self.comms.abort_error().is_none() {
            self.comms.notify_abort(&error);
        }
        self.errors.push(error.clone());

        error
    }

    /// Delivers a lifecycle event.
    ///
    /// Returns the first error; further errors are recorded.
    fn fire(&mut self, event: CommonEvent, with_utilities: bool) -> Result<(), Error> {
        let mut errors = self.fire_collect(event, with_utilities).into_iter();
        match errors.next() {
            Some(first) => {
                for e in errors {
                    self.errors.push(e);
                }
                Err(first)
            }
            None => Ok(()),
        }
    }

    /// Delivers a lifecycle event and returns all errors.
    fn fire_collect(&mut self, event: CommonEvent, with_utilities: bool) -> Vec<Error> {
        let (system, workers) = match (&self.system, &self.workers) {
            (Some(system), Some(workers)) => (system, workers),
            _ => return Vec::new(),
        };
        tracing::debug!("firing {:?}", event);

        let targets = system.targets(with_utilities, event != CommonEvent::ModuleCreate);
        let mut errors = Vec::new();
        for (key, reply) in workers.fire_common_event(event, &targets) {
            match reply {
                Ok(EventReply::State(state)) => {
                    if let Some(name) = system.component_name(key) {
                        self.states.insert(name.to_owned(), state);
                    }
                }
                Ok(EventReply::Done) => {}
                Err(e) => errors.push(e),
            }
        }

        errors
    }

    /// Best-effort termination; runs once.
    fn shutdown(&mut self) {
        if self.stage == Stage::Closed {
            return;
        }
        tracing::info!(voice = self.voice().index, "termination phase");

        self.caller_cx.begin_phase(Phase::Term);
        if let Some(system) = &self.system {
            system.abort_rings();
        }
        let mut events = Vec::new();
        if self.run_began {
            events.push((CommonEvent::EndRunPhase, false));
        }
        events.extend([
            (CommonEvent::BeginTermPhase, false),
            (CommonEvent::StateGet, true),
            (CommonEvent::ModuleDestroy, true),
        ]);
        for (event, with_utilities) in events {
            for e in self.fire_collect(event, with_utilities) {
                self.errors.push(e);
            }
        }
        if let Some(workers) = &mut self.workers {
            workers.terminate();
        }
        self.caller_cx.end_phase();

        if self.errors.is_empty() && self.comms.abort_error().is_none() {
            if let Err(e) = self.comms.synchronize(self.params.sync_timeout) {
                self.errors.push(e);
            }
        }
        self.comms.close();
        self.stage = Stage::Closed;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("voice", &self.comms.voice())
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

fn open_parts<'a>(
    system: &'a mut Option<System>,
    workers: &'a Option<Workers>,
) -> Result<(&'a mut System, &'a Workers), Error> {
    match (system, workers) {
        (Some(system), Some(workers)) => Ok((system, workers)),
        _ => Err(Error::new(ErrorCode::Internal, "no system is open")),
    }
}

fn thread_report(thread: &Thread) -> ThreadReport {
    ThreadReport {
        id: thread.id(),
        state: thread.state(),
        hung: thread.is_hung(),
        timing: thread.timing(),
    }
}
