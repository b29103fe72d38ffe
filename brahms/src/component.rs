//! Component model.
//!
//! # Components
//!
//! Components are the user-provided building blocks of a system. They
//! implement the [`Component`] trait, whose single method receives every
//! lifecycle [`Event`] along with a [`Context`] describing the component.
//! Processes receive the complete event sequence:
//!
//! ```text
//! ModuleCreate ─► StateSet ─► InitPreconnect ─► InitConnect (×n) ─► InitPostconnect
//!      ─► BeginRunPhase ─► RunService (×m) ─► EndRunPhase
//!      ─► BeginTermPhase ─► StateGet ─► ModuleDestroy
//! ```
//!
//! Utilities only receive `ModuleCreate`, `StateSet`, `StateGet` and
//! `ModuleDestroy`.
//!
//! During the connect phase, a process inspects the inputs connected so far
//! and creates its outputs through the [`Connect`] handle. `InitConnect` is
//! fired once at first and then again each time new inputs were attached,
//! until all inputs are connected. During the run phase, a process reads its
//! inputs and writes its outputs through the [`Service`] handle.
//!
//! # Examples
//!
//! A process that doubles the 8-byte integer read on its input:
//!
//! ```
//! use brahms::component::{Component, Context, Event, EventReply};
//! use brahms::error::Error;
//! use brahms::ports::DataSpec;
//!
//! struct Doubler;
//!
//! impl Component for Doubler {
//!     fn event(&mut self, event: Event<'_>, _cx: &mut Context) -> Result<EventReply, Error> {
//!         match event {
//!             Event::InitConnect(mut connect) => {
//!                 if connect.input("in").is_some() && !connect.has_output("out") {
//!                     connect.create_output("out", DataSpec::new("std/u64", 8))?;
//!                 }
//!             }
//!             Event::RunService(mut service) => {
//!                 let mut bytes = [0u8; 8];
//!                 bytes.copy_from_slice(service.input(0)?);
//!                 let value = u64::from_le_bytes(bytes) * 2;
//!                 service.write_output(0, &value.to_le_bytes())?;
//!             }
//!             _ => {}
//!         }
//!
//!         Ok(EventReply::Done)
//!     }
//! }
//! ```

use std::fmt;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::params::VoiceIndex;
use crate::ports::{DataSpec, ReadGuard, WriteGuard};
use crate::thread::Phase;
use crate::time::{ComponentTime, SampleRate};

/// A component of a system.
pub trait Component: Send + 'static {
    /// Handles a lifecycle event.
    fn event(&mut self, event: Event<'_>, cx: &mut Context) -> Result<EventReply, Error>;
}

/// A lifecycle event.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event<'a> {
    /// The component was instantiated.
    ModuleCreate,
    /// The initial state of the component, as stored in the system
    /// description.
    StateSet(&'a [u8]),
    /// Sample rates are known; inputs are not connected yet.
    InitPreconnect,
    /// Inputs were connected; outputs may be created.
    InitConnect(Connect<'a>),
    /// All connections are established and timing is known.
    InitPostconnect,
    /// The run phase starts.
    BeginRunPhase,
    /// One sample period of the process.
    RunService(Service<'a>),
    /// The run phase ended.
    EndRunPhase,
    /// Termination starts.
    BeginTermPhase,
    /// Request for the final state, returned as [`EventReply::State`].
    StateGet,
    /// The component is about to be dropped.
    ModuleDestroy,
}

impl Event<'_> {
    /// Returns the name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModuleCreate => "ModuleCreate",
            Self::StateSet(_) => "StateSet",
            Self::InitPreconnect => "InitPreconnect",
            Self::InitConnect(_) => "InitConnect",
            Self::InitPostconnect => "InitPostconnect",
            Self::BeginRunPhase => "BeginRunPhase",
            Self::RunService(_) => "RunService",
            Self::EndRunPhase => "EndRunPhase",
            Self::BeginTermPhase => "BeginTermPhase",
            Self::StateGet => "StateGet",
            Self::ModuleDestroy => "ModuleDestroy",
        }
    }
}

/// Reply of a component to an event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EventReply {
    /// The event was handled.
    #[default]
    Done,
    /// The final state of the component, in reply to [`Event::StateGet`].
    State(Vec<u8>),
}

/// Module flags declared by a component class.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModuleFlags(u32);

impl ModuleFlags {
    /// No flag.
    pub const NONE: Self = Self(0);
    /// Instances of the class must not run concurrently with each other; they
    /// are all assigned to the same worker thread.
    pub const NO_CONCURRENCY: Self = Self(1);
    /// Every event of an instance must be handled on its worker thread.
    pub const NO_THREAD_CHANGE: Self = Self(2);

    /// Returns `true` if all flags of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ModuleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ModuleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::NO_CONCURRENCY) {
            names.push("NO_CONCURRENCY");
        }
        if self.contains(Self::NO_THREAD_CHANGE) {
            names.push("NO_THREAD_CHANGE");
        }
        write!(f, "ModuleFlags({})", names.join(" | "))
    }
}

/// Per-component information available to every event handler.
pub struct Context {
    name: Arc<str>,
    class: Arc<str>,
    voice: VoiceIndex,
    time: Option<ComponentTime>,
    log: Vec<String>,
}

impl Context {
    pub(crate) fn new(name: Arc<str>, class: Arc<str>, voice: VoiceIndex) -> Self {
        Self {
            name,
            class,
            voice,
            time: None,
            log: Vec::new(),
        }
    }

    /// Returns the name of the component instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the class of the component.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the voice running the component.
    pub fn voice(&self) -> VoiceIndex {
        self.voice
    }

    /// Returns the timing of a process, once the base rate is negotiated.
    pub fn time(&self) -> Option<&ComponentTime> {
        self.time.as_ref()
    }

    /// Appends a line to the component log included in the execution
    /// report.
    pub fn log(&mut self, message: impl Into<String>) {
        self.log.push(message.into());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

/// Description of a connected input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputInfo {
    pub(crate) name: String,
    pub(crate) source: String,
    pub(crate) spec: DataSpec,
    pub(crate) sample_rate: SampleRate,
    pub(crate) lag: u64,
}

impl InputInfo {
    /// Returns the name of the input port.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the source of the input as `process>>port`.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the description of the input data.
    pub fn spec(&self) -> &DataSpec {
        &self.spec
    }

    /// Returns the sample rate of the input data.
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Returns the lag of the input, in source samples.
    pub fn lag(&self) -> u64 {
        self.lag
    }
}

/// Connect-phase handle of a process.
pub struct Connect<'a> {
    inputs: &'a [InputInfo],
    outputs: &'a mut Vec<(String, DataSpec)>,
}

impl<'a> Connect<'a> {
    pub(crate) fn new(inputs: &'a [InputInfo], outputs: &'a mut Vec<(String, DataSpec)>) -> Self {
        Self { inputs, outputs }
    }

    /// Returns the inputs connected so far.
    pub fn inputs(&self) -> &[InputInfo] {
        self.inputs
    }

    /// Returns a connected input by port name.
    pub fn input(&self, name: &str) -> Option<&InputInfo> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Returns `true` if an output with this name was created.
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|(n, _)| n == name)
    }

    /// Creates an output port.
    ///
    /// Creating two outputs with the same name is `E_NOT_COMPLIANT`.
    pub fn create_output(&mut self, name: impl Into<String>, spec: DataSpec) -> Result<(), Error> {
        let name = name.into();
        if self.has_output(&name) {
            return Err(Error::new(
                ErrorCode::NotCompliant,
                format!("output '{}' created twice", name),
            ));
        }
        self.outputs.push((name, spec));

        Ok(())
    }
}

impl fmt::Debug for Connect<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// A locked input sample.
pub(crate) struct InputSlot {
    pub(crate) name: Arc<str>,
    pub(crate) guard: ReadGuard,
}

/// A locked output sample.
pub(crate) struct OutputSlot {
    pub(crate) name: Arc<str>,
    pub(crate) guard: WriteGuard,
}

/// Run-phase handle of a process.
///
/// Inputs and outputs are addressed by index, in the order in which the
/// inputs were connected and the outputs created, or by name.
pub struct Service<'a> {
    time: &'a ComponentTime,
    inputs: &'a [InputSlot],
    outputs: &'a mut [OutputSlot],
}

impl<'a> Service<'a> {
    pub(crate) fn new(
        time: &'a ComponentTime,
        inputs: &'a [InputSlot],
        outputs: &'a mut [OutputSlot],
    ) -> Self {
        Self {
            time,
            inputs,
            outputs,
        }
    }

    /// Returns the timing of the process at this service.
    pub fn time(&self) -> &ComponentTime {
        self.time
    }

    /// Returns the number of inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Returns the number of outputs.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Returns the sample of an input.
    pub fn input(&self, index: usize) -> Result<&[u8], Error> {
        self.inputs
            .get(index)
            .map(|slot| slot.guard.bytes())
            .ok_or_else(|| no_such_port("input", index))
    }

    /// Returns the sample of an input by port name.
    pub fn input_by_name(&self, name: &str) -> Result<&[u8], Error> {
        self.inputs
            .iter()
            .find(|slot| &*slot.name == name)
            .map(|slot| slot.guard.bytes())
            .ok_or_else(|| no_such_name("input", name))
    }

    /// Returns the writer sample index read on an input.
    pub fn input_sample(&self, index: usize) -> Result<i64, Error> {
        self.inputs
            .get(index)
            .map(|slot| slot.guard.sample())
            .ok_or_else(|| no_such_port("input", index))
    }

    /// Returns the sample of an output for in-place writing.
    pub fn output(&mut self, index: usize) -> Result<&mut [u8], Error> {
        self.outputs
            .get_mut(index)
            .map(|slot| slot.guard.bytes_mut())
            .ok_or_else(|| no_such_port("output", index))
    }

    /// Returns the index of an output by port name.
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|slot| &*slot.name == name)
    }

    /// Writes a whole output sample.
    ///
    /// The length must match the sample size of the output, or the write is
    /// `E_NOT_COMPLIANT`.
    pub fn write_output(&mut self, index: usize, data: &[u8]) -> Result<(), Error> {
        self.outputs
            .get_mut(index)
            .ok_or_else(|| no_such_port("output", index))?
            .guard
            .write(data)
    }
}

impl fmt::Debug for Service<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("now", &self.time.now)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

fn no_such_port(kind: &str, index: usize) -> Error {
    Error::new(ErrorCode::InvalidArg, format!("no {} with index {}", kind, index))
}

fn no_such_name(kind: &str, name: &str) -> Error {
    Error::new(ErrorCode::InvalidArg, format!("no {} named '{}'", kind, name))
}

/// A factory instantiating a component.
pub(crate) type Factory = Box<dyn FnOnce() -> Box<dyn Component> + Send>;

/// Event fired on every component at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommonEvent {
    ModuleCreate,
    StateSet,
    InitPreconnect,
    InitPostconnect,
    BeginRunPhase,
    EndRunPhase,
    BeginTermPhase,
    StateGet,
    ModuleDestroy,
}

impl CommonEvent {
    /// Returns `true` if the event is delivered to every worker at once
    /// rather than one component at a time.
    pub(crate) fn is_parallel(self) -> bool {
        matches!(self, Self::EndRunPhase | Self::StateGet | Self::ModuleDestroy)
    }

    pub(crate) fn phase(self) -> Phase {
        match self {
            Self::ModuleCreate | Self::StateSet | Self::InitPreconnect | Self::InitPostconnect => {
                Phase::Init
            }
            Self::BeginRunPhase | Self::EndRunPhase => Phase::Run,
            Self::BeginTermPhase | Self::StateGet | Self::ModuleDestroy => Phase::Term,
        }
    }
}

enum Instance {
    Pending(Factory),
    Live(Box<dyn Component>),
    Destroyed,
}

/// Wallclock time spent by a component in each phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ComponentTiming {
    pub(crate) init: Duration,
    pub(crate) run: Duration,
    pub(crate) term: Duration,
    pub(crate) services: u64,
}

/// A component instance together with its context.
pub(crate) struct ComponentCell {
    instance: Instance,
    cx: Context,
    state: Vec<u8>,
    timing: ComponentTiming,
}

impl ComponentCell {
    pub(crate) fn new(cx: Context, factory: Factory, state: Vec<u8>) -> Self {
        Self {
            instance: Instance::Pending(factory),
            cx,
            state,
            timing: ComponentTiming::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.cx.name()
    }

    /// Tells whether the component was created and not yet destroyed.
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.instance, Instance::Live(_))
    }

    pub(crate) fn set_time(&mut self, time: ComponentTime) {
        self.cx.time = Some(time);
    }

    pub(crate) fn time(&self) -> Option<ComponentTime> {
        self.cx.time
    }

    pub(crate) fn timing(&self) -> ComponentTiming {
        self.timing
    }

    pub(crate) fn log(&self) -> &[String] {
        &self.cx.log
    }

    /// Fires an event, accounting its duration to `phase`.
    pub(crate) fn fire(&mut self, event: Event<'_>, phase: Phase) -> Result<EventReply, Error> {
        let name = event.name();
        let component = match &mut self.instance {
            Instance::Live(component) => component,
            _ => {
                return Err(Error::new(
                    ErrorCode::Internal,
                    format!("{} fired on '{}' which is not instantiated", name, self.cx.name),
                ))
            }
        };

        let start = Instant::now();
        let cx = &mut self.cx;
        let reply = panic::catch_unwind(AssertUnwindSafe(|| component.event(event, cx)))
            .unwrap_or_else(|payload| Err(panicked(&self.cx, payload.as_ref())));
        let elapsed = start.elapsed();
        match phase {
            Phase::Init => self.timing.init += elapsed,
            Phase::Run => self.timing.run += elapsed,
            Phase::Term => self.timing.term += elapsed,
        }

        reply.map_err(|e| e.trace(format!("in {} of '{}'", name, self.name())))
    }

    /// Fires a service event and advances the component's time.
    pub(crate) fn fire_service(
        &mut self,
        now: u64,
        inputs: &[InputSlot],
        outputs: &mut [OutputSlot],
    ) -> Result<(), Error> {
        let mut time = self.cx.time.ok_or_else(|| {
            Error::new(
                ErrorCode::Internal,
                format!("'{}' serviced before its timing was set", self.cx.name),
            )
        })?;
        time.now = now;
        self.cx.time = Some(time);
        self.timing.services += 1;

        self.fire(
            Event::RunService(Service::new(&time, inputs, outputs)),
            Phase::Run,
        )
        .map(|_| ())
    }

    pub(crate) fn fire_connect(
        &mut self,
        inputs: &[InputInfo],
        outputs: &mut Vec<(String, DataSpec)>,
    ) -> Result<(), Error> {
        self.fire(Event::InitConnect(Connect::new(inputs, outputs)), Phase::Init)
            .map(|_| ())
    }

    pub(crate) fn fire_common(&mut self, event: CommonEvent) -> Result<EventReply, Error> {
        let phase = event.phase();
        match event {
            CommonEvent::ModuleCreate => {
                match std::mem::replace(&mut self.instance, Instance::Destroyed) {
                    Instance::Pending(factory) => {
                        match panic::catch_unwind(AssertUnwindSafe(factory)) {
                            Ok(component) => self.instance = Instance::Live(component),
                            Err(payload) => {
                                return Err(panicked(&self.cx, payload.as_ref())
                                    .trace(format!("in the factory of '{}'", self.name())))
                            }
                        }
                    }
                    other => {
                        self.instance = other;
                        return Err(Error::new(
                            ErrorCode::Internal,
                            format!("'{}' created twice", self.cx.name),
                        ));
                    }
                }
                self.fire(Event::ModuleCreate, phase)
            }
            CommonEvent::StateSet => {
                let state = std::mem::take(&mut self.state);
                let reply = self.fire(Event::StateSet(&state), phase);
                self.state = state;
                reply
            }
            CommonEvent::InitPreconnect => self.fire(Event::InitPreconnect, phase),
            CommonEvent::InitPostconnect => self.fire(Event::InitPostconnect, phase),
            CommonEvent::BeginRunPhase => self.fire(Event::BeginRunPhase, phase),
            CommonEvent::EndRunPhase => self.fire(Event::EndRunPhase, phase),
            CommonEvent::BeginTermPhase => self.fire(Event::BeginTermPhase, phase),
            CommonEvent::StateGet => self.fire(Event::StateGet, phase),
            CommonEvent::ModuleDestroy => {
                let reply = self.fire(Event::ModuleDestroy, phase);
                self.instance = Instance::Destroyed;
                reply
            }
        }
    }
}

/// Turns a panic escaping a component into a component error.
fn panicked(cx: &Context, payload: &(dyn std::any::Any + Send)) -> Error {
    let message = crate::thread::panic_payload_message(payload);
    tracing::error!("'{}' ({}) panicked: {}", cx.name(), cx.class(), message);

    Error::component(message)
}

impl fmt::Debug for ComponentCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCell")
            .field("name", &self.cx.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<&'static str>,
        state: Vec<u8>,
    }

    impl Component for Recorder {
        fn event(&mut self, event: Event<'_>, cx: &mut Context) -> Result<EventReply, Error> {
            self.events.push(event.name());
            match event {
                Event::StateSet(state) => self.state = state.to_vec(),
                Event::StateGet => {
                    cx.log(format!("{} events", self.events.len()));
                    return Ok(EventReply::State(self.state.clone()));
                }
                Event::InitPreconnect => return Err(Error::component("not ready")),
                _ => {}
            }

            Ok(EventReply::Done)
        }
    }

    fn cell() -> ComponentCell {
        let cx = Context::new("rec".into(), "test/recorder".into(), 0);
        ComponentCell::new(cx, Box::new(|| Box::new(Recorder::default())), vec![1, 2, 3])
    }

    #[test]
    fn lifecycle_through_cell() {
        let mut cell = cell();
        assert_eq!(
            cell.fire_common(CommonEvent::StateSet).unwrap_err().code(),
            ErrorCode::Internal
        );

        cell.fire_common(CommonEvent::ModuleCreate).unwrap();
        cell.fire_common(CommonEvent::StateSet).unwrap();
        assert_eq!(
            cell.fire_common(CommonEvent::StateGet).unwrap(),
            EventReply::State(vec![1, 2, 3])
        );
        assert_eq!(cell.log(), &["3 events".to_string()]);

        cell.fire_common(CommonEvent::ModuleDestroy).unwrap();
        assert!(cell.fire_common(CommonEvent::StateGet).is_err());
        assert!(cell.fire_common(CommonEvent::ModuleCreate).is_err());
    }

    #[test]
    fn component_errors_are_traced() {
        let mut cell = cell();
        cell.fire_common(CommonEvent::ModuleCreate).unwrap();

        let err = cell.fire_common(CommonEvent::InitPreconnect).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Component);
        assert_eq!(err.trace_lines(), &["in InitPreconnect of 'rec'".to_string()]);
    }

    struct Fragile;

    impl Component for Fragile {
        fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
            match event {
                Event::BeginRunPhase => panic!("division by zero"),
                Event::StateGet => Ok(EventReply::State(vec![7])),
                _ => Ok(EventReply::Done),
            }
        }
    }

    #[test]
    fn panics_become_component_errors() {
        let cx = Context::new("fragile".into(), "test/fragile".into(), 0);
        let mut cell = ComponentCell::new(cx, Box::new(|| Box::new(Fragile)), Vec::new());
        cell.fire_common(CommonEvent::ModuleCreate).unwrap();

        let err = cell.fire_common(CommonEvent::BeginRunPhase).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Component);
        assert_eq!(err.message(), "division by zero");
        assert_eq!(err.trace_lines(), &["in BeginRunPhase of 'fragile'".to_string()]);

        // The cell is still usable after the panic.
        assert_eq!(
            cell.fire_common(CommonEvent::StateGet).unwrap(),
            EventReply::State(vec![7])
        );

        let cx = Context::new("broken".into(), "test/broken".into(), 0);
        let factory: Factory = Box::new(|| -> Box<dyn Component> { panic!("no such device") });
        let mut cell = ComponentCell::new(cx, factory, Vec::new());
        let err = cell.fire_common(CommonEvent::ModuleCreate).unwrap_err();
        assert_eq!(err.message(), "no such device");
        assert!(!cell.is_live());
    }

    #[test]
    fn outputs_are_unique() {
        let inputs = [];
        let mut outputs = Vec::new();
        let mut connect = Connect::new(&inputs, &mut outputs);
        connect.create_output("out", DataSpec::new("std/u64", 8)).unwrap();
        assert!(connect.has_output("out"));
        assert_eq!(
            connect
                .create_output("out", DataSpec::new("std/u64", 8))
                .unwrap_err()
                .code(),
            ErrorCode::NotCompliant
        );
    }

    #[test]
    fn flags() {
        let flags = ModuleFlags::NO_CONCURRENCY | ModuleFlags::NO_THREAD_CHANGE;
        assert!(flags.contains(ModuleFlags::NO_CONCURRENCY));
        assert!(!ModuleFlags::NONE.contains(ModuleFlags::NO_THREAD_CHANGE));
    }
}
