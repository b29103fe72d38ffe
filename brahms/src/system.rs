//! System description.
//!
//! A system is a graph of processes connected by links, plus utilities
//! which take no part in the data flow. It is described programmatically
//! with a [`SystemBuilder`] and handed to
//! [`Engine::open`](crate::engine::Engine::open), which validates it and
//! instantiates the components assigned to the local voice.
//!
//! Ports are named `process>>port` for outputs and `process<<port` for
//! inputs. Outputs do not need to be declared: processes create them during
//! the connect phase, possibly depending on the inputs connected to them, and
//! a link is resolved once its source output exists. Every voice of an
//! execution must be given the same description.
//!
//! # Examples
//!
//! ```
//! use brahms::component::{Component, Context, Event, EventReply};
//! use brahms::error::Error;
//! use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
//! use brahms::time::SampleRate;
//!
//! struct Idle;
//!
//! impl Component for Idle {
//!     fn event(&mut self, _: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
//!         Ok(EventReply::Done)
//!     }
//! }
//!
//! let rate = SampleRate::hz(100)?;
//! let system = SystemBuilder::new()
//!     .stop_time(1.0)
//!     .add_process(ProcessSpec::new("src", "demo/idle", rate, || Idle))
//!     .add_process(ProcessSpec::new("dst", "demo/idle", rate, || Idle).voice(1))
//!     .link(LinkSpec::new("src>>out", "dst<<in").lag(2));
//! # let _ = system;
//! # Ok::<(), Error>(())
//! ```

mod connect;
mod rate;

pub(crate) use rate::negotiate_base_rate;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::comms::Comms;
use crate::component::{Component, ComponentCell, Context, Factory, InputInfo, ModuleFlags};
use crate::engine::report::{ComponentKind, ComponentReport};
use crate::engine::runner::{InputPlan, OutputPlan, ServicePlan};
use crate::error::{Error, ErrorCode};
use crate::params::{VoiceConfig, VoiceIndex};
use crate::ports::{DataSpec, ReaderId, Ring, RingBuilder};
use crate::registry::{Handle, Registry};
use crate::thread::workers::{EventTarget, Placement};
use crate::time::{ComponentTime, SampleRate};

/// Description of a process.
pub struct ProcessSpec {
    name: String,
    class: String,
    rate: SampleRate,
    voice: VoiceIndex,
    flags: ModuleFlags,
    thread: Option<usize>,
    state: Vec<u8>,
    factory: Factory,
}

impl ProcessSpec {
    /// Describes a process of class `class` sampled at `rate`, instantiated
    /// by `factory` on the voice that runs it.
    pub fn new<F, C>(
        name: impl Into<String>,
        class: impl Into<String>,
        rate: SampleRate,
        factory: F,
    ) -> Self
    where
        F: FnOnce() -> C + Send + 'static,
        C: Component,
    {
        Self {
            name: name.into(),
            class: class.into(),
            rate,
            voice: 0,
            flags: ModuleFlags::NONE,
            thread: None,
            state: Vec::new(),
            factory: Box::new(move || Box::new(factory()) as Box<dyn Component>),
        }
    }

    /// Assigns the process to a voice (0 by default).
    pub fn voice(mut self, voice: VoiceIndex) -> Self {
        self.voice = voice;
        self
    }

    /// Sets the module flags of the process class.
    pub fn flags(mut self, flags: ModuleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Requests a worker thread, taken modulo the number of threads.
    pub fn thread(mut self, thread: usize) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Sets the initial state delivered with `StateSet`.
    pub fn state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = state.into();
        self
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("rate", &self.rate)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

/// Description of a utility.
///
/// Utilities only receive the `ModuleCreate`, `StateSet`, `StateGet` and
/// `ModuleDestroy` events.
pub struct UtilitySpec {
    name: String,
    class: String,
    voice: VoiceIndex,
    state: Vec<u8>,
    factory: Factory,
}

impl UtilitySpec {
    /// Describes a utility of class `class`.
    pub fn new<F, C>(name: impl Into<String>, class: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> C + Send + 'static,
        C: Component,
    {
        Self {
            name: name.into(),
            class: class.into(),
            voice: 0,
            state: Vec::new(),
            factory: Box::new(move || Box::new(factory()) as Box<dyn Component>),
        }
    }

    /// Assigns the utility to a voice (0 by default).
    pub fn voice(mut self, voice: VoiceIndex) -> Self {
        self.voice = voice;
        self
    }

    /// Sets the initial state delivered with `StateSet`.
    pub fn state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = state.into();
        self
    }
}

impl fmt::Debug for UtilitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilitySpec")
            .field("name", &self.name)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// Description of a link from an output to an input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSpec {
    src: String,
    dst: String,
    lag: u64,
}

impl LinkSpec {
    /// Links output `src` (`process>>port`) to input `dst`
    /// (`process<<port`), with a lag of 1 sample.
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            lag: 1,
        }
    }

    /// Sets the lag, in samples of the source. The lag must be at least 1.
    pub fn lag(mut self, lag: u64) -> Self {
        self.lag = lag;
        self
    }
}

/// Builder of a system description.
#[derive(Debug, Default)]
pub struct SystemBuilder {
    stop_time: f64,
    processes: Vec<ProcessSpec>,
    utilities: Vec<UtilitySpec>,
    links: Vec<LinkSpec>,
}

impl SystemBuilder {
    /// Creates an empty description stopping after one second.
    pub fn new() -> Self {
        Self {
            stop_time: 1.0,
            ..Self::default()
        }
    }

    /// Sets the execution stop time in seconds.
    pub fn stop_time(mut self, seconds: f64) -> Self {
        self.stop_time = seconds;
        self
    }

    /// Adds a process.
    pub fn add_process(mut self, process: ProcessSpec) -> Self {
        self.processes.push(process);
        self
    }

    /// Adds a utility.
    pub fn add_utility(mut self, utility: UtilitySpec) -> Self {
        self.utilities.push(utility);
        self
    }

    /// Adds a link.
    pub fn link(mut self, link: LinkSpec) -> Self {
        self.links.push(link);
        self
    }

    /// Validates the description and instantiates the components of the
    /// local voice.
    pub(crate) fn build(self, voice: VoiceConfig) -> Result<System, Error> {
        if !self.stop_time.is_finite() || self.stop_time <= 0.0 {
            return Err(invalid(format!(
                "stop time must be a positive number of seconds, not {}",
                self.stop_time
            )));
        }

        if self.processes.is_empty() {
            return Err(invalid("the system has no process".to_owned()));
        }

        let mut process_voice = HashMap::new();
        let mut names = HashSet::new();
        for (name, v) in self
            .processes
            .iter()
            .map(|p| (&p.name, p.voice))
            .chain(self.utilities.iter().map(|u| (&u.name, u.voice)))
        {
            if name.is_empty() || name.contains(">>") || name.contains("<<") {
                return Err(invalid(format!("invalid component name '{}'", name)));
            }
            if !names.insert(name.clone()) {
                return Err(invalid(format!("component '{}' is declared twice", name)));
            }
            if v >= voice.count {
                return Err(invalid(format!(
                    "component '{}' is assigned to voice {} but there are only {} voices",
                    name, v, voice.count
                )));
            }
        }
        for p in &self.processes {
            process_voice.insert(p.name.clone(), p.voice);
        }

        let mut links = Vec::with_capacity(self.links.len());
        let mut inputs = HashSet::new();
        for (index, spec) in self.links.into_iter().enumerate() {
            let src = PortRef::parse(&spec.src, ">>")?;
            let dst = PortRef::parse(&spec.dst, "<<")?;
            let src_voice = *process_voice
                .get(&src.process)
                .ok_or_else(|| invalid(format!("link source '{}' is not a process", spec.src)))?;
            let dst_voice = *process_voice.get(&dst.process).ok_or_else(|| {
                invalid(format!("link destination '{}' is not a process", spec.dst))
            })?;
            if spec.lag < 1 {
                return Err(invalid(format!(
                    "link {} -> {} must have a lag of at least 1",
                    spec.src, spec.dst
                )));
            }
            if !inputs.insert(dst.clone()) {
                return Err(invalid(format!("input '{}' is linked twice", spec.dst)));
            }
            links.push(Link {
                src,
                dst,
                lag: spec.lag,
                stream: index as u32 + 1,
                src_voice,
                dst_voice,
                source: None,
                reader: None,
            });
        }

        let mut processes = Registry::new();
        let mut order = Vec::new();
        let mut by_name = HashMap::new();
        for p in self.processes.into_iter().filter(|p| p.voice == voice.index) {
            let name: Arc<str> = p.name.into();
            let class: Arc<str> = p.class.into();
            let cx = Context::new(name.clone(), class.clone(), voice.index);
            let handle = processes.insert(Process {
                name: name.clone(),
                class,
                rate: p.rate,
                flags: p.flags,
                hint: p.thread,
                worker: 0,
                cell: Arc::new(Mutex::new(ComponentCell::new(cx, p.factory, p.state))),
                inputs: Vec::new(),
                input_links: Vec::new(),
                outputs: Vec::new(),
                output_handles: Vec::new(),
                fired: false,
                now: Arc::new(AtomicU64::new(0)),
            });
            by_name.insert(name.to_string(), handle);
            order.push(handle);
        }

        let utilities = self
            .utilities
            .into_iter()
            .filter(|u| u.voice == voice.index)
            .map(|u| {
                let name: Arc<str> = u.name.into();
                let class: Arc<str> = u.class.into();
                let cx = Context::new(name.clone(), class.clone(), voice.index);
                Utility {
                    name,
                    class,
                    cell: Arc::new(Mutex::new(ComponentCell::new(cx, u.factory, u.state))),
                }
            })
            .collect();

        Ok(System {
            voice,
            stop_time: self.stop_time,
            processes,
            order,
            by_name,
            outputs: Registry::new(),
            output_index: HashMap::new(),
            utilities,
            links,
            base_rate: None,
            execution_stop: 0,
        })
    }
}

fn invalid(message: String) -> Error {
    Error::new(ErrorCode::InvalidArg, message)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PortRef {
    process: String,
    port: String,
}

impl PortRef {
    fn parse(s: &str, separator: &str) -> Result<Self, Error> {
        match s.split_once(separator) {
            Some((process, port)) if !process.is_empty() && !port.is_empty() => Ok(Self {
                process: process.to_owned(),
                port: port.to_owned(),
            }),
            _ => Err(invalid(format!(
                "'{}' is not a port of the form process{}port",
                s, separator
            ))),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process, self.port)
    }
}

pub(crate) struct Process {
    name: Arc<str>,
    class: Arc<str>,
    rate: SampleRate,
    flags: ModuleFlags,
    hint: Option<usize>,
    worker: usize,
    cell: Arc<Mutex<ComponentCell>>,
    inputs: Vec<InputInfo>,
    /// Link of each input, in the same order.
    input_links: Vec<usize>,
    outputs: Vec<(String, DataSpec)>,
    output_handles: Vec<Handle<Output>>,
    /// `InitConnect` was fired since the last input was attached.
    fired: bool,
    /// Base time up to which the process was serviced.
    now: Arc<AtomicU64>,
}

impl Process {
    fn pinned(&self) -> bool {
        self.flags.contains(ModuleFlags::NO_THREAD_CHANGE)
    }
}

pub(crate) struct Output {
    process: Arc<str>,
    port: Arc<str>,
    spec: DataSpec,
    rate: SampleRate,
    /// Remote subscribers as (voice, stream).
    remote: Vec<(VoiceIndex, u32)>,
    ring: Option<Arc<Ring>>,
}

struct Source {
    spec: DataSpec,
    rate: SampleRate,
    /// The output, if it lives on this voice.
    output: Option<Handle<Output>>,
}

struct Link {
    src: PortRef,
    dst: PortRef,
    lag: u64,
    /// Stream carrying the data of the link between voices; 0 is reserved
    /// for control messages.
    stream: u32,
    src_voice: VoiceIndex,
    dst_voice: VoiceIndex,
    source: Option<Source>,
    /// Ring and reader of the destination, once rings are built.
    reader: Option<(Arc<Ring>, ReaderId)>,
}

struct Utility {
    name: Arc<str>,
    class: Arc<str>,
    cell: Arc<Mutex<ComponentCell>>,
}

/// The local part of a validated system.
pub(crate) struct System {
    voice: VoiceConfig,
    stop_time: f64,
    processes: Registry<Process>,
    order: Vec<Handle<Process>>,
    by_name: HashMap<String, Handle<Process>>,
    outputs: Registry<Output>,
    output_index: HashMap<(String, String), Handle<Output>>,
    utilities: Vec<Utility>,
    links: Vec<Link>,
    base_rate: Option<SampleRate>,
    execution_stop: u64,
}

impl System {
    pub(crate) fn stop_time(&self) -> f64 {
        self.stop_time
    }

    pub(crate) fn base_rate(&self) -> Option<SampleRate> {
        self.base_rate
    }

    pub(crate) fn execution_stop(&self) -> u64 {
        self.execution_stop
    }

    /// Returns the placement constraints of the local processes.
    pub(crate) fn placements(&self) -> Vec<Placement<'_>> {
        self.order
            .iter()
            .filter_map(|&h| self.processes.get(h))
            .map(|p| Placement {
                class: &p.class,
                flags: p.flags,
                hint: p.hint,
            })
            .collect()
    }

    /// Records the worker of each local process.
    pub(crate) fn set_workers(&mut self, worker_of: &[usize]) -> Result<(), Error> {
        for (&h, &worker) in self.order.iter().zip(worker_of) {
            self.processes.resolve_mut(h)?.worker = worker;
        }

        Ok(())
    }

    /// Returns the targets of a common event.
    ///
    /// Keys index processes in declaration order, followed by utilities.
    /// Utilities are only included for the events they receive. With
    /// `live_only`, components that were not created or are currently
    /// locked by a hung thread are left out.
    pub(crate) fn targets(&self, with_utilities: bool, live_only: bool) -> Vec<EventTarget> {
        let is_live = |cell: &Arc<Mutex<ComponentCell>>| {
            !live_only
                || cell
                    .try_lock()
                    .map(|cell| cell.is_live())
                    .unwrap_or(false)
        };

        let mut targets: Vec<EventTarget> = self
            .order
            .iter()
            .filter_map(|&h| self.processes.get(h))
            .enumerate()
            .filter(|(_, p)| is_live(&p.cell))
            .map(|(key, p)| EventTarget {
                key,
                worker: Some(p.worker),
                pinned: p.pinned(),
                cell: p.cell.clone(),
            })
            .collect();
        if with_utilities {
            let base = self.order.len();
            targets.extend(
                self.utilities
                    .iter()
                    .enumerate()
                    .filter(|(_, u)| is_live(&u.cell))
                    .map(|(i, u)| EventTarget {
                        key: base + i,
                        worker: None,
                        pinned: false,
                        cell: u.cell.clone(),
                    }),
            );
        }

        targets
    }

    /// Returns the name of the component behind a target key.
    pub(crate) fn component_name(&self, key: usize) -> Option<&str> {
        match self.order.get(key) {
            Some(&h) => self.processes.get(h).map(|p| &*p.name),
            None => self
                .utilities
                .get(key - self.order.len())
                .map(|u| &*u.name),
        }
    }

    /// Returns the sample rates requested by the local processes and their
    /// outputs.
    pub(crate) fn rates(&self) -> Vec<SampleRate> {
        self.processes
            .iter()
            .map(|(_, p)| p.rate)
            .chain(self.outputs.iter().map(|(_, o)| o.rate))
            .collect()
    }

    /// Fans the base rate out to the local processes.
    pub(crate) fn set_timing(&mut self, base: SampleRate) -> Result<(), Error> {
        let stop = base.samples_in(self.stop_time)?;
        for &h in &self.order {
            let p = self.processes.resolve(h)?;
            let time = ComponentTime::new(base, p.rate, stop)
                .map_err(|e| e.trace(format!("timing of process '{}'", p.name)))?;
            p.cell.lock().unwrap().set_time(time);
        }
        self.base_rate = Some(base);
        self.execution_stop = stop;
        tracing::info!("base rate {} Hz, execution stops at base sample {}", base, stop);

        Ok(())
    }

    /// Builds the ring of every local output and the mirror ring of every
    /// link from a remote output.
    pub(crate) fn build_rings(&mut self, comms: &Comms) -> Result<(), Error> {
        let base = self.base_rate.ok_or_else(|| {
            Error::new(ErrorCode::Internal, "rings built before base rate negotiation")
        })?;
        let period_of = |processes: &Registry<Process>, name: &str| -> Result<u64, Error> {
            let h = *self.by_name.get(name).ok_or_else(|| {
                Error::new(ErrorCode::Internal, format!("unknown process '{}'", name))
            })?;
            base.period_of(processes.resolve(h)?.rate)
        };

        let mut builders: HashMap<Handle<Output>, (RingBuilder, Vec<(usize, ReaderId)>)> = self
            .outputs
            .iter()
            .map(|(h, o)| -> Result<_, Error> {
                let builder = RingBuilder::new(o.spec.sample_bytes(), base.period_of(o.rate)?);
                Ok((h, (builder, Vec::new())))
            })
            .collect::<Result<_, _>>()?;

        for (index, link) in self.links.iter_mut().enumerate() {
            if link.dst_voice != self.voice.index {
                continue;
            }
            let source = link.source.as_ref().ok_or_else(|| {
                Error::new(
                    ErrorCode::Internal,
                    format!("link to '{}' unresolved after the connect phase", link.dst),
                )
            })?;
            let reader_period = period_of(&self.processes, &link.dst.process)?;
            match source.output {
                Some(output) => {
                    let (builder, readers) = builders.get_mut(&output).ok_or_else(|| {
                        Error::new(ErrorCode::Internal, "link source output vanished")
                    })?;
                    readers.push((index, builder.add_reader(link.lag, reader_period)));
                }
                None => {
                    let mut builder = RingBuilder::new(
                        source.spec.sample_bytes(),
                        base.period_of(source.rate)?,
                    );
                    let reader = builder.add_reader(link.lag, reader_period);
                    let ring = builder.build();
                    comms.register_mirror(link.stream, ring.clone());
                    link.reader = Some((ring, reader));
                }
            }
        }

        for (h, (builder, readers)) in builders {
            let ring = builder.build();
            for (index, reader) in readers {
                self.links[index].reader = Some((ring.clone(), reader));
            }
            self.outputs.resolve_mut(h)?.ring = Some(ring);
        }

        Ok(())
    }

    /// Prepares the run loop of every local process, grouped by worker.
    pub(crate) fn service_plans(
        &self,
        workers: usize,
        comms: &Comms,
        stream_buffers: usize,
    ) -> Result<Vec<Vec<ServicePlan>>, Error> {
        let base = self.base_rate.ok_or_else(|| {
            Error::new(ErrorCode::Internal, "run phase started before base rate negotiation")
        })?;
        let mut plans: Vec<Vec<ServicePlan>> = (0..workers).map(|_| Vec::new()).collect();

        for &h in &self.order {
            let p = self.processes.resolve(h)?;
            let inputs = p
                .input_links
                .iter()
                .zip(&p.inputs)
                .map(|(&l, info)| {
                    let (ring, reader) = self.links[l].reader.clone().ok_or_else(|| {
                        Error::new(
                            ErrorCode::Internal,
                            format!("input '{}' of '{}' has no ring", info.name(), p.name),
                        )
                    })?;
                    Ok(InputPlan {
                        name: info.name().into(),
                        ring,
                        reader,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            let outputs = p
                .output_handles
                .iter()
                .map(|&oh| {
                    let o = self.outputs.resolve(oh)?;
                    let ring = o.ring.clone().ok_or_else(|| {
                        Error::new(
                            ErrorCode::Internal,
                            format!("output '{}' of '{}' has no ring", o.port, o.process),
                        )
                    })?;
                    let forwarder = (!o.remote.is_empty())
                        .then(|| comms.forwarder(o.remote.clone(), stream_buffers));
                    Ok(OutputPlan {
                        name: o.port.clone(),
                        ring,
                        forwarder,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;

            let worker = plans.get_mut(p.worker).ok_or_else(|| {
                Error::new(
                    ErrorCode::Internal,
                    format!("process '{}' assigned to missing worker {}", p.name, p.worker),
                )
            })?;
            worker.push(ServicePlan {
                name: p.name.clone(),
                cell: p.cell.clone(),
                period: base.period_of(p.rate)?,
                inputs,
                outputs,
                now: p.now.clone(),
            });
        }

        Ok(plans)
    }

    /// Returns the fraction of the execution completed by the slowest local
    /// process.
    pub(crate) fn progress(&self) -> f64 {
        if self.execution_stop == 0 {
            return 1.0;
        }

        self.processes
            .iter()
            .map(|(_, p)| p.now.load(Ordering::Relaxed))
            .min()
            .map(|now| (now as f64 / self.execution_stop as f64).min(1.0))
            .unwrap_or(1.0)
    }

    /// Makes every blocked ring wait fail.
    pub(crate) fn abort_rings(&self) {
        for (_, output) in self.outputs.iter() {
            if let Some(ring) = &output.ring {
                ring.abort();
            }
        }
        for link in &self.links {
            if let Some((ring, _)) = &link.reader {
                ring.abort();
            }
        }
    }

    /// Gathers timing and logs of every local component.
    ///
    /// Components locked by a hung thread are reported without details.
    pub(crate) fn summaries(&self) -> Vec<ComponentReport> {
        let summary = |name: &str, class: &str, kind, cell: &Mutex<ComponentCell>| {
            let mut report = ComponentReport::new(name, class, kind);
            if let Ok(cell) = cell.try_lock() {
                let timing = cell.timing();
                report.sample_rate = cell.time().map(|t| t.sample_rate);
                report.services = timing.services;
                report.init = timing.init;
                report.run = timing.run;
                report.term = timing.term;
                report.log = cell.log().to_vec();
            }
            report
        };

        self.order
            .iter()
            .filter_map(|&h| self.processes.get(h))
            .map(|p| summary(&p.name, &p.class, ComponentKind::Process, &p.cell))
            .chain(
                self.utilities
                    .iter()
                    .map(|u| summary(&u.name, &u.class, ComponentKind::Utility, &u.cell)),
            )
            .collect()
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("voice", &self.voice)
            .field("processes", &self.processes.len())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}
