//! A multi-threaded, multi-voice execution engine for sampled-time system
//! simulation.
//!
//! A simulated system is a graph of *components*: *processes*, which are
//! sampled at a fixed rate and exchange data through typed ports, and
//! *utilities*, which provide services to them. Each process runs at its own
//! sample rate; the engine derives a common *base rate* from all of them and
//! services every process at each multiple of its sample period, moving data
//! along the links of the graph with a configurable lag.
//!
//! An execution can be spread over several *voices*, i.e. cooperating
//! engines running in the same process or on different hosts, each of which
//! runs part of the system. Within a voice, processes are distributed over a
//! pool of worker threads.
//!
//! # A practical overview
//!
//! Running a simulation involves three activities:
//!
//! 1. writing components,
//! 2. describing the system, i.e. which components run on which voice and
//!    how their ports are linked,
//! 3. executing it on every voice and collecting the reports.
//!
//! ## Writing components
//!
//! Components implement the [`Component`](component::Component) trait, whose
//! single method receives every lifecycle [`Event`](component::Event) along
//! with a [`Context`](component::Context). Most components only care about a
//! few events:
//!
//! * `InitConnect`, in which a process inspects its connected inputs and
//!   creates its outputs; it may be delivered several times as more inputs
//!   get connected,
//! * `RunService`, in which a process reads its inputs and writes its
//!   outputs for the current sample,
//! * `StateSet` and `StateGet`, which exchange an opaque state with the
//!   system description and the final report.
//!
//! ```
//! use brahms::component::{Component, Context, Event, EventReply};
//! use brahms::error::Error;
//! use brahms::ports::DataSpec;
//!
//! /// Doubles a 64-bit float.
//! struct Doubler;
//!
//! impl Component for Doubler {
//!     fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
//!         match event {
//!             Event::InitConnect(mut connect) => {
//!                 if connect.input("in").is_some() && !connect.has_output("out") {
//!                     connect.create_output("out", DataSpec::new("std/f64", 8))?;
//!                 }
//!             }
//!             Event::RunService(mut service) => {
//!                 let x = f64::from_le_bytes(service.input(0)?.try_into().unwrap());
//!                 service.write_output(0, &(2.0 * x).to_le_bytes())?;
//!             }
//!             _ => {}
//!         }
//!         Ok(EventReply::Done)
//!     }
//! }
//! ```
//!
//! ## Describing a system
//!
//! A [`SystemBuilder`](system::SystemBuilder) gathers process and utility
//! descriptions together with the links between output ports
//! (`process>>port`) and input ports (`process<<port`). Each process is
//! described by a factory, which is only invoked on the voice the process is
//! assigned to.
//!
//! ## Executing
//!
//! An [`Engine`](engine::Engine) takes the [`Comms`](comms::Comms) of its
//! voice and the [`ExecParams`](params::ExecParams) tunables. Executing a
//! system goes through [`Engine::open`](engine::Engine::open), which runs the
//! initialization and connect phases,
//! [`Engine::execute`](engine::Engine::execute), which runs the worker
//! threads up to the stop time, and [`Engine::close`](engine::Engine::close),
//! which terminates the components and returns a
//! [`Report`](engine::Report).
//!
//! A single voice uses [`Comms::solo`](comms::Comms::solo). Several voices in
//! one process communicate through [`Comms::loopback`](comms::Comms::loopback)
//! and voices on different hosts through
//! [`Comms::connect_sockets`](comms::Comms::connect_sockets).
//!
//! # Guarantees
//!
//! * A process serviced at time `T` on an input with lag `L` reads the
//!   sample its source produced `L` of its own periods before, whatever the
//!   thread or voice the source runs on; samples preceding the start of the
//!   execution are zeroed.
//! * A reader never observes a partially written sample, and a writer never
//!   overwrites a sample that a reader still needs.
//! * An error or a cancellation on any voice stops all voices, and
//!   [`Engine::close`](engine::Engine::close) always delivers the
//!   termination events to the components that were created.
//!
//! # Cargo feature flags
//!
//! ## Tracing
//!
//! The engine logs through the [`tracing`](https://docs.rs/tracing/) crate.
//! The `tracing` feature adds the [`logging`] module, which installs a
//! subscriber tagging each line with its voice.
//!
//! ## Serde
//!
//! The `serde` feature derives `Serialize` and `Deserialize` for the
//! parameters, sample rates, timings and error codes.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod loom_exports;

pub mod comms;
pub mod component;
pub mod engine;
pub mod error;
pub mod ipm;
pub mod params;
pub mod ports;
pub mod registry;
pub mod sync;
pub mod system;
pub mod thread;
pub mod time;

#[cfg(feature = "tracing")]
pub mod logging;
