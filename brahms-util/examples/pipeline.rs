//! Example: a single-voice execution of a small signal chain.
//!
//! This example demonstrates in particular:
//!
//! * processes sampled at different rates,
//! * links with a lag,
//! * progress monitoring,
//! * the execution report.
//!
//! ```text
//! ┏━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┓
//! ┃ System (base rate 400 Hz)                            ┃
//! ┃   ┌────────────┐                                     ┃
//! ┃   │ sine       ├───┐     ┌───────┐      ┌─────────┐  ┃
//! ┃   │ 400 Hz     │   └────►│       │      │         │  ┃
//! ┃   └────────────┘         │  sum  ├─────►│  probe  │  ┃
//! ┃   ┌────────────┐   ┌────►│ 200 Hz│      │ 100 Hz  │  ┃
//! ┃   │ offset     ├───┘     └───────┘      └─────────┘  ┃
//! ┃   │ 100 Hz     │ lag 2                               ┃
//! ┃   └────────────┘                                     ┃
//! ┗━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┛
//! ```

use std::f64::consts::TAU;

use brahms::comms::Comms;
use brahms::engine::{Engine, MonitorControl, Progress};
use brahms::error::Error;
use brahms::logging;
use brahms::params::ExecParams;
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
use brahms::time::SampleRate;
use brahms_util::helper_components::{Probe, ProbeLog, Source, Sum};

const STOP_TIME: f64 = 2.0;
const FREQUENCY: f64 = 5.0;
const OFFSET: f64 = 1.0;

fn main() -> Result<(), Error> {
    // A subscriber may already be installed by the environment.
    let _ = logging::init(0, "brahms=info");

    // --------------------
    // System description.
    // --------------------

    let log = ProbeLog::new();
    let probe_log = log.clone();

    let system = SystemBuilder::new()
        .stop_time(STOP_TIME)
        .add_process(ProcessSpec::new("sine", "util/source", SampleRate::hz(400)?, || {
            Source::new(|t| (TAU * FREQUENCY * t).sin())
        }))
        .add_process(ProcessSpec::new("offset", "util/source", SampleRate::hz(100)?, || {
            Source::new(|_| OFFSET)
        }))
        .add_process(ProcessSpec::new("sum", "util/sum", SampleRate::hz(200)?, || {
            Sum::new(1.0)
        }))
        .add_process(ProcessSpec::new("probe", "util/probe", SampleRate::hz(100)?, move || {
            Probe::new(probe_log)
        }))
        .link(LinkSpec::new("sine>>out", "sum<<signal"))
        .link(LinkSpec::new("offset>>out", "sum<<offset").lag(2))
        .link(LinkSpec::new("sum>>out", "probe<<in"));

    // ----------
    // Execution.
    // ----------

    let mut monitor = |progress: Progress| {
        println!(
            "{:5.1}% done, {:?} remaining",
            100.0 * progress.fraction,
            progress.remaining()
        );
        MonitorControl::Continue
    };

    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    engine.open(system)?;
    engine.execute(Some(&mut monitor))?;
    let report = engine.close();

    println!("{}", report);

    // The probe sees the sine shifted by the offset once the lagged offset
    // arrived.
    let values = log.values();
    assert_eq!(values.len(), 200);
    assert!(values[10..]
        .iter()
        .all(|v| (OFFSET - 1.0..=OFFSET + 1.0).contains(v)));
    assert!(report.is_ok());

    Ok(())
}
