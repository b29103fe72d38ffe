//! Example: an execution spread over two voices of the same process.
//!
//! This example demonstrates in particular:
//!
//! * loopback communication between voices,
//! * base-rate negotiation across voices,
//! * data links crossing voices in both directions,
//! * per-voice reports.
//!
//! ```text
//!   voice 0                         ┆  voice 1
//!   ┌──────────┐                    ┆
//!   │ ramp     ├────────────────────┼──►┌──────────┐
//!   │ 30 Hz    │                    ┆   │ gain     │
//!   └──────────┘     ┌──────────┐   ┆   │ 20 Hz    │
//!                    │ probe    │◄──┼───┤          │
//!                    │ 10 Hz    │   ┆   └──────────┘
//!                    └──────────┘   ┆
//! ```

use std::thread;

use brahms::comms::Comms;
use brahms::engine::{Engine, Report};
use brahms::error::Error;
use brahms::logging;
use brahms::params::{ExecParams, VoiceIndex};
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
use brahms::time::SampleRate;
use brahms_util::helper_components::{Probe, ProbeLog, Source, Sum};

const VOICES: usize = 2;
const STOP_TIME: f64 = 1.0;
const GAIN: f64 = 3.0;

/// Describes the system; every voice uses the same description.
fn system(log: ProbeLog) -> Result<SystemBuilder, Error> {
    Ok(SystemBuilder::new()
        .stop_time(STOP_TIME)
        .add_process(ProcessSpec::new("ramp", "util/source", SampleRate::hz(30)?, || {
            Source::new(|t| t)
        }))
        .add_process(
            ProcessSpec::new("gain", "util/sum", SampleRate::hz(20)?, || Sum::new(GAIN)).voice(1),
        )
        .add_process(ProcessSpec::new("probe", "util/probe", SampleRate::hz(10)?, move || {
            Probe::new(log)
        }))
        .link(LinkSpec::new("ramp>>out", "gain<<in"))
        .link(LinkSpec::new("gain>>out", "probe<<in")))
}

/// Runs one voice to completion.
fn run_voice(comms: Comms, params: ExecParams, log: ProbeLog) -> Result<Report, Error> {
    let voice: VoiceIndex = comms.voice().index;
    let _ = logging::init(voice, "brahms=info");

    let mut engine = Engine::new(comms, params);
    let outcome = system(log).and_then(|system| {
        engine.open(system)?;
        engine.execute(None)
    });
    let report = engine.close();

    outcome.map(|_| report)
}

fn main() -> Result<(), Error> {
    let params = ExecParams::default();
    let log = ProbeLog::new();

    let handles: Vec<_> = Comms::loopback(VOICES, &params)?
        .into_iter()
        .map(|comms| {
            let params = params.clone();
            let log = log.clone();
            thread::spawn(move || run_voice(comms, params, log))
        })
        .collect();

    for handle in handles {
        let report = handle.join().unwrap()?;
        println!("{}", report);
        assert!(report.is_ok());
    }

    // The probe on voice 0 reads the ramp after a round trip through voice 1.
    let samples = log.samples();
    assert_eq!(samples.len(), 10);
    for &(t, value) in &samples[1..] {
        assert!(value <= GAIN * t);
    }

    Ok(())
}
