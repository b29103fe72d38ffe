//! Helper components.
//!
//! This module contains general-purpose processes useful for assembling test
//! benches. They all exchange scalar samples of class [`F64_CLASS`], i.e.
//! one little-endian `f64` per sample.

use std::fmt;
use std::sync::{Arc, Mutex};

use brahms::component::{Component, Context, Event, EventReply};
use brahms::error::{Error, ErrorCode};
use brahms::ports::DataSpec;
use brahms::time::ComponentTime;

/// Data class of scalar samples.
pub const F64_CLASS: &str = "std/f64";

/// Returns the specification of a scalar output.
pub fn f64_spec() -> DataSpec {
    DataSpec::new(F64_CLASS, 8)
}

/// Decodes a scalar sample.
pub fn read_f64(bytes: &[u8]) -> Result<f64, Error> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        Error::new(
            ErrorCode::NotCompliant,
            format!("expected an 8-byte scalar sample, got {} bytes", bytes.len()),
        )
    })?;

    Ok(f64::from_le_bytes(bytes))
}

/// A waveform generator.
///
/// The output `out` holds the value of the waveform at the time of each
/// service.
pub struct Source<F> {
    waveform: F,
}

impl<F> Source<F>
where
    F: FnMut(f64) -> f64 + Send + 'static,
{
    /// Creates a source sampling `waveform`, a function of the time in
    /// seconds.
    pub fn new(waveform: F) -> Self {
        Self { waveform }
    }
}

impl<F> Component for Source<F>
where
    F: FnMut(f64) -> f64 + Send + 'static,
{
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::InitConnect(mut connect) if !connect.has_output("out") => {
                connect.create_output("out", f64_spec())?;
            }
            Event::RunService(mut service) => {
                let value = (self.waveform)(service.time().now_secs());
                service.write_output(0, &value.to_le_bytes())?;
            }
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

impl<F> fmt::Debug for Source<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").finish_non_exhaustive()
    }
}

/// A weighted sum of all inputs.
///
/// The output `out` is created as soon as one input is connected. Inputs must
/// carry scalar samples.
#[derive(Debug)]
pub struct Sum {
    gain: f64,
}

impl Sum {
    /// Creates an adder scaling the sum of its inputs by `gain`.
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }
}

impl Component for Sum {
    fn event(&mut self, event: Event<'_>, cx: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::InitConnect(mut connect) => {
                let mut inputs = connect.inputs().iter();
                if let Some(input) = inputs.find(|i| i.spec().class() != F64_CLASS) {
                    return Err(Error::new(
                        ErrorCode::NotCompliant,
                        format!(
                            "input '{}' carries '{}' samples",
                            input.name(),
                            input.spec().class()
                        ),
                    ));
                }
                if !connect.inputs().is_empty() && !connect.has_output("out") {
                    tracing::debug!(
                        "'{}' creates its output with {} inputs connected",
                        cx.name(),
                        connect.inputs().len()
                    );
                    connect.create_output("out", f64_spec())?;
                }
            }
            Event::RunService(mut service) => {
                let mut sum = 0.0;
                for i in 0..service.input_count() {
                    sum += read_f64(service.input(i)?)?;
                }
                service.write_output(0, &(self.gain * sum).to_le_bytes())?;
            }
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

/// Values recorded by a [`Probe`], shared with the test bench.
#[derive(Clone, Debug, Default)]
pub struct ProbeLog(Arc<Mutex<Vec<(f64, f64)>>>);

impl ProbeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded `(time, value)` pairs.
    pub fn samples(&self) -> Vec<(f64, f64)> {
        self.0.lock().unwrap().clone()
    }

    /// Returns the recorded values.
    pub fn values(&self) -> Vec<f64> {
        self.0.lock().unwrap().iter().map(|&(_, v)| v).collect()
    }
}

/// A sink recording its input `in`.
///
/// The last value read is the final state of the probe.
#[derive(Debug)]
pub struct Probe {
    log: ProbeLog,
    last: f64,
}

impl Probe {
    /// Creates a probe recording into `log`.
    pub fn new(log: ProbeLog) -> Self {
        Self { log, last: 0.0 }
    }

    fn record(&mut self, time: &ComponentTime, value: f64) {
        self.last = value;
        self.log.0.lock().unwrap().push((time.now_secs(), value));
    }
}

impl Component for Probe {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::RunService(service) => {
                let value = read_f64(service.input_by_name("in")?)?;
                self.record(service.time(), value);
            }
            Event::StateGet => return Ok(EventReply::State(self.last.to_le_bytes().to_vec())),
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use brahms::comms::Comms;
    use brahms::engine::Engine;
    use brahms::params::ExecParams;
    use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
    use brahms::time::SampleRate;

    #[test]
    fn ramp_through_a_sum() {
        let rate = SampleRate::hz(10).unwrap();
        let log = ProbeLog::new();
        let probe_log = log.clone();

        let system = SystemBuilder::new()
            .stop_time(0.5)
            .add_process(ProcessSpec::new("ramp", "util/source", rate, || {
                Source::new(|t| 10.0 * t)
            }))
            .add_process(ProcessSpec::new("ones", "util/source", rate, || {
                Source::new(|_| 1.0)
            }))
            .add_process(ProcessSpec::new("sum", "util/sum", rate, || Sum::new(0.5)))
            .add_process(ProcessSpec::new("probe", "util/probe", rate, move || {
                Probe::new(probe_log)
            }))
            .link(LinkSpec::new("ramp>>out", "sum<<a"))
            .link(LinkSpec::new("ones>>out", "sum<<b"))
            .link(LinkSpec::new("sum>>out", "probe<<in"));

        let mut engine = Engine::new(Comms::solo(), ExecParams::default());
        engine.open(system).unwrap();
        engine.execute(None).unwrap();
        let report = engine.close();
        assert!(report.is_ok(), "{}", report);

        // Two links of lag one between the sources and the probe.
        let values = log.values();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 0.0);
        for (k, v) in values.iter().enumerate().skip(2) {
            let expected = 0.5 * ((k - 2) as f64 + 1.0);
            assert!((v - expected).abs() < 1e-12, "sample {}: {}", k, v);
        }
        assert_eq!(
            report.final_state("probe").map(|s| read_f64(s).unwrap()),
            values.last().copied()
        );
    }

    #[test]
    fn scalar_samples_are_checked() {
        assert_eq!(read_f64(&2.5f64.to_le_bytes()).unwrap(), 2.5);
        assert_eq!(
            read_f64(&[0; 4]).unwrap_err().code(),
            ErrorCode::NotCompliant
        );
    }
}
