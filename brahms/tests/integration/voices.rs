//! Executions spread over several voices of the same process.

use std::sync::{Arc, Mutex};
use std::thread;

use brahms::comms::Comms;
use brahms::engine::{Engine, Report};
use brahms::error::Error;
use brahms::params::{ExecParams, VoiceIndex};
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
use brahms::time::SampleRate;

use crate::components::{Counter, Recorder, Scale};

/// Runs one engine per voice, each on its own thread, and returns the
/// outcome of `open` and `execute` along with the report of each voice.
pub(crate) fn run_voices<F>(
    comms: Vec<Comms>,
    params: &ExecParams,
    system: F,
) -> Vec<(Result<(), Error>, Report)>
where
    F: Fn(VoiceIndex) -> SystemBuilder + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comms| {
                let system = &system;
                s.spawn(move || {
                    let voice = comms.voice().index;
                    let mut engine = Engine::new(comms, params.clone());
                    let outcome = engine
                        .open(system(voice))
                        .and_then(|_| engine.execute(None));

                    (outcome, engine.close())
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// A counter and a recorder on voice 0 with a doubler on voice 1 in between.
pub(crate) fn round_trip(samples: Arc<Mutex<Vec<Vec<u64>>>>) -> SystemBuilder {
    let rate = SampleRate::hz(10).unwrap();

    SystemBuilder::new()
        .stop_time(1.0)
        .add_process(ProcessSpec::new("count", "test/counter", rate, Counter::default))
        .add_process(ProcessSpec::new("double", "test/scale", rate, || Scale(2)).voice(1))
        .add_process(ProcessSpec::new("rec", "test/recorder", rate, move || {
            Recorder::new(samples)
        }))
        .link(LinkSpec::new("count>>out", "double<<in"))
        .link(LinkSpec::new("double>>out", "rec<<in"))
}

#[test]
fn voices_negotiate_a_common_base_rate() {
    let params = ExecParams::default();
    let samples = Arc::new(Mutex::new(Vec::new()));

    let reports = run_voices(Comms::loopback(2, &params).unwrap(), &params, |_| {
        let samples = samples.clone();
        SystemBuilder::new()
            .stop_time(1.0)
            .add_process(ProcessSpec::new(
                "count",
                "test/counter",
                SampleRate::hz(10).unwrap(),
                Counter::default,
            ))
            .add_process(
                ProcessSpec::new("rec", "test/recorder", SampleRate::hz(15).unwrap(), move || {
                    Recorder::new(samples)
                })
                .voice(1),
            )
            .link(LinkSpec::new("count>>out", "rec<<in"))
    });

    for (outcome, report) in &reports {
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert!(report.is_ok(), "{}", report);
        assert_eq!(report.environment().base_rate, SampleRate::new(30, 1).ok());
        assert_eq!(report.environment().execution_stop, 30);
    }
    assert!(reports[0].1.component("rec").is_none());
    assert_eq!(reports[1].1.component("rec").unwrap().services, 15);

    // The recorder is serviced every 2 base samples and reads the counter
    // sample preceding the current one, produced every 3 base samples.
    let values: Vec<u64> = samples.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(values, vec![0, 0, 1, 2, 2, 3, 4, 4, 5, 6, 6, 7, 8, 8, 9]);
}

#[test]
fn data_crosses_voices_both_ways() {
    let params = ExecParams::default().with_max_threads(2);
    let samples = Arc::new(Mutex::new(Vec::new()));

    let reports = run_voices(Comms::loopback(2, &params).unwrap(), &params, |_| {
        round_trip(samples.clone())
    });

    for (outcome, report) in &reports {
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert!(report.is_ok(), "{}", report);
    }

    let values: Vec<u64> = samples.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(values, vec![0, 0, 2, 4, 6, 8, 10, 12, 14, 16]);
    assert_eq!(reports[1].1.component("double").unwrap().services, 10);
}

#[test]
fn three_voices_with_an_idle_one() {
    let params = ExecParams::default();
    let samples = Arc::new(Mutex::new(Vec::new()));

    let reports = run_voices(Comms::loopback(3, &params).unwrap(), &params, |_| {
        round_trip(samples.clone())
    });

    for (outcome, report) in &reports {
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert!(report.is_ok(), "{}", report);
    }
    assert!(reports[2].1.components().is_empty());
    assert_eq!(samples.lock().unwrap().len(), 10);
}
