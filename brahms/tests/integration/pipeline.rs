//! Single-voice executions.

use std::sync::{Arc, Mutex};

use brahms::comms::Comms;
use brahms::engine::{ComponentKind, Engine, Report, EXIT_ERROR, EXIT_SUCCESS};
use brahms::error::{Error, ErrorCode};
use brahms::params::ExecParams;
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder, UtilitySpec};
use brahms::time::SampleRate;

use crate::components::{read_u64, Counter, Mirror, Recorder, Scale};

fn hz(hz: u64) -> SampleRate {
    SampleRate::hz(hz).unwrap()
}

fn run(system: SystemBuilder, params: ExecParams) -> Result<Report, Error> {
    let mut engine = Engine::new(Comms::solo(), params);
    engine.open(system)?;
    engine.execute(None)?;

    Ok(engine.close())
}

#[test]
fn lagged_pipeline_across_threads() {
    let direct = Arc::new(Mutex::new(Vec::new()));
    let delayed = Arc::new(Mutex::new(Vec::new()));
    let (direct_rec, delayed_rec) = (direct.clone(), delayed.clone());

    let system = SystemBuilder::new()
        .stop_time(0.1)
        .add_process(ProcessSpec::new("count", "test/counter", hz(100), Counter::default).thread(0))
        .add_process(ProcessSpec::new("double", "test/scale", hz(100), || Scale(2)).thread(1))
        .add_process(
            ProcessSpec::new("direct", "test/recorder", hz(100), move || {
                Recorder::new(direct_rec)
            })
            .thread(2),
        )
        .add_process(
            ProcessSpec::new("delayed", "test/recorder", hz(100), move || {
                Recorder::new(delayed_rec)
            })
            .thread(0),
        )
        .link(LinkSpec::new("count>>out", "double<<in"))
        .link(LinkSpec::new("double>>out", "direct<<in"))
        .link(LinkSpec::new("count>>out", "delayed<<in").lag(4));

    let report = run(system, ExecParams::default().with_max_threads(3)).unwrap();

    assert!(report.is_ok(), "{}", report);
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
    assert_eq!(report.environment().base_rate, Some(hz(100)));
    assert_eq!(report.environment().execution_stop, 10);
    assert_eq!(report.environment().workers, 3);

    // Each link delays by one sample; the first samples are zeroed.
    let direct: Vec<u64> = direct.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(direct, vec![0, 0, 2, 4, 6, 8, 10, 12, 14, 16]);
    let delayed: Vec<u64> = delayed.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(delayed, vec![0, 0, 0, 0, 1, 2, 3, 4, 5, 6]);

    assert_eq!(report.final_state("count"), Some(&10u64.to_le_bytes()[..]));
    assert_eq!(report.component("double").unwrap().services, 10);
}

#[test]
fn slower_reader_of_a_faster_source() {
    let samples = Arc::new(Mutex::new(Vec::new()));
    let recorded = samples.clone();

    let system = SystemBuilder::new()
        .stop_time(0.1)
        .add_process(ProcessSpec::new("count", "test/counter", hz(100), Counter::default))
        .add_process(ProcessSpec::new("slow", "test/recorder", hz(50), move || {
            Recorder::new(recorded)
        }))
        .link(LinkSpec::new("count>>out", "slow<<in"));

    let report = run(system, ExecParams::default()).unwrap();
    assert!(report.is_ok(), "{}", report);

    // Serviced at base samples 0, 2, 4, 6 and 8.
    let values: Vec<u64> = samples.lock().unwrap().iter().map(|s| s[0]).collect();
    assert_eq!(values, vec![0, 2, 4, 6, 8]);

    let slow = report.component("slow").unwrap();
    assert_eq!(slow.sample_rate, Some(hz(50)));
    assert_eq!(slow.services, 5);
    assert_eq!(slow.log, vec!["sampled every 2 base samples".to_string()]);
    assert_eq!(report.final_state("slow").map(read_u64), Some(8));
}

#[test]
fn utilities_exchange_state() {
    let system = SystemBuilder::new()
        .stop_time(0.05)
        .add_process(
            ProcessSpec::new("proc", "test/mirror", hz(1000), Mirror::default).state(&b"abc"[..]),
        )
        .add_utility(UtilitySpec::new("util", "test/mirror", Mirror::default).state(&b"xyz"[..]));

    let report = run(system, ExecParams::default()).unwrap();

    assert!(report.is_ok(), "{}", report);
    assert_eq!(report.final_state("proc"), Some(&b"cba"[..]));
    assert_eq!(report.final_state("util"), Some(&b"zyx"[..]));
    assert_eq!(report.component("util").unwrap().kind, ComponentKind::Utility);
    assert_eq!(report.component("proc").unwrap().services, 50);
}

#[test]
fn invalid_system_fails_to_open() {
    let system = SystemBuilder::new()
        .add_process(ProcessSpec::new("count", "test/counter", hz(10), Counter::default))
        .link(LinkSpec::new("count>>out", "nowhere<<in"));

    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    let err = engine.open(system).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArg);

    // The engine refuses to run a system it failed to open.
    assert!(engine.execute(None).is_err());

    let report = engine.close();
    assert!(!report.is_ok());
    assert_eq!(report.exit_code(), EXIT_ERROR);
    assert!(report.components().is_empty());
    assert!(report
        .to_xml(false)
        .contains("<Error code=\"E_INVALID_ARG\">"));
}
