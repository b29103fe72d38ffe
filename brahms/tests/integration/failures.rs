//! Errors and cancellation.

use std::thread;
use std::time::{Duration, Instant};

use brahms::comms::Comms;
use brahms::engine::{Engine, MonitorControl, Progress, EXIT_ERROR};
use brahms::error::ErrorCode;
use brahms::params::ExecParams;
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
use brahms::time::SampleRate;

use crate::components::{Counter, FailAt, PanicAt};
use crate::voices::run_voices;

fn hz(hz: u64) -> SampleRate {
    SampleRate::hz(hz).unwrap()
}

/// A counter feeding a process that fails at its 5th service.
fn failing(stop_time: f64, fail_voice: usize) -> SystemBuilder {
    SystemBuilder::new()
        .stop_time(stop_time)
        .add_process(ProcessSpec::new("count", "test/counter", hz(100), Counter::default))
        .add_process(ProcessSpec::new("fail", "test/fail", hz(100), || FailAt(5)).voice(fail_voice))
        .link(LinkSpec::new("count>>out", "fail<<in"))
}

/// A counter running for a very long time.
fn endless() -> SystemBuilder {
    SystemBuilder::new()
        .stop_time(1e6)
        .add_process(ProcessSpec::new("count", "test/counter", hz(1000), Counter::default))
}

#[test]
fn component_error_stops_the_execution() {
    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    engine.open(failing(1.0, 0)).unwrap();

    let err = engine.execute(None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Component);
    assert_eq!(err.message(), "sensor saturated");
    assert!(err
        .trace_lines()
        .iter()
        .any(|line| line.contains("servicing 'fail' at base time 4")));

    let report = engine.close();
    assert_eq!(report.exit_code(), EXIT_ERROR);
    assert_eq!(report.errors().len(), 1);
    assert_eq!(report.component("fail").unwrap().services, 5);
    // The final state is still collected after the failure.
    assert!(report.final_state("count").is_some());

    let xml = report.to_xml(true);
    assert!(xml.contains("<Message>sensor saturated</Message>"));
    assert!(xml.contains("<Trace>"));
}

#[test]
fn component_panic_stops_the_execution() {
    let system = SystemBuilder::new()
        .stop_time(1.0)
        .add_process(ProcessSpec::new("count", "test/counter", hz(100), Counter::default))
        .add_process(ProcessSpec::new("buggy", "test/panic", hz(100), || PanicAt(3)))
        .link(LinkSpec::new("count>>out", "buggy<<in"));

    let hang_timeout = Duration::from_secs(30);
    let params = ExecParams::default().with_hang_timeout(hang_timeout);
    let mut engine = Engine::new(Comms::solo(), params);
    engine.open(system).unwrap();

    let start = Instant::now();
    let err = engine.execute(None).unwrap_err();
    // The failure is reported without waiting for the workers to time out.
    assert!(start.elapsed() < hang_timeout / 3);

    assert_eq!(err.code(), ErrorCode::Component);
    assert!(err.message().contains("index out of bounds"));
    assert!(err
        .trace_lines()
        .iter()
        .any(|line| line == "in RunService of 'buggy'"));

    let report = engine.close();
    assert_eq!(report.exit_code(), EXIT_ERROR);
    assert!(report
        .errors()
        .iter()
        .all(|e| e.code() != ErrorCode::ThreadError));
    assert!(report.final_state("count").is_some());
}

#[test]
fn error_on_one_voice_aborts_all() {
    let params = ExecParams::default();
    let reports = run_voices(Comms::loopback(2, &params).unwrap(), &params, |_| {
        failing(100.0, 1)
    });

    for (outcome, report) in &reports {
        assert!(outcome.is_err());
        assert!(!report.is_ok());
        assert!(report
            .errors()
            .iter()
            .any(|e| e.code() == ErrorCode::Component && e.message() == "sensor saturated"));
    }
    // The error reaches voice 0 tagged with its origin.
    assert!(reports[0]
        .1
        .errors()
        .iter()
        .flat_map(|e| e.trace_lines())
        .any(|line| line == "raised on voice 1"));
}

#[test]
fn monitor_cancels_the_execution() {
    let mut calls = 0;
    let mut monitor = |progress: Progress| {
        calls += 1;
        assert!((0.0..=1.0).contains(&progress.fraction));
        MonitorControl::Cancel
    };

    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    engine.open(endless()).unwrap();
    let err = engine.execute(Some(&mut monitor)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(calls, 1);

    let report = engine.close();
    assert!(report.errors().iter().any(|e| e.code() == ErrorCode::Cancelled));
    assert!(report.final_state("count").is_some());
}

#[test]
fn cancellation_from_another_thread() {
    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    engine.open(endless()).unwrap();

    let cancel = engine.cancel_flag();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });

    let err = engine.execute(None).unwrap_err();
    canceller.join().unwrap();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(!engine.close().is_ok());
}
