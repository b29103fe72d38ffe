//! Connect-phase deadlocks.

use brahms::comms::Comms;
use brahms::engine::Engine;
use brahms::error::ErrorCode;
use brahms::params::ExecParams;
use brahms::system::{LinkSpec, ProcessSpec, SystemBuilder};
use brahms::time::SampleRate;

use crate::components::{Counter, Scale};

#[test]
fn cycle_without_initial_output_deadlocks() {
    let rate = SampleRate::hz(10).unwrap();
    let system = SystemBuilder::new()
        .add_process(ProcessSpec::new("a", "test/scale", rate, || Scale(1)))
        .add_process(ProcessSpec::new("b", "test/scale", rate, || Scale(1)))
        .link(LinkSpec::new("a>>out", "b<<in"))
        .link(LinkSpec::new("b>>out", "a<<in"));

    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    let err = engine.open(system).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Deadlock);

    let report = engine.close();
    assert!(report.errors().iter().any(|e| e.code() == ErrorCode::Deadlock));
    // Termination still reaches the components that were created.
    assert_eq!(report.components().len(), 2);
}

#[test]
fn chain_declared_backwards_resolves_over_several_passes() {
    let rate = SampleRate::hz(10).unwrap();
    let system = SystemBuilder::new()
        .stop_time(0.5)
        .add_process(ProcessSpec::new("c", "test/scale", rate, || Scale(3)))
        .add_process(ProcessSpec::new("b", "test/scale", rate, || Scale(2)))
        .add_process(ProcessSpec::new("src", "test/counter", rate, Counter::default))
        .link(LinkSpec::new("b>>out", "c<<in"))
        .link(LinkSpec::new("src>>out", "b<<in"));

    let mut engine = Engine::new(Comms::solo(), ExecParams::default());
    engine.open(system).unwrap();
    engine.execute(None).unwrap();
    let report = engine.close();

    assert!(report.is_ok(), "{}", report);
    assert_eq!(report.component("c").unwrap().services, 5);
}
