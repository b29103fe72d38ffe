//! Components shared by the integration tests.

use std::sync::{Arc, Mutex};

use brahms::component::{Component, Context, Event, EventReply};
use brahms::error::Error;
use brahms::ports::DataSpec;

pub(crate) fn u64_spec() -> DataSpec {
    DataSpec::new("std/u64", 8)
}

pub(crate) fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().unwrap())
}

/// Emits the number of services so far on `out`.
#[derive(Default)]
pub(crate) struct Counter(u64);

impl Component for Counter {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::InitConnect(mut connect) if !connect.has_output("out") => {
                connect.create_output("out", u64_spec())?;
            }
            Event::RunService(mut service) => {
                self.0 += 1;
                service.write_output(0, &self.0.to_le_bytes())?;
            }
            Event::StateGet => return Ok(EventReply::State(self.0.to_le_bytes().to_vec())),
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

/// Forwards `in` to `out` multiplied by a constant, once its input is
/// connected.
pub(crate) struct Scale(pub(crate) u64);

impl Component for Scale {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::InitConnect(mut connect) => {
                if connect.input("in").is_some() && !connect.has_output("out") {
                    connect.create_output("out", u64_spec())?;
                }
            }
            Event::RunService(mut service) => {
                let x = read_u64(service.input_by_name("in")?);
                service.write_output(0, &(self.0 * x).to_le_bytes())?;
            }
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

/// Records every value read on each of its inputs, in input order.
pub(crate) struct Recorder {
    samples: Arc<Mutex<Vec<Vec<u64>>>>,
    last: Vec<u64>,
}

impl Recorder {
    pub(crate) fn new(samples: Arc<Mutex<Vec<Vec<u64>>>>) -> Self {
        Self {
            samples,
            last: Vec::new(),
        }
    }
}

impl Component for Recorder {
    fn event(&mut self, event: Event<'_>, cx: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::InitPostconnect => {
                let time = cx.time().expect("timing is set before post-connect");
                cx.log(format!("sampled every {} base samples", time.sample_period));
            }
            Event::RunService(service) => {
                self.last = (0..service.input_count())
                    .map(|i| service.input(i).map(read_u64))
                    .collect::<Result<_, _>>()?;
                self.samples.lock().unwrap().push(self.last.clone());
            }
            Event::StateGet => {
                let state = self.last.iter().flat_map(|x| x.to_le_bytes()).collect();
                return Ok(EventReply::State(state));
            }
            _ => {}
        }

        Ok(EventReply::Done)
    }
}

/// Fails its `n`-th service.
pub(crate) struct FailAt(pub(crate) u64);

impl Component for FailAt {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        if let Event::RunService(service) = event {
            if service.time().sample_index() + 1 == self.0 {
                return Err(Error::component("sensor saturated"));
            }
        }

        Ok(EventReply::Done)
    }
}

/// Panics at the given service (1-based).
pub(crate) struct PanicAt(pub(crate) u64);

impl Component for PanicAt {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        if let Event::RunService(service) = event {
            if service.time().sample_index() + 1 == self.0 {
                panic!("index out of bounds");
            }
        }

        Ok(EventReply::Done)
    }
}

/// Hands its initial state back at the end of the execution, reversed.
#[derive(Default)]
pub(crate) struct Mirror(Vec<u8>);

impl Component for Mirror {
    fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
        match event {
            Event::StateSet(state) => self.0 = state.iter().rev().copied().collect(),
            Event::StateGet => return Ok(EventReply::State(self.0.clone())),
            _ => {}
        }

        Ok(EventReply::Done)
    }
}
