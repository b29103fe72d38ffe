//! Worker run loops.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::comms::Forwarder;
use crate::component::{ComponentCell, InputSlot, OutputSlot};
use crate::error::{Error, ErrorCode};
use crate::ports::{ReaderId, Ring};
use crate::sync::CancelFlag;
use crate::thread::{Phase, ThreadContext};

pub(crate) struct InputPlan {
    pub(crate) name: Arc<str>,
    pub(crate) ring: Arc<Ring>,
    pub(crate) reader: ReaderId,
}

pub(crate) struct OutputPlan {
    pub(crate) name: Arc<str>,
    pub(crate) ring: Arc<Ring>,
    /// Sender of the samples to remote subscribers, if any.
    pub(crate) forwarder: Option<Forwarder>,
}

/// Everything a worker needs to service one process.
pub(crate) struct ServicePlan {
    pub(crate) name: Arc<str>,
    pub(crate) cell: Arc<Mutex<ComponentCell>>,
    /// Sample period in base samples.
    pub(crate) period: u64,
    pub(crate) inputs: Vec<InputPlan>,
    pub(crate) outputs: Vec<OutputPlan>,
    /// Base time of the next service, published for progress reports.
    pub(crate) now: Arc<AtomicU64>,
}

impl fmt::Debug for ServicePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePlan")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// The run loop of one worker.
///
/// Processes are serviced in assignment order at every base time that is a
/// multiple of their sample period, until the execution stop.
pub(crate) struct Runner {
    plans: Vec<ServicePlan>,
    stop: u64,
    cancel: CancelFlag,
}

impl Runner {
    pub(crate) fn new(plans: Vec<ServicePlan>, stop: u64, cancel: CancelFlag) -> Self {
        Self {
            plans,
            stop,
            cancel,
        }
    }

    /// Runs to completion on the calling worker thread.
    pub(crate) fn run(self, cx: &mut ThreadContext) -> Result<(), Error> {
        let started = Instant::now();
        cx.begin_phase(Phase::Run);
        let result = self.service_all(cx);
        cx.end_phase();

        for plan in &self.plans {
            for input in &plan.inputs {
                input.ring.retire_reader(input.reader);
            }
        }

        result.map_err(|e| {
            e.trace(format!(
                "caught in thread {} after {:.3} s",
                cx.id(),
                started.elapsed().as_secs_f64()
            ))
        })
    }

    fn service_all(&self, cx: &ThreadContext) -> Result<(), Error> {
        let mut due = vec![0u64; self.plans.len()];
        loop {
            let Some(now) = due.iter().copied().min() else {
                return Ok(());
            };
            if now >= self.stop {
                return Ok(());
            }

            for (plan, due) in self.plans.iter().zip(due.iter_mut()) {
                if *due != now {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return Err(Error::new(ErrorCode::Cancelled, "execution cancelled"));
                }
                cx.still_active();
                self.service(plan, now).map_err(|e| {
                    e.trace(format!("servicing '{}' at base time {}", plan.name, now))
                })?;
                *due += plan.period;
                plan.now.store(*due, Ordering::Relaxed);
            }
        }
    }

    fn service(&self, plan: &ServicePlan, now: u64) -> Result<(), Error> {
        let inputs = plan
            .inputs
            .iter()
            .map(|input| {
                let sample = input.ring.sample_for(input.reader, now);
                input.ring.read(input.reader, sample).map(|guard| InputSlot {
                    name: input.name.clone(),
                    guard,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut outputs = plan
            .outputs
            .iter()
            .map(|output| {
                output.ring.write().map(|guard| OutputSlot {
                    name: output.name.clone(),
                    guard,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        plan.cell
            .lock()
            .unwrap()
            .fire_service(now, &inputs, &mut outputs)?;

        drop(inputs);
        for input in &plan.inputs {
            let watermark = input.ring.next_watermark(input.reader, now);
            input.ring.release_until(input.reader, watermark);
        }
        for (slot, output) in outputs.into_iter().zip(&plan.outputs) {
            if let Some(forwarder) = &output.forwarder {
                forwarder.forward(slot.guard.bytes(), &self.cancel)?;
            }
            slot.guard.commit();
        }

        Ok(())
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("plans", &self.plans)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use crate::component::{Component, ComponentCell, Context, Event, EventReply};
    use crate::ports::RingBuilder;
    use crate::thread::{Thread, ThreadClass};
    use crate::time::{ComponentTime, SampleRate};

    /// Writes a counter on its single output.
    struct Counter(u32);

    impl Component for Counter {
        fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
            if let Event::RunService(mut service) = event {
                self.0 += 1;
                service.write_output(0, &self.0.to_le_bytes())?;
            }
            Ok(EventReply::Done)
        }
    }

    /// Accumulates its single input, failing past a limit.
    struct Summer {
        total: Arc<AtomicU64>,
        limit: u64,
    }

    impl Component for Summer {
        fn event(&mut self, event: Event<'_>, _: &mut Context) -> Result<EventReply, Error> {
            if let Event::RunService(service) = event {
                let bytes: [u8; 4] = service.input(0)?.try_into().unwrap();
                let value = u32::from_le_bytes(bytes) as u64;
                let total = self.total.fetch_add(value, Ordering::Relaxed);
                if total > self.limit {
                    return Err(Error::component("limit exceeded"));
                }
            }
            Ok(EventReply::Done)
        }
    }

    fn cell<C: Component>(
        name: &str,
        component: C,
        period: u64,
        stop: u64,
    ) -> Arc<Mutex<ComponentCell>> {
        let cx = Context::new(name.into(), "test/runner".into(), 0);
        let mut cell = ComponentCell::new(
            cx,
            Box::new(move || Box::new(component) as Box<dyn Component>),
            Vec::new(),
        );
        cell.fire_common(crate::component::CommonEvent::ModuleCreate).unwrap();
        let base = SampleRate::hz(10).unwrap();
        let rate = SampleRate::new(10, period).unwrap();
        cell.set_time(ComponentTime::new(base, rate, stop).unwrap());

        Arc::new(Mutex::new(cell))
    }

    fn pipeline(limit: u64, stop: u64) -> (Vec<ServicePlan>, Arc<AtomicU64>) {
        let mut builder = RingBuilder::new(4, 1);
        let reader = builder.add_reader(1, 2);
        let ring = builder.build();
        let total = Arc::new(AtomicU64::new(0));

        let plans = vec![
            ServicePlan {
                name: "counter".into(),
                cell: cell("counter", Counter(0), 1, stop),
                period: 1,
                inputs: Vec::new(),
                outputs: vec![OutputPlan {
                    name: "out".into(),
                    ring: ring.clone(),
                    forwarder: None,
                }],
                now: Arc::new(AtomicU64::new(0)),
            },
            ServicePlan {
                name: "summer".into(),
                cell: cell(
                    "summer",
                    Summer {
                        total: total.clone(),
                        limit,
                    },
                    2,
                    stop,
                ),
                period: 2,
                inputs: vec![InputPlan {
                    name: "in".into(),
                    ring,
                    reader,
                }],
                outputs: Vec::new(),
                now: Arc::new(AtomicU64::new(0)),
            },
        ];

        (plans, total)
    }

    fn run_on_worker(runner: Runner) -> Result<(), Error> {
        let mut thread = Thread::new(ThreadClass::Worker, 1, false);
        let (tx, rx) = std::sync::mpsc::channel();
        thread
            .start(std::time::Duration::from_secs(2), move |cx| {
                let _ = tx.send(runner.run(cx));
            })
            .unwrap();

        rx.recv().unwrap()
    }

    #[test]
    fn processes_are_serviced_on_their_period() {
        let (plans, total) = pipeline(u64::MAX, 10);
        let counter_now = plans[0].now.clone();
        let summer_now = plans[1].now.clone();

        run_on_worker(Runner::new(plans, 10, CancelFlag::new())).unwrap();

        // The summer reads samples -1, 1, 3, 5, 7 of the counter, which
        // writes 1 at sample 0: -1 is zeroed pre-history.
        assert_eq!(total.load(Ordering::Relaxed), 2 + 4 + 6 + 8);
        assert_eq!(counter_now.load(Ordering::Relaxed), 10);
        assert_eq!(summer_now.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn errors_carry_the_thread_and_stop_the_loop() {
        let (plans, _) = pipeline(3, 10);

        let err = run_on_worker(Runner::new(plans, 10, CancelFlag::new())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Component);
        assert!(err.trace_lines()[0].starts_with("in RunService of 'summer'"));
        assert!(err.trace_lines().last().unwrap().starts_with("caught in thread W1 after"));
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let (plans, _) = pipeline(u64::MAX, 10);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = run_on_worker(Runner::new(plans, 10, cancel)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }
}
