//! Progress monitoring.

use std::time::Duration;

/// Progress of the run phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    /// Fraction of the execution completed by the slowest local process,
    /// between 0 and 1.
    pub fraction: f64,
    /// Wallclock time since the start of the run phase.
    pub elapsed: Duration,
}

impl Progress {
    /// Estimates the remaining wallclock time, assuming a constant pace.
    pub fn remaining(&self) -> Option<Duration> {
        if self.fraction <= 0.0 {
            return None;
        }

        let total = self.elapsed.as_secs_f64() / self.fraction.min(1.0);
        Some(Duration::from_secs_f64(
            (total - self.elapsed.as_secs_f64()).max(0.0),
        ))
    }
}

/// Decision of a monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorControl {
    /// Keep running.
    Continue,
    /// Cancel the execution on all voices.
    Cancel,
}

/// Observer of the run phase.
///
/// The engine calls the monitor from the thread running
/// [`Engine::execute`](super::Engine::execute), at intervals growing from
/// `monitor_interval_min` to `monitor_interval_max`.
///
/// Closures taking a [`Progress`] and returning a [`MonitorControl`]
/// implement this trait.
pub trait Monitor {
    /// Reports progress.
    fn progress(&mut self, progress: Progress) -> MonitorControl;
}

impl<F> Monitor for F
where
    F: FnMut(Progress) -> MonitorControl,
{
    fn progress(&mut self, progress: Progress) -> MonitorControl {
        self(progress)
    }
}
