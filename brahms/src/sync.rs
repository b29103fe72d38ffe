//! Synchronization primitives.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::loom_exports::sync::atomic::{AtomicBool, Ordering};
use crate::loom_exports::sync::{Arc, Condvar, Mutex};

/// Granularity at which blocking waits re-check cancellation.
pub(crate) const WAIT_STEP: Duration = Duration::from_millis(100);

/// A shared cancellation flag.
///
/// Cloning yields a handle to the same flag.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag in the non-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once the flag was raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A boolean condition that threads can wait on.
///
/// A signal is set by one party and observed by any number of waiters. It
/// stays set until explicitly reset.
#[derive(Default)]
pub struct Signal {
    state: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    /// Creates a signal in the reset state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal and wakes all waiters.
    pub fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.changed.notify_all();
    }

    /// Resets the signal.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    /// Returns `true` if the signal is set.
    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Waits until the signal is set, the timeout elapses or the cancel flag
    /// is raised.
    ///
    /// Returns `Ok(true)` if the signal was set and `Ok(false)` on timeout.
    /// Cancellation is checked at least every 100 ms and yields
    /// `E_CANCELLED`.
    pub fn wait_for(&self, timeout: Duration, cancel: &CancelFlag) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            if *state {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                return Err(Error::new(ErrorCode::Cancelled, "wait cancelled"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let step = (deadline - now).min(WAIT_STEP);
            state = self.changed.wait_timeout(state, step).unwrap().0;
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("set", &self.is_set())
            .finish()
    }
}
