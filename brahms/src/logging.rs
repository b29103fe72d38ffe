//! Support for structured logging.
//!
//! The engine emits [`tracing`] events: `debug` for protocol steps, `info`
//! for phase boundaries, `warn` for forced thread terminations and `error`
//! for failures, escaped panics and deadlock diagnostics.
//!
//! Any subscriber can collect them. When several voices log to the same
//! terminal, the [`VoiceTime`] timer set up by [`init`] tags each line with
//! its voice and the wallclock time elapsed since the voice started:
//!
//! ```text
//! [v1 +0.004531s]  INFO brahms::engine: initialization phase voice=1
//! [v0 +0.005102s] DEBUG brahms::system::connect: resolved src>>out -> dst/in
//! ```
//!
//! # Example
//!
//! ```
//! use brahms::logging;
//!
//! // Ignore the result: a subscriber may already be installed.
//! let _ = logging::init(0, "brahms=info");
//! ```

use std::fmt;
use std::time::Instant;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, ErrorCode};
use crate::params::VoiceIndex;

/// A timer printing the voice index and the time elapsed since the timer
/// was created.
#[derive(Clone, Debug)]
pub struct VoiceTime {
    voice: VoiceIndex,
    epoch: Instant,
}

impl VoiceTime {
    /// Creates a timer for a voice, starting now.
    pub fn new(voice: VoiceIndex) -> Self {
        Self {
            voice,
            epoch: Instant::now(),
        }
    }
}

impl FormatTime for VoiceTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(
            w,
            "[v{} +{:.6}s]",
            self.voice,
            self.epoch.elapsed().as_secs_f64()
        )
    }
}

/// Installs a global subscriber with the [`VoiceTime`] timer.
///
/// `filter` uses the `RUST_LOG` directive syntax; the `RUST_LOG`
/// environment variable takes precedence when set. Fails with
/// `E_INVALID_ARG` for a malformed filter and with `E_INTERNAL` if a global
/// subscriber is already installed.
pub fn init(voice: VoiceIndex, filter: &str) -> Result<(), Error> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(filter),
    }
    .map_err(|e| Error::new(ErrorCode::InvalidArg, format!("invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(VoiceTime::new(voice))
        .with_thread_names(true)
        .try_init()
        .map_err(|e| Error::new(ErrorCode::Internal, format!("logging already set up: {}", e)))
}
