//! Execution parameters.
//!
//! [`ExecParams`] gathers the tunables of an execution. Each parameter has a
//! default and can be overridden programmatically with the builder-style
//! setters, or by name from a `--par-Name=Value` command-line argument with
//! [`ExecParams::apply_override`]. Durations are given in milliseconds and
//! booleans as `0`/`1`/`true`/`false`.
//!
//! ```
//! use std::time::Duration;
//! use brahms::params::ExecParams;
//!
//! let mut params = ExecParams::default().with_max_threads(2);
//! params.apply_override("--par-TimeoutThreadHang=2500")?;
//!
//! assert_eq!(params.thread_hang_timeout, Duration::from_millis(2500));
//! assert_eq!(params.max_threads, 2);
//! # Ok::<(), brahms::error::Error>(())
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::{Error, ErrorCode};

/// Index of a voice among the voices of an execution.
pub type VoiceIndex = usize;

/// Index of the master voice.
pub const VOICE_MASTER: VoiceIndex = 0;

/// Maximum number of voices; message headers carry the voice index on 16 bits.
pub const MAX_VOICES: usize = 1 << 16;

/// Identity of the local voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoiceConfig {
    /// Index of this voice.
    pub index: VoiceIndex,
    /// Number of cooperating voices.
    pub count: usize,
}

impl VoiceConfig {
    /// Configuration of a single-voice execution.
    pub fn solo() -> Self {
        Self { index: 0, count: 1 }
    }

    /// Creates a voice configuration, checking that the index is in range.
    pub fn new(index: VoiceIndex, count: usize) -> Result<Self, Error> {
        if count > MAX_VOICES {
            return Err(Error::new(
                ErrorCode::InvalidArg,
                format!("{} voices requested, at most {} supported", count, MAX_VOICES),
            ));
        }
        if index >= count {
            return Err(Error::new(
                ErrorCode::InvalidArg,
                format!("voice index {} is out of range for {} voices", index, count),
            ));
        }

        Ok(Self { index, count })
    }

    /// Returns `true` for the master voice.
    pub fn is_master(&self) -> bool {
        self.index == VOICE_MASTER
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self::solo()
    }
}

/// Tunable parameters of an execution.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecParams {
    /// Maximum number of worker threads; 0 selects the number of CPUs
    /// (`MaxThreadCount`).
    pub max_threads: usize,
    /// Whether thread priorities are adjusted by thread class
    /// (`ThreadPriorities`).
    pub thread_priorities: bool,
    /// Time allowed for a thread to signal start-up (`TimeoutThreadStart`).
    pub thread_start_timeout: Duration,
    /// Time allowed for a thread to finish on termination
    /// (`TimeoutThreadTerm`).
    pub thread_term_timeout: Duration,
    /// Heartbeat age beyond which a running worker is declared hung
    /// (`TimeoutThreadHang`).
    pub thread_hang_timeout: Duration,
    /// Lower bound of the run-phase poll interval (`ThreadPollIntervalMin`).
    pub poll_interval_min: Duration,
    /// Upper bound of the run-phase poll interval (`ThreadPollIntervalMax`).
    pub poll_interval_max: Duration,
    /// Lower bound of the progress report interval (`MonitorIntervalMin`).
    pub monitor_interval_min: Duration,
    /// Upper bound of the progress report interval (`MonitorIntervalMax`).
    pub monitor_interval_max: Duration,
    /// Time allowed for a peer to answer a request (`TimeoutComms`).
    pub comms_timeout: Duration,
    /// Time allowed for all voices to reach a barrier (`TimeoutSync`).
    pub sync_timeout: Duration,
    /// Silence after which a socket channel emits a keep-alive
    /// (`KeepAliveInterval`).
    pub keepalive_interval: Duration,
    /// Maximum accepted size of an incoming message (`MaxMessageBytes`).
    pub max_message_bytes: usize,
    /// Number of early messages buffered per stream before delivery is
    /// declared out of order (`ReorderWindow`).
    pub reorder_window: usize,
    /// Number of buffers per cross-voice link, bounding in-flight samples
    /// (`StreamBuffers`).
    pub stream_buffers: usize,
    /// Whether error traces are written to the report (`ShowTrace`).
    pub show_trace: bool,
}

impl ExecParams {
    /// Sets the maximum number of worker threads.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the hang timeout of worker threads.
    pub fn with_hang_timeout(mut self, timeout: Duration) -> Self {
        self.thread_hang_timeout = timeout;
        self
    }

    /// Sets the communication timeout.
    pub fn with_comms_timeout(mut self, timeout: Duration) -> Self {
        self.comms_timeout = timeout;
        self
    }

    /// Sets the synchronization timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Enables or disables the adjustment of thread priorities.
    pub fn with_thread_priorities(mut self, enabled: bool) -> Self {
        self.thread_priorities = enabled;
        self
    }

    /// Returns the effective number of worker threads.
    pub fn worker_threads(&self) -> usize {
        if self.max_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_threads
        }
    }

    /// Applies a `--par-Name=Value` (or `Name=Value`) override.
    pub fn apply_override(&mut self, arg: &str) -> Result<(), Error> {
        let arg = arg.strip_prefix("--par-").unwrap_or(arg);
        let (name, value) = arg.split_once('=').ok_or_else(|| {
            Error::new(
                ErrorCode::InvalidArg,
                format!("parameter override '{}' is not of the form Name=Value", arg),
            )
        })?;

        match name {
            "MaxThreadCount" => self.max_threads = parse_number(name, value)? as usize,
            "ThreadPriorities" => self.thread_priorities = parse_bool(name, value)?,
            "TimeoutThreadStart" => self.thread_start_timeout = parse_millis(name, value)?,
            "TimeoutThreadTerm" => self.thread_term_timeout = parse_millis(name, value)?,
            "TimeoutThreadHang" => self.thread_hang_timeout = parse_millis(name, value)?,
            "ThreadPollIntervalMin" => self.poll_interval_min = parse_millis(name, value)?,
            "ThreadPollIntervalMax" => self.poll_interval_max = parse_millis(name, value)?,
            "MonitorIntervalMin" => self.monitor_interval_min = parse_millis(name, value)?,
            "MonitorIntervalMax" => self.monitor_interval_max = parse_millis(name, value)?,
            "TimeoutComms" => self.comms_timeout = parse_millis(name, value)?,
            "TimeoutSync" => self.sync_timeout = parse_millis(name, value)?,
            "KeepAliveInterval" => self.keepalive_interval = parse_millis(name, value)?,
            "MaxMessageBytes" => self.max_message_bytes = parse_number(name, value)? as usize,
            "ReorderWindow" => self.reorder_window = parse_number(name, value)? as usize,
            "StreamBuffers" => {
                self.stream_buffers = (parse_number(name, value)? as usize).max(1)
            }
            "ShowTrace" => self.show_trace = parse_bool(name, value)?,
            _ => {
                return Err(Error::new(
                    ErrorCode::InvalidArg,
                    format!("unknown execution parameter '{}'", name),
                ))
            }
        }

        Ok(())
    }

    /// Applies every `--par-` argument of an argument list and returns the
    /// remaining arguments.
    pub fn apply_overrides<I, S>(&mut self, args: I) -> Result<Vec<String>, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rest = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            if arg.starts_with("--par-") {
                self.apply_override(arg)?;
            } else {
                rest.push(arg.to_owned());
            }
        }

        Ok(rest)
    }
}

impl Default for ExecParams {
    fn default() -> Self {
        Self {
            max_threads: 0,
            thread_priorities: true,
            thread_start_timeout: Duration::from_secs(2),
            thread_term_timeout: Duration::from_secs(5),
            thread_hang_timeout: Duration::from_secs(30),
            poll_interval_min: Duration::from_millis(5),
            poll_interval_max: Duration::from_millis(100),
            monitor_interval_min: Duration::from_millis(100),
            monitor_interval_max: Duration::from_secs(2),
            comms_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(5),
            max_message_bytes: 64 * 1024 * 1024,
            reorder_window: 64,
            stream_buffers: 4,
            show_trace: false,
        }
    }
}

impl fmt::Debug for ExecParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecParams")
            .field("max_threads", &self.max_threads)
            .field("thread_hang_timeout", &self.thread_hang_timeout)
            .field("comms_timeout", &self.comms_timeout)
            .finish_non_exhaustive()
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, Error> {
    value.trim().parse::<u64>().map_err(|_| {
        Error::new(
            ErrorCode::InvalidArg,
            format!("parameter '{}' expects an integer, got '{}'", name, value),
        )
    })
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, Error> {
    parse_number(name, value).map(Duration::from_millis)
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(Error::new(
            ErrorCode::InvalidArg,
            format!("parameter '{}' expects a boolean, got '{}'", name, value),
        )),
    }
}
