//! Execution report.
//!
//! A [`Report`] is produced by [`Engine::close`](super::Engine::close) on
//! every voice, whether the execution succeeded or not. It renders as
//! aligned text through `Display` or as an XML document through
//! [`Report::to_xml`].

use std::fmt::{self, Write};
use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::params::VoiceConfig;
use crate::thread::{PhaseTiming, ThreadId, ThreadState, ThreadTiming};
use crate::time::SampleRate;

/// Exit code of a successful execution.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code of an execution that ended with an error.
pub const EXIT_ERROR: i32 = 66;

/// Exit code reserved for invocation errors of a front end.
pub const EXIT_INVOCATION: i32 = 67;

/// Kind of component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ComponentKind {
    /// A process, which takes part in the data flow.
    Process,
    /// A utility.
    Utility,
}

impl ComponentKind {
    fn name(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Utility => "utility",
        }
    }
}

/// Summary of one engine thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadReport {
    /// Thread identifier.
    pub id: ThreadId,
    /// State when the report was made.
    pub state: ThreadState,
    /// Whether the thread was declared hung.
    pub hung: bool,
    /// Time spent in each phase.
    pub timing: ThreadTiming,
}

/// Summary of one component.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentReport {
    /// Component name.
    pub name: String,
    /// Component class.
    pub class: String,
    /// Process or utility.
    pub kind: ComponentKind,
    /// Sample rate, for processes whose timing was set.
    pub sample_rate: Option<SampleRate>,
    /// Number of `RunService` events.
    pub services: u64,
    /// Time spent in event handlers of the initialization phase.
    pub init: Duration,
    /// Time spent in event handlers of the run phase.
    pub run: Duration,
    /// Time spent in event handlers of the termination phase.
    pub term: Duration,
    /// Messages logged by the component.
    pub log: Vec<String>,
    /// State returned by `StateGet`, if any.
    pub final_state: Option<Vec<u8>>,
}

impl ComponentReport {
    pub(crate) fn new(name: &str, class: &str, kind: ComponentKind) -> Self {
        Self {
            name: name.to_owned(),
            class: class.to_owned(),
            kind,
            sample_rate: None,
            services: 0,
            init: Duration::ZERO,
            run: Duration::ZERO,
            term: Duration::ZERO,
            log: Vec::new(),
            final_state: None,
        }
    }
}

/// Snapshot of the execution environment.
#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    /// Operating system.
    pub os: &'static str,
    /// CPU architecture.
    pub arch: &'static str,
    /// Number of logical CPUs.
    pub cpus: usize,
    /// The local voice.
    pub voice: VoiceConfig,
    /// Negotiated base rate, if the execution got that far.
    pub base_rate: Option<SampleRate>,
    /// Requested stop time in seconds.
    pub stop_time: f64,
    /// Execution stop in base samples.
    pub execution_stop: u64,
    /// Number of worker threads.
    pub workers: usize,
}

impl Environment {
    pub(crate) fn new(voice: VoiceConfig) -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: num_cpus::get(),
            voice,
            base_rate: None,
            stop_time: 0.0,
            execution_stop: 0,
            workers: 0,
        }
    }
}

/// Outcome of an execution on one voice.
#[derive(Clone, Debug)]
pub struct Report {
    environment: Environment,
    threads: Vec<ThreadReport>,
    components: Vec<ComponentReport>,
    errors: Vec<Error>,
    wall_time: Duration,
}

impl Report {
    /// Assembles a report.
    ///
    /// `E_THREAD_ERROR` entries are dropped when a more specific error is
    /// present.
    pub(crate) fn new(
        environment: Environment,
        threads: Vec<ThreadReport>,
        components: Vec<ComponentReport>,
        mut errors: Vec<Error>,
        wall_time: Duration,
    ) -> Self {
        if errors.iter().any(|e| e.code() != ErrorCode::ThreadError) {
            errors.retain(|e| e.code() != ErrorCode::ThreadError);
        }

        Self {
            environment,
            threads,
            components,
            errors,
            wall_time,
        }
    }

    /// Returns the environment snapshot.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Returns the summaries of the engine threads.
    pub fn threads(&self) -> &[ThreadReport] {
        &self.threads
    }

    /// Returns the summaries of the local components.
    pub fn components(&self) -> &[ComponentReport] {
        &self.components
    }

    /// Returns the summary of a local component.
    pub fn component(&self, name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Returns the final state of a local component.
    pub fn final_state(&self, name: &str) -> Option<&[u8]> {
        self.component(name)
            .and_then(|c| c.final_state.as_deref())
    }

    /// Returns the errors of the execution, oldest first.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Returns `true` if the execution ended without error.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the wallclock duration of the execution.
    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    /// Returns the process exit code matching the outcome.
    pub fn exit_code(&self) -> i32 {
        if self.is_ok() {
            EXIT_SUCCESS
        } else {
            EXIT_ERROR
        }
    }

    /// Renders the report as an XML document.
    ///
    /// Error traces are included if `show_trace` is set.
    pub fn to_xml(&self, show_trace: bool) -> String {
        let mut xml = String::new();
        // Writing to a `String` cannot fail.
        let _ = self.write_xml(&mut xml, show_trace);

        xml
    }

    fn write_xml(&self, out: &mut String, show_trace: bool) -> fmt::Result {
        let env = &self.environment;
        writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
        writeln!(
            out,
            "<Report voice=\"{}\" voices=\"{}\" result=\"{}\">",
            env.voice.index,
            env.voice.count,
            if self.is_ok() { "ok" } else { "error" }
        )?;

        writeln!(out, "  <Environment>")?;
        writeln!(out, "    <OS>{}</OS>", escape(env.os))?;
        writeln!(out, "    <Arch>{}</Arch>", escape(env.arch))?;
        writeln!(out, "    <CPUs>{}</CPUs>", env.cpus)?;
        if let Some(base) = env.base_rate {
            writeln!(out, "    <BaseRate>{}</BaseRate>", base)?;
        }
        writeln!(out, "    <StopTime>{}</StopTime>", env.stop_time)?;
        writeln!(out, "    <ExecutionStop>{}</ExecutionStop>", env.execution_stop)?;
        writeln!(out, "    <Workers>{}</Workers>", env.workers)?;
        writeln!(
            out,
            "    <WallTime>{:.6}</WallTime>",
            self.wall_time.as_secs_f64()
        )?;
        writeln!(out, "  </Environment>")?;

        writeln!(out, "  <Threads>")?;
        for thread in &self.threads {
            writeln!(
                out,
                "    <Thread id=\"{}\" state=\"{:?}\" hung=\"{}\">",
                thread.id, thread.state, thread.hung
            )?;
            for (phase, timing) in [
                ("Init", &thread.timing.init),
                ("Run", &thread.timing.run),
                ("Term", &thread.timing.term),
            ] {
                writeln!(
                    out,
                    "      <{} wall=\"{:.6}\" user=\"{:.6}\" kernel=\"{:.6}\"/>",
                    phase,
                    timing.wall.as_secs_f64(),
                    timing.user.as_secs_f64(),
                    timing.kernel.as_secs_f64()
                )?;
            }
            writeln!(out, "    </Thread>")?;
        }
        writeln!(out, "  </Threads>")?;

        writeln!(out, "  <Components>")?;
        for c in &self.components {
            write!(
                out,
                "    <Component name=\"{}\" class=\"{}\" kind=\"{}\"",
                escape(&c.name),
                escape(&c.class),
                c.kind.name()
            )?;
            if let Some(rate) = c.sample_rate {
                write!(out, " rate=\"{}\"", rate)?;
            }
            writeln!(out, " services=\"{}\">", c.services)?;
            writeln!(
                out,
                "      <Time init=\"{:.6}\" run=\"{:.6}\" term=\"{:.6}\"/>",
                c.init.as_secs_f64(),
                c.run.as_secs_f64(),
                c.term.as_secs_f64()
            )?;
            for line in &c.log {
                writeln!(out, "      <Log>{}</Log>", escape(line))?;
            }
            writeln!(out, "    </Component>")?;
        }
        writeln!(out, "  </Components>")?;

        writeln!(out, "  <Errors>")?;
        for e in &self.errors {
            writeln!(out, "    <Error code=\"{}\">", e.code())?;
            writeln!(out, "      <Message>{}</Message>", escape(e.message()))?;
            if show_trace {
                for line in e.trace_lines() {
                    writeln!(out, "      <Trace>{}</Trace>", escape(line))?;
                }
            }
            writeln!(out, "    </Error>")?;
        }
        writeln!(out, "  </Errors>")?;
        writeln!(out, "</Report>")
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env = &self.environment;
        writeln!(
            f,
            "voice {} of {} on {}/{} ({} CPUs), {} workers, {:.3} s",
            env.voice.index,
            env.voice.count,
            env.os,
            env.arch,
            env.cpus,
            env.workers,
            self.wall_time.as_secs_f64()
        )?;
        if let Some(base) = env.base_rate {
            writeln!(
                f,
                "base rate {} Hz, stop {} s ({} samples)",
                base, env.stop_time, env.execution_stop
            )?;
        }

        let width = self
            .threads
            .iter()
            .map(|t| t.id.to_string().len())
            .max()
            .unwrap_or(0);
        for t in &self.threads {
            let total = |p: &PhaseTiming| p.wall.as_secs_f64();
            writeln!(
                f,
                "  {:<width$}  {:<10}  init {:>9.3}  run {:>9.3}  term {:>9.3}{}",
                t.id.to_string(),
                format!("{:?}", t.state),
                total(&t.timing.init),
                total(&t.timing.run),
                total(&t.timing.term),
                if t.hung { "  HUNG" } else { "" },
                width = width
            )?;
        }

        let width = self.components.iter().map(|c| c.name.len()).max().unwrap_or(0);
        for c in &self.components {
            writeln!(
                f,
                "  {:<width$}  {:<7}  {:>8} services  init {:>9.3}  run {:>9.3}  term {:>9.3}",
                c.name,
                c.kind.name(),
                c.services,
                c.init.as_secs_f64(),
                c.run.as_secs_f64(),
                c.term.as_secs_f64(),
                width = width
            )?;
        }

        if self.errors.is_empty() {
            write!(f, "completed successfully")
        } else {
            for (i, e) in self.errors.iter().enumerate() {
                if i > 0 {
                    writeln!(f)?;
                }
                write!(f, "{}: {}", e.code(), e.message())?;
            }
            Ok(())
        }
    }
}

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }

    escaped
}
