//! Engine errors.
//!
//! Every fallible engine operation returns an [`Error`], which carries an
//! [`ErrorCode`] from a fixed taxonomy, a human-readable message and a trace
//! of annotations added while the error travelled up the call stack (for
//! instance the thread and the component that raised it).
//!
//! Errors that must outlive the operation that produced them, such as errors
//! raised on worker threads, are collected on an [`ErrorStack`] owned by the
//! engine and end up in the execution report.

use std::error;
use std::fmt;
use std::io;
use std::sync::Mutex;

/// Classification of an engine error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// An engine invariant was violated.
    Internal,
    /// A communication failure, including protocol violations by a peer.
    Comms,
    /// A peer did not send an expected message in time.
    CommsTimeout,
    /// A message arrived with a stale or too distant order number.
    OutOfOrderDelivery,
    /// A voice did not reach a synchronization barrier in time.
    SyncTimeout,
    /// The connect phase stopped making progress before completion.
    Deadlock,
    /// A worker thread stopped emitting heartbeats.
    ThreadHung,
    /// A thread could not start or was interrupted.
    ThreadError,
    /// A component did not follow the engine's usage rules.
    NotCompliant,
    /// A buffer could not be allocated.
    Memory,
    /// An arithmetic overflow.
    Overflow,
    /// A value cannot be represented in the engine's number formats.
    Unrepresentable,
    /// Execution was cancelled by the user or by a peer voice.
    Cancelled,
    /// An invalid argument or system description.
    InvalidArg,
    /// A handle that does not refer to a live object.
    InvalidHandle,
    /// An error raised by a component's own event handler.
    Component,
}

impl ErrorCode {
    const ALL: [Self; 16] = [
        Self::Internal,
        Self::Comms,
        Self::CommsTimeout,
        Self::OutOfOrderDelivery,
        Self::SyncTimeout,
        Self::Deadlock,
        Self::ThreadHung,
        Self::ThreadError,
        Self::NotCompliant,
        Self::Memory,
        Self::Overflow,
        Self::Unrepresentable,
        Self::Cancelled,
        Self::InvalidArg,
        Self::InvalidHandle,
        Self::Component,
    ];

    /// Parses a symbolic name as returned by [`symbol`](Self::symbol).
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.symbol() == symbol)
    }

    /// Returns the symbolic name of the code, as written in reports.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Internal => "E_INTERNAL",
            Self::Comms => "E_COMMS",
            Self::CommsTimeout => "E_COMMS_TIMEOUT",
            Self::OutOfOrderDelivery => "E_OUT_OF_ORDER_DELIVERY",
            Self::SyncTimeout => "E_SYNC_TIMEOUT",
            Self::Deadlock => "E_DEADLOCK",
            Self::ThreadHung => "E_THREAD_HUNG",
            Self::ThreadError => "E_THREAD_ERROR",
            Self::NotCompliant => "E_NOT_COMPLIANT",
            Self::Memory => "E_MEMORY",
            Self::Overflow => "E_OVERFLOW",
            Self::Unrepresentable => "E_UNREPRESENTABLE",
            Self::Cancelled => "E_CANCELLED",
            Self::InvalidArg => "E_INVALID_ARG",
            Self::InvalidHandle => "E_INVALID_HANDLE",
            Self::Component => "E_COMPONENT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// An engine error.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Error {
    code: ErrorCode,
    message: String,
    trace: Vec<String>,
}

impl Error {
    /// Creates an error with the specified code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Creates an error raised by a component.
    pub fn component(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Component, message)
    }

    /// Appends an annotation to the trace and returns the error.
    pub fn trace(mut self, note: impl Into<String>) -> Self {
        self.trace.push(note.into());
        self
    }

    /// Returns the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the trace annotations, innermost first.
    pub fn trace_lines(&self) -> &[String] {
        &self.trace
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("trace", &self.trace)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::CommsTimeout,
            io::ErrorKind::OutOfMemory => ErrorCode::Memory,
            _ => ErrorCode::Comms,
        };

        Error::new(code, e.to_string())
    }
}

/// A thread-safe collection of the errors raised during an execution.
#[derive(Default)]
pub struct ErrorStack {
    errors: Mutex<Vec<Error>>,
}

impl ErrorStack {
    /// Creates an empty error stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an error onto the stack.
    pub fn push(&self, error: Error) {
        tracing::debug!(code = %error.code(), "{}", error.message());
        self.errors.lock().unwrap().push(error);
    }

    /// Returns `true` if no error was pushed.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().unwrap().is_empty()
    }

    /// Returns `true` if an error with the specified code was pushed.
    pub fn contains(&self, code: ErrorCode) -> bool {
        self.errors.lock().unwrap().iter().any(|e| e.code == code)
    }

    /// Returns the collected errors.
    ///
    /// `E_THREAD_ERROR` entries are side effects of the interruption of
    /// threads blocked on a failing peer; they are left out whenever a more
    /// specific error is present.
    pub fn errors(&self) -> Vec<Error> {
        let errors = self.errors.lock().unwrap();
        let has_specific = errors.iter().any(|e| e.code != ErrorCode::ThreadError);

        errors
            .iter()
            .filter(|e| !has_specific || e.code != ErrorCode::ThreadError)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorStack ({} errors)", self.errors.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_accumulates() {
        let e = Error::new(ErrorCode::Comms, "lost peer")
            .trace("in channel to voice 1")
            .trace("during connect phase");

        assert_eq!(e.code(), ErrorCode::Comms);
        assert_eq!(e.trace_lines().len(), 2);
        assert_eq!(e.to_string(), "E_COMMS: lost peer");
    }

    #[test]
    fn symbols_round_trip() {
        assert_eq!(
            ErrorCode::from_symbol("E_UNREPRESENTABLE"),
            Some(ErrorCode::Unrepresentable)
        );
        assert_eq!(ErrorCode::from_symbol("E_NOPE"), None);
    }

    #[test]
    fn thread_errors_elided_when_specific_error_present() {
        let stack = ErrorStack::new();
        stack.push(Error::new(ErrorCode::ThreadError, "wait interrupted"));
        assert_eq!(stack.errors().len(), 1);

        stack.push(Error::new(ErrorCode::NotCompliant, "lag window exceeded"));
        let errors = stack.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), ErrorCode::NotCompliant);
        assert!(stack.contains(ErrorCode::ThreadError));
    }
}
