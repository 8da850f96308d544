//! Error types and error handling strategy.
//!
//! Errors fall into three tiers:
//!
//! - **Cooperative outcomes** (`Cancelled`): expected results of racing
//!   cancellation against completion. Returned as values, never raised.
//! - **Captured failures** (`TaskError::Panicked`, `RunError::Panicked`):
//!   a panic in user code, caught at the worker or driver boundary and
//!   encoded into the completion cell so the runtime survives.
//! - **Code errors**: invariant violations inside the scheduler itself
//!   (double reap, negative event accounting, send after close). These
//!   fail fast with a diagnostic panic; they indicate scheduler bugs,
//!   not user input.

use core::fmt;

/// An operation was cancelled before it could complete.
///
/// Cancellation is a cooperative, expected outcome: it is always
/// returned as a result variant and never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Payload from a caught panic.
///
/// Wraps the panic message for safe transport across thread and task
/// boundaries; the original boxed payload is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from the boxed payload of `catch_unwind`.
    pub(crate) fn from_any(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(message)
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The outcome of a worker task that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before it started executing.
    #[error("task was cancelled")]
    Cancelled,
    /// The task's closure panicked on the worker thread.
    #[error("task panicked: {0}")]
    Panicked(PanicPayload),
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A submission was made to a worker that no longer accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker is stopped and no longer accepts work")]
pub struct Stopped;

/// Why a scheduler run ended without producing the fiber's value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// The driver found no pending events and no source that could ever
    /// unblock a fiber: deadlock-by-starvation, diagnosed instead of
    /// hanging.
    #[error("scheduler starved: no pending events and no live producers")]
    Never,
    /// An explicit `abort` reached the driver.
    #[error("scheduler aborted by request")]
    AbortRequested,
    /// A fiber panicked on the driver thread.
    #[error("fiber panicked: {0}")]
    Panicked(PanicPayload),
}
