//! Fibersched: a cooperative fiber scheduler for language-server
//! processes.
//!
//! # Overview
//!
//! One calling thread drives user fibers (plain futures) to completion
//! while three kinds of background machinery feed it completion
//! events: blocking worker threads, a coarse-resolution timer loop,
//! and a child-process watcher. Events flow through a single FIFO
//! channel; the driver dequeues them one at a time and fills the
//! one-shot cells fibers suspend on.
//!
//! # Core Guarantees
//!
//! - **Exact accounting**: every promised completion is counted; the
//!   counter decrements exactly once per delivered event
//! - **Deadlock is diagnosed**: when every fiber is blocked and no
//!   source can produce an event, the run ends with `Never` instead of
//!   hanging
//! - **Cancellation is a value**: cancelled tasks and timers resolve
//!   to `Cancelled` results; nothing unwinds through user code
//! - **Panics are contained**: a panicking job is captured into its
//!   task cell; the worker thread survives
//! - **Deterministic shutdown**: every exit path stops and joins all
//!   background threads and kills residual children
//!
//! # Module Structure
//!
//! - [`ivar`]: one-shot completion cells fibers suspend on
//! - [`event`]: the completion-event channel between producers and the
//!   driver
//! - [`worker`]: blocking worker threads with FIFO queues and
//!   pre-execution cancellation
//! - [`timer`]: debounced timers and sleepers on a coarse tick loop
//! - [`scheduler`]: shared state, the fiber driver, and run lifecycle
//! - [`error`]: error and outcome types
//!
//! # Example
//!
//! ```ignore
//! use fibersched::Scheduler;
//! use std::time::Duration;
//!
//! let answer = Scheduler::run(async {
//!     let worker = Scheduler::current().create_worker();
//!     let task = worker.submit(|| expensive_blocking_call()).unwrap();
//!     fibersched::sleep(Duration::from_millis(100)).await;
//!     task.wait().await.unwrap()
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod event;
mod fiber;
pub mod ivar;
#[cfg(unix)]
mod process;
pub mod scheduler;
#[cfg(unix)]
mod sys;
pub mod timer;
pub mod worker;

pub use error::{Cancelled, PanicPayload, RunError, Stopped, TaskError};
pub use ivar::Ivar;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use timer::Timer;
pub use worker::{TaskHandle, Worker};

use std::future::Future;
use std::time::Duration;

/// Suspends the calling fiber for `duration`. Not cancellable.
///
/// Convenience for [`Scheduler::sleep`] on the current scheduler.
pub async fn sleep(duration: Duration) {
    Scheduler::current().sleep(duration).await;
}

/// Launches `fut` as a background fiber on the current scheduler.
///
/// Convenience for [`Scheduler::detach`].
pub fn detach(fut: impl Future<Output = ()> + 'static) {
    Scheduler::current().detach(fut);
}

/// Requests termination of the current run.
///
/// Convenience for [`Scheduler::abort`].
pub fn abort() {
    Scheduler::current().abort();
}

/// Waits for the child process with `pid` to exit.
///
/// Convenience for [`Scheduler::wait_for_process`].
#[cfg(unix)]
pub async fn wait_for_process(pid: i32) -> std::process::ExitStatus {
    Scheduler::current().wait_for_process(pid).await
}
