//! Blocking worker threads.
//!
//! A [`Worker`] owns one OS thread draining a FIFO of opaque blocking
//! jobs. Each job runs under `catch_unwind`; its result (value, caught
//! panic, or cancellation) reaches the submitting fiber through the
//! task's completion cell, filled by an event the driver dequeues. The
//! worker thread itself never dies to a job panic.
//!
//! Cancellation is strictly pre-execution: [`TaskHandle::cancel`]
//! succeeds only while the job is still queued. A job that has started
//! runs to completion and its result stands.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::error::{PanicPayload, Stopped, TaskError};
use crate::event::{Event, Fill};
use crate::ivar::Ivar;
use crate::scheduler::{Scheduler, Shared};

/// A queued, not-yet-executed job.
struct QueuedJob {
    id: u64,
    /// Runs the user closure and returns the fill that completes the
    /// task cell.
    run: Box<dyn FnOnce() -> Fill + Send>,
}

struct QueueInner {
    jobs: VecDeque<QueuedJob>,
    /// Cleared by `stop`; queued jobs still drain to completion.
    accepting: bool,
    next_job: u64,
}

/// State shared between a worker's handle, its thread, and the
/// scheduler's shutdown pass.
pub(crate) struct WorkerState {
    inner: Mutex<QueueInner>,
    available: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerState {
    /// Refuses new work, lets the thread drain the queue, and joins it.
    /// Idempotent.
    pub(crate) fn stop_and_join(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.accepting = false;
        }
        self.available.notify_all();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// A blocking worker thread owned by the scheduler.
///
/// Clones share the same thread and queue.
#[derive(Clone)]
pub struct Worker {
    state: Arc<WorkerState>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawns a new worker thread and registers it for shutdown.
    #[must_use]
    pub fn create_worker(&self) -> Worker {
        let index = self
            .shared
            .next_worker
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let worker = Worker::spawn(Arc::clone(&self.shared), index);
        self.shared
            .workers
            .lock()
            .unwrap()
            .push(Arc::clone(&worker.state));
        worker
    }
}

impl Worker {
    pub(crate) fn spawn(shared: Arc<Shared>, index: usize) -> Self {
        let state = Arc::new(WorkerState {
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                accepting: true,
                next_job: 0,
            }),
            available: Condvar::new(),
            thread: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name(format!("fibersched-worker-{index}"))
            .spawn({
                let state = Arc::clone(&state);
                let shared = Arc::clone(&shared);
                move || worker_loop(&state, &shared)
            })
            .expect("failed to spawn worker thread");
        *state.thread.lock().unwrap() = Some(handle);

        Self { state, shared }
    }

    /// Submits a blocking closure for execution on this worker.
    ///
    /// The pending-event promise is made before the job becomes
    /// observable in the queue, so the driver cannot diagnose
    /// starvation between submission and completion.
    pub fn submit<A, F>(&self, f: F) -> Result<TaskHandle<A>, Stopped>
    where
        A: Send + 'static,
        F: FnOnce() -> A + Send + 'static,
    {
        let cell: Ivar<Result<A, TaskError>> = Ivar::new();
        let id;
        {
            let mut inner = self.state.inner.lock().unwrap();
            if !inner.accepting {
                return Err(Stopped);
            }
            self.shared.add_events(1);
            id = inner.next_job;
            inner.next_job += 1;
            let job_cell = cell.clone();
            inner.jobs.push_back(QueuedJob {
                id,
                run: Box::new(move || {
                    let result = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                        TaskError::Panicked(PanicPayload::from_any(payload.as_ref()))
                    });
                    let fill: Fill = Box::new(move || {
                        job_cell.fill(result);
                    });
                    fill
                }),
            });
        }
        self.state.available.notify_one();
        Ok(TaskHandle {
            cell,
            ticket: id,
            worker: Arc::clone(&self.state),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Refuses new work, drains queued jobs to completion, and joins
    /// the thread. Idempotent.
    pub fn stop(&self) {
        self.state.stop_and_join();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.inner.lock().unwrap();
        f.debug_struct("Worker")
            .field("queued", &inner.jobs.len())
            .field("accepting", &inner.accepting)
            .finish()
    }
}

/// Handle to one submitted job.
pub struct TaskHandle<A> {
    cell: Ivar<Result<A, TaskError>>,
    ticket: u64,
    worker: Arc<WorkerState>,
    shared: Arc<Shared>,
}

impl<A: Send + 'static> TaskHandle<A> {
    /// Suspends until the job completes, was cancelled, or panicked.
    pub async fn wait(self) -> Result<A, TaskError> {
        self.cell.read().await
    }

    /// Like [`wait`](Self::wait) for tasks the caller never cancels.
    ///
    /// # Panics
    ///
    /// Panics if the task cell resolves to `Cancelled`: that means some
    /// path cancelled a task the caller promised not to, which is a
    /// caller bug.
    pub async fn wait_no_cancel(self) -> Result<A, PanicPayload> {
        match self.cell.read().await {
            Ok(value) => Ok(value),
            Err(TaskError::Panicked(payload)) => Err(payload),
            Err(TaskError::Cancelled) => {
                panic!("task cancelled while awaited with wait_no_cancel")
            }
        }
    }

    /// Cancels the job if it has not started executing.
    ///
    /// On success the task cell resolves to `Cancelled` through normal
    /// event delivery. Once the worker has picked the job up this is a
    /// no-op, as is a repeated cancel.
    pub fn cancel(&self) {
        let removed = {
            let mut inner = self.worker.inner.lock().unwrap();
            let before = inner.jobs.len();
            inner.jobs.retain(|job| job.id != self.ticket);
            inner.jobs.len() != before
        };
        if removed {
            trace!(ticket = self.ticket, "queued job cancelled");
            let cell = self.cell.clone();
            self.shared
                .deliver(vec![Event::JobCompleted(Box::new(move || {
                    cell.fill(Err(TaskError::Cancelled));
                }))]);
        }
    }
}

impl<A> std::fmt::Debug for TaskHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ticket", &self.ticket)
            .field("completed", &self.cell.is_filled())
            .finish()
    }
}

fn worker_loop(state: &WorkerState, shared: &Shared) {
    trace!("worker thread started");
    loop {
        let job = {
            let mut inner = state.inner.lock().unwrap();
            loop {
                if let Some(job) = inner.jobs.pop_front() {
                    break Some(job);
                }
                if !inner.accepting {
                    break None;
                }
                inner = state.available.wait(inner).unwrap();
            }
        };
        let Some(job) = job else {
            trace!("worker thread drained and exiting");
            return;
        };
        let fill = (job.run)();
        shared.deliver(vec![Event::JobCompleted(fill)]);
    }
}
