//! Scheduler core: shared state, the fiber driver, and run lifecycle.
//!
//! A scheduler exists only for the duration of one [`Scheduler::run`].
//! The calling thread becomes the driver: it polls fibers until every
//! one of them is suspended, then blocks on the event channel for the
//! next completion fill. Worker threads, the timer loop, and the
//! process watcher feed that channel; nothing else does.
//!
//! The pending-event counter is the liveness ledger. Every promised
//! fill (a submitted job, an armed timer, a registered sleeper or pid,
//! a detached fiber) increments it, and exactly one decrement happens
//! per dequeued event (cancellation paths withdraw their promise
//! directly instead). When the driver finds the counter at zero with
//! every fiber blocked, no source can ever unblock the run: that is a
//! starvation deadlock, and it is reported as [`RunError::Never`]
//! rather than hanging.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{PanicPayload, RunError};
use crate::event::{Event, EventChannel, Fill, Received};
use crate::fiber::{self, FiberFuture, RunQueue};
use crate::timer::{self, TimeState};
use crate::worker::WorkerState;

#[cfg(unix)]
use crate::process::{self, ProcessEntry};
#[cfg(unix)]
use crate::sys;

/// Configuration knobs for a scheduler run.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Cadence of the timer loop. Coarser saves CPU; finer lowers the
    /// latency of timer and sleep fills.
    pub timer_resolution: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timer_resolution: Duration::from_millis(100),
        }
    }
}

impl SchedulerOptions {
    /// Creates options with the default 100 ms timer resolution.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timer-loop cadence.
    #[must_use]
    pub fn timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }
}

/// State shared between the driver and every background thread.
pub(crate) struct Shared {
    /// Count of promised-but-undelivered fills.
    pub(crate) events_pending: AtomicI64,
    /// The completion event FIFO the driver consumes.
    pub(crate) chan: EventChannel,
    /// Cleared once, at the start of shutdown; background loops poll it.
    pub(crate) running: AtomicBool,
    /// Ensures the abort sentinel and channel close happen once.
    aborted: AtomicBool,
    /// Armed timers and pending sleepers.
    pub(crate) time: Mutex<TimeState>,
    /// Nudges the timer loop out of its tick wait at shutdown.
    pub(crate) timer_wake: Condvar,
    /// Tick cadence.
    pub(crate) timer_resolution: Duration,
    /// Worker state handles, for drain-and-join at shutdown.
    pub(crate) workers: Mutex<Vec<Arc<WorkerState>>>,
    /// Worker thread name allocator.
    pub(crate) next_worker: AtomicUsize,
    /// Registered and already-reaped child processes.
    #[cfg(unix)]
    pub(crate) processes: Mutex<HashMap<libc::pid_t, ProcessEntry>>,
}

impl Shared {
    fn new(options: &SchedulerOptions) -> Self {
        Self {
            events_pending: AtomicI64::new(0),
            chan: EventChannel::new(),
            running: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            time: Mutex::new(TimeState::new()),
            timer_wake: Condvar::new(),
            timer_resolution: options.timer_resolution,
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
            #[cfg(unix)]
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Adjusts the pending-event counter; negative totals are scheduler
    /// bugs and fail fast.
    pub(crate) fn add_events(&self, n: i64) {
        let prev = self.events_pending.fetch_add(n, Ordering::SeqCst);
        assert!(
            prev + n >= 0,
            "events_pending went negative ({}): fill accounting bug",
            prev + n
        );
    }

    /// Producer path for background threads: enqueues completions,
    /// dropping them if shutdown already closed the channel.
    pub(crate) fn deliver(&self, events: Vec<Event>) {
        if !self.chan.try_send_many(events) {
            trace!("completion events dropped after channel close");
        }
    }

    /// The driver step: returns the next fill, or the reason the run
    /// must end.
    fn iter(&self) -> Result<Fill, RunError> {
        // A requested abort counts as pending work: its sentinel is in
        // the channel even when no fills are promised.
        if self.events_pending.load(Ordering::SeqCst) > 0 || self.aborted.load(Ordering::SeqCst) {
            match self.chan.get() {
                Received::Event(Event::JobCompleted(fill)) => {
                    self.add_events(-1);
                    Ok(fill)
                }
                Received::Event(Event::Abort) => {
                    debug!("abort sentinel reached the driver");
                    Err(RunError::AbortRequested)
                }
                // The channel closes only on the abort path; treat a
                // drained post-close channel the same way.
                Received::Closed => Err(RunError::AbortRequested),
            }
        } else {
            assert!(
                self.chan.is_empty(),
                "event channel non-empty while events_pending == 0"
            );
            warn!("all fibers blocked with no event source left; diagnosing starvation");
            Err(RunError::Never)
        }
    }
}

/// Driver-thread-only executor state.
struct ExecShared {
    /// Fibers detached since the last poll, not yet assigned an id.
    inbox: RefCell<Vec<FiberFuture>>,
    /// Ready fiber ids.
    queue: Arc<RunQueue>,
}

/// Handle to the running scheduler.
///
/// Obtained inside a run via [`Scheduler::current`] (or passed around
/// by cloning; clones are cheap). The handle is deliberately not
/// `Send`: every fiber-facing primitive executes on the driver thread.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
    exec: Rc<ExecShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Restores the previously installed scheduler when a run ends.
struct ContextGuard {
    prev: Option<Scheduler>,
}

impl ContextGuard {
    fn install(scheduler: Scheduler) -> Self {
        let prev = CURRENT.with(|slot| slot.borrow_mut().replace(scheduler));
        Self { prev }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|slot| *slot.borrow_mut() = prev);
    }
}

const MAIN_FIBER: u64 = 0;

impl Scheduler {
    /// Returns the scheduler the current fiber is running under.
    ///
    /// # Panics
    ///
    /// Panics when called outside a running scheduler.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|slot| slot.borrow().clone()).map_or_else(
            || panic!("Scheduler::current() called outside a running scheduler"),
            |scheduler| scheduler,
        )
    }

    /// Runs `fut` to completion on a fresh scheduler with default
    /// options.
    ///
    /// # Panics
    ///
    /// Panics if the run fails (starvation, abort, or a fiber panic);
    /// see [`Scheduler::run_result`] for the non-panicking form.
    pub fn run<T: 'static>(fut: impl Future<Output = T> + 'static) -> T {
        match Self::run_result(fut) {
            Ok(value) => value,
            Err(err) => panic!("scheduler run failed: {err}"),
        }
    }

    /// Runs `fut` to completion on a fresh scheduler with default
    /// options, returning the failure reason instead of panicking.
    pub fn run_result<T: 'static>(
        fut: impl Future<Output = T> + 'static,
    ) -> Result<T, RunError> {
        Self::run_result_with(SchedulerOptions::default(), fut)
    }

    /// Runs `fut` to completion on a fresh scheduler built from
    /// `options`.
    ///
    /// The calling thread hosts the driver for the whole run. On every
    /// exit path the run stops and joins its worker threads, cancels
    /// armed timers, kills residual child processes, restores the
    /// process signal state it installed, and joins the timer and
    /// watcher threads.
    pub fn run_result_with<T: 'static>(
        options: SchedulerOptions,
        fut: impl Future<Output = T> + 'static,
    ) -> Result<T, RunError> {
        #[cfg(unix)]
        let signals = sys::block_watched_signals();

        let shared = Arc::new(Shared::new(&options));
        debug!(resolution = ?options.timer_resolution, "scheduler starting");

        let timer_thread = thread::Builder::new()
            .name("fibersched-timer".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || timer::timer_loop(&shared)
            })
            .expect("failed to spawn timer thread");

        #[cfg(unix)]
        let watcher_thread = thread::Builder::new()
            .name("fibersched-process-watcher".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || process::watcher_loop(&shared)
            })
            .expect("failed to spawn process watcher thread");

        let scheduler = Self {
            shared: Arc::clone(&shared),
            exec: Rc::new(ExecShared {
                inbox: RefCell::new(Vec::new()),
                queue: Arc::new(RunQueue::new()),
            }),
        };

        let result = {
            let _ctx = ContextGuard::install(scheduler.clone());
            scheduler.drive(fut)
        };

        shared.running.store(false, Ordering::Release);

        let workers: Vec<Arc<WorkerState>> = shared.workers.lock().unwrap().drain(..).collect();
        for worker in &workers {
            worker.stop_and_join();
        }

        timer::cancel_all_timers(&shared);

        #[cfg(unix)]
        {
            process::killall(&shared, libc::SIGKILL);
            sys::restore_signals(&signals);
            use std::os::unix::thread::JoinHandleExt;
            sys::wake_thread(watcher_thread.as_pthread_t());
            let _ = watcher_thread.join();
        }

        {
            // Take the time lock so the notification cannot slip between
            // the loop's running check and its wait.
            let _time = shared.time.lock().unwrap();
            shared.timer_wake.notify_all();
        }
        let _ = timer_thread.join();

        if result.is_ok() {
            let remaining = shared.events_pending.load(Ordering::SeqCst);
            if remaining != 0 {
                warn!(remaining, "run completed with undelivered events");
            }
        }
        debug!("scheduler stopped");
        result
    }

    /// Launches `fut` as a background fiber.
    ///
    /// The fiber holds a pending-event promise for its whole lifetime,
    /// so the driver never diagnoses starvation while it can still make
    /// progress. A detached fiber that panics fails the run.
    pub fn detach(&self, fut: impl Future<Output = ()> + 'static) {
        self.shared.add_events(1);
        self.exec.inbox.borrow_mut().push(Box::pin(fut));
    }

    /// Requests run termination: enqueues the abort sentinel and closes
    /// the event channel. Idempotent.
    pub fn abort(&self) {
        if self.shared.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("abort requested");
        self.shared.chan.send_many(vec![Event::Abort]);
        self.shared.chan.close();
    }

    /// Current value of the pending-event counter. Diagnostic only.
    #[must_use]
    pub fn events_pending(&self) -> i64 {
        self.shared.events_pending.load(Ordering::SeqCst)
    }

    /// The driver loop: poll every ready fiber, then block for the next
    /// fill; repeat until the main fiber completes or the run dies.
    fn drive<T: 'static>(&self, fut: impl Future<Output = T> + 'static) -> Result<T, RunError> {
        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let main = {
            let slot = Rc::clone(&slot);
            async move {
                let value = fut.await;
                *slot.borrow_mut() = Some(value);
            }
        };

        let mut fibers: HashMap<u64, FiberFuture> = HashMap::new();
        let mut next_id: u64 = MAIN_FIBER + 1;
        fibers.insert(MAIN_FIBER, Box::pin(main));
        self.exec.queue.push(MAIN_FIBER);

        loop {
            while let Some(id) = self.exec.queue.pop() {
                let Some(fiber) = fibers.get_mut(&id) else {
                    // Stale wake for a completed fiber.
                    continue;
                };
                let waker = fiber::waker(id, Arc::clone(&self.exec.queue));
                let mut cx = Context::from_waker(&waker);
                match catch_unwind(AssertUnwindSafe(|| fiber.as_mut().poll(&mut cx))) {
                    Ok(Poll::Pending) => {}
                    Ok(Poll::Ready(())) => {
                        fibers.remove(&id);
                        if id != MAIN_FIBER {
                            trace!(fiber = id, "detached fiber completed");
                            self.shared.add_events(-1);
                        }
                    }
                    Err(payload) => {
                        return Err(RunError::Panicked(PanicPayload::from_any(payload.as_ref())));
                    }
                }
                // Fibers detached during that poll become runnable now.
                for detached in self.exec.inbox.borrow_mut().drain(..) {
                    let id = next_id;
                    next_id += 1;
                    fibers.insert(id, detached);
                    self.exec.queue.push(id);
                }
            }

            if let Some(value) = slot.borrow_mut().take() {
                return Ok(value);
            }

            match self.shared.iter() {
                Ok(fill) => fill(),
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("events_pending", &self.events_pending())
            .field("running", &self.shared.running.load(Ordering::Acquire))
            .finish()
    }
}
