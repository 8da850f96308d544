//! Timers and sleepers, driven by a coarse tick loop.
//!
//! A flat table of armed timers plus a list of one-shot sleepers,
//! scanned by one dedicated thread every `timer_resolution`. A flat
//! scan is adequate at language-server scale (dozens of timers); a
//! deadline heap would slot in behind the same contract.
//!
//! Each [`Timer`] has at most one active arming. Re-arming an armed
//! timer displaces the previous arming with `Cancelled` — that is the
//! debounce behavior: overlapping schedules collapse and only the
//! latest survives.
//!
//! Within one tick, every fill produced is sorted by its scheduled
//! time before delivery, so two timers elapsing in the same tick are
//! observed in deadline order regardless of table iteration order.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::Cancelled;
use crate::event::{Event, Fill};
use crate::ivar::Ivar;
use crate::scheduler::{Scheduler, Shared};

/// Identity of a timer across re-armings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// How an arming resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerOutcome {
    Fired,
    Cancelled,
}

/// One active arming of a timer.
///
/// The delay is captured at `schedule` time: mutating the parent
/// timer's delay afterwards never moves an armed deadline.
pub(crate) struct Arming {
    scheduled_at: Instant,
    delay: Duration,
    cell: Ivar<TimerOutcome>,
}

/// A pending one-shot sleep. Never cancelled individually.
pub(crate) struct Sleeper {
    wake_at: Instant,
    cell: Ivar<()>,
}

/// Timer table and sleeper list, guarded by the scheduler's time mutex.
pub(crate) struct TimeState {
    pub(crate) timers: HashMap<TimerId, Arming>,
    pub(crate) sleepers: Vec<Sleeper>,
    next_id: u64,
}

impl TimeState {
    pub(crate) fn new() -> Self {
        Self {
            timers: HashMap::new(),
            sleepers: Vec::new(),
            next_id: 0,
        }
    }
}

/// A debounced timer bound to the scheduler that created it.
pub struct Timer {
    id: TimerId,
    delay: Cell<Duration>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Allocates a fresh timer. No scheduling side effect.
    #[must_use]
    pub fn create_timer(&self, delay: Duration) -> Timer {
        let id = {
            let mut time = self.shared.time.lock().unwrap();
            time.next_id += 1;
            TimerId(time.next_id)
        };
        Timer {
            id,
            delay: Cell::new(delay),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Suspends the calling fiber for `duration` (rounded up to timer
    /// resolution). Not cancellable.
    pub async fn sleep(&self, duration: Duration) {
        let cell = Ivar::new();
        {
            let mut time = self.shared.time.lock().unwrap();
            self.shared.add_events(1);
            time.sleepers.push(Sleeper {
                wake_at: Instant::now() + duration,
                cell: cell.clone(),
            });
        }
        cell.read().await;
    }
}

impl Timer {
    /// The delay applied to the *next* arming.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay.get()
    }

    /// Changes the delay for future armings. An already-armed deadline
    /// keeps the delay that was in force when it was scheduled.
    pub fn set_delay(&self, delay: Duration) {
        self.delay.set(delay);
    }

    /// Arms the timer (displacing any previous arming), waits for it
    /// to elapse, then runs `f`.
    ///
    /// A later `schedule` on the same timer displaces this arming and
    /// resolves it to `Err(Cancelled)` without running `f` — rapid
    /// re-schedules collapse to the latest.
    pub async fn schedule<A, F, Fut>(&self, f: F) -> Result<A, Cancelled>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = A>,
    {
        let cell = Ivar::new();
        let displaced = {
            let mut time = self.shared.time.lock().unwrap();
            let arming = Arming {
                scheduled_at: Instant::now(),
                delay: self.delay.get(),
                cell: cell.clone(),
            };
            match time.timers.insert(self.id, arming) {
                // The displaced arming's event promise transfers to the
                // new one; the counter is untouched.
                Some(old) => Some(old.cell),
                None => {
                    self.shared.add_events(1);
                    None
                }
            }
        };
        if let Some(old) = displaced {
            trace!(timer = ?self.id, "arming displaced by re-schedule");
            old.fill(TimerOutcome::Cancelled);
        }
        match cell.read().await {
            TimerOutcome::Cancelled => Err(Cancelled),
            TimerOutcome::Fired => Ok(f().await),
        }
    }

    /// Disarms the timer if armed; the pending `schedule` resolves to
    /// `Err(Cancelled)`. No-op on an unarmed timer.
    pub fn cancel(&self) {
        let removed = {
            let mut time = self.shared.time.lock().unwrap();
            time.timers.remove(&self.id)
        };
        if let Some(arming) = removed {
            self.shared.add_events(-1);
            arming.cell.fill(TimerOutcome::Cancelled);
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("delay", &self.delay.get())
            .finish()
    }
}

/// One pass over sleepers and timers. Fills produced in the pass are
/// sorted by scheduled time and delivered as a single batch.
pub(crate) fn tick(shared: &Shared, now: Instant) {
    let mut due: Vec<(Instant, Fill)> = Vec::new();
    {
        let mut time = shared.time.lock().unwrap();

        if !time.sleepers.is_empty() {
            let mut remaining = Vec::with_capacity(time.sleepers.len());
            for sleeper in std::mem::take(&mut time.sleepers) {
                if sleeper.wake_at <= now {
                    let cell = sleeper.cell;
                    let fill: Fill = Box::new(move || {
                        cell.fill(());
                    });
                    due.push((sleeper.wake_at, fill));
                } else {
                    remaining.push(sleeper);
                }
            }
            time.sleepers = remaining;
        }

        time.timers.retain(|id, arming| {
            let deadline = arming.scheduled_at + arming.delay;
            if deadline <= now {
                trace!(timer = ?id, "timer elapsed");
                let cell = arming.cell.clone();
                let fill: Fill = Box::new(move || {
                    cell.fill(TimerOutcome::Fired);
                });
                due.push((deadline, fill));
                false
            } else {
                true
            }
        });
    }

    if due.is_empty() {
        return;
    }
    // Stable by scheduled time: same-tick fills land in deadline order.
    due.sort_by_key(|(at, _)| *at);
    let events = due
        .into_iter()
        .map(|(_, fill)| Event::JobCompleted(fill))
        .collect();
    shared.deliver(events);
}

/// Body of the dedicated timer thread: tick at the configured cadence
/// until the scheduler stops.
pub(crate) fn timer_loop(shared: &Shared) {
    trace!("timer loop started");
    loop {
        {
            let time = shared.time.lock().unwrap();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            let (guard, _) = shared
                .timer_wake
                .wait_timeout(time, shared.timer_resolution)
                .unwrap();
            drop(guard);
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        tick(shared, Instant::now());
    }
    trace!("timer loop exited");
}

/// Shutdown helper: drains every armed timer with a `Cancelled` fill
/// and withdraws its event promise. Sleepers are left unfilled; the
/// run is over.
pub(crate) fn cancel_all_timers(shared: &Shared) {
    let drained: Vec<Arming> = {
        let mut time = shared.time.lock().unwrap();
        time.timers.drain().map(|(_, arming)| arming).collect()
    };
    if drained.is_empty() {
        return;
    }
    shared.add_events(-(drained.len() as i64));
    for arming in drained {
        arming.cell.fill(TimerOutcome::Cancelled);
    }
}
