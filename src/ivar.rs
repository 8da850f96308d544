//! One-shot completion cells.
//!
//! An [`Ivar`] is the unit of synchronization between fibers and the
//! event sources feeding the scheduler: exactly one producer fills it,
//! exactly one fiber reads it. Every suspension point in the runtime
//! (task completion, timer firing, sleep expiry, process exit) resolves
//! through an ivar fill delivered by the driver.
//!
//! Fills are idempotent: the second fill of a cell is a no-op that
//! returns `false` and drops its value. This absorbs the race between a
//! cancellation fill and a late completion fill for the same cell, so
//! callers never need check-then-fill locking.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A one-shot completion cell.
///
/// Cloning an `Ivar` clones the handle, not the cell: all clones refer
/// to the same underlying slot.
pub struct Ivar<T> {
    inner: Arc<Mutex<State<T>>>,
}

enum State<T> {
    /// Not yet filled; holds the waker of a suspended reader, if any.
    Empty { waker: Option<Waker> },
    /// Filled, value not yet taken by the reader.
    Full(T),
    /// Filled and consumed.
    Taken,
}

impl<T> Ivar<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Empty { waker: None })),
        }
    }

    /// Completes the cell, waking the reader if one is suspended on it.
    ///
    /// Returns `true` if this call filled the cell; `false` if it was
    /// already filled (the value is dropped).
    pub fn fill(&self, value: T) -> bool {
        let waker = {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                State::Empty { waker } => {
                    let waker = waker.take();
                    *state = State::Full(value);
                    waker
                }
                State::Full(_) | State::Taken => return false,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Returns `true` once the cell has been filled (whether or not the
    /// value has been taken).
    #[must_use]
    pub fn is_filled(&self) -> bool {
        !matches!(&*self.inner.lock().unwrap(), State::Empty { .. })
    }

    /// Suspends the calling fiber until the cell is filled, then takes
    /// the value.
    ///
    /// # Panics
    ///
    /// Panics if the value was already taken by a previous read; a cell
    /// has exactly one reader.
    #[must_use]
    pub fn read(&self) -> Read<T> {
        Read { ivar: self.clone() }
    }
}

impl<T> Clone for Ivar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Ivar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Ivar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.lock().unwrap() {
            State::Empty { .. } => "empty",
            State::Full(_) => "full",
            State::Taken => "taken",
        };
        f.debug_struct("Ivar").field("state", &state).finish()
    }
}

/// Future returned by [`Ivar::read`].
pub struct Read<T> {
    ivar: Ivar<T>,
}

impl<T> Future for Read<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.ivar.inner.lock().unwrap();
        match &mut *state {
            State::Empty { waker } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Full(_) => {
                let State::Full(value) = std::mem::replace(&mut *state, State::Taken) else {
                    unreachable!();
                };
                Poll::Ready(value)
            }
            State::Taken => panic!("ivar read twice: the value was already taken"),
        }
    }
}
