//! The event channel between background producers and the fiber driver.
//!
//! Worker completions, timer firings, and process reaps all arrive here
//! as [`Event`]s. The channel is a plain multi-producer single-consumer
//! FIFO: the driver is the sole consumer and blocks in [`EventChannel::get`]
//! whenever every fiber is suspended. Ordering is FIFO per producer;
//! inter-producer order is arrival order.
//!
//! The channel closes exactly once, when `abort` fires. Producing on a
//! closed channel through [`EventChannel::send_many`] is a programming
//! error; background threads racing shutdown use
//! [`EventChannel::try_send_many`] instead, whose dropped events simply
//! leave their cells unfilled on the way out.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A fill action: completes one ivar when executed on the driver thread.
pub type Fill = Box<dyn FnOnce() + Send + 'static>;

/// A completion event consumed by the fiber driver.
pub enum Event {
    /// A background job finished; executing the fill completes its cell.
    JobCompleted(Fill),
    /// Terminal sentinel enqueued by `abort`.
    Abort,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JobCompleted(_) => f.write_str("JobCompleted(..)"),
            Self::Abort => f.write_str("Abort"),
        }
    }
}

/// Result of a blocking [`EventChannel::get`].
#[derive(Debug)]
pub enum Received {
    /// The next event in FIFO order.
    Event(Event),
    /// The channel is closed and drained; only observed during shutdown.
    Closed,
}

struct ChannelState {
    queue: VecDeque<Event>,
    closed: bool,
}

/// Thread-safe FIFO of completion events with a single blocking consumer.
pub struct EventChannel {
    state: Mutex<ChannelState>,
    available: Condvar,
}

impl EventChannel {
    /// Creates an open, empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a batch of events, preserving the batch's order.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed: every legitimate producer is
    /// stopped before shutdown closes the channel.
    pub fn send_many(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            assert!(!state.closed, "event channel used after close");
            state.queue.extend(events);
        }
        self.available.notify_one();
    }

    /// Shutdown-tolerant variant of [`send_many`](Self::send_many):
    /// returns `false` and drops the batch if the channel is closed.
    pub fn try_send_many(&self, events: Vec<Event>) -> bool {
        if events.is_empty() {
            return true;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            state.queue.extend(events);
        }
        self.available.notify_one();
        true
    }

    /// Blocks until an event is available and pops it.
    ///
    /// Returns [`Received::Closed`] only when the channel is closed and
    /// fully drained.
    pub fn get(&self) -> Received {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Received::Event(event);
            }
            if state.closed {
                return Received::Closed;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Returns `true` if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    /// Closes the channel, waking the consumer if it is blocked.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("EventChannel")
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}
