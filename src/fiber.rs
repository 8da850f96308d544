//! Fiber bookkeeping for the single-threaded driver.
//!
//! Fibers are plain futures polled on the calling thread. This module
//! provides the run queue of ready fiber ids and the waker that pushes
//! a fiber back onto it when one of its ivars fills. All scheduling
//! decisions live in the driver loop; a fiber only ever becomes ready
//! through its waker.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

/// A fiber body, pinned and type-erased. Fibers never leave the driver
/// thread, so no `Send` bound.
pub(crate) type FiberFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// FIFO of fiber ids ready to be polled.
///
/// Duplicate ids are tolerated: the driver skips ids whose fiber has
/// already completed, and a spurious extra poll is harmless under the
/// `Future` contract.
pub(crate) struct RunQueue {
    ready: Mutex<VecDeque<u64>>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, id: u64) {
        self.ready.lock().unwrap().push_back(id);
    }

    pub(crate) fn pop(&self) -> Option<u64> {
        self.ready.lock().unwrap().pop_front()
    }
}

struct FiberWaker {
    id: u64,
    queue: Arc<RunQueue>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

/// Builds the waker that re-queues fiber `id` when invoked.
pub(crate) fn waker(id: u64, queue: Arc<RunQueue>) -> Waker {
    Waker::from(Arc::new(FiberWaker { id, queue }))
}
