//! Child-process watcher.
//!
//! One dedicated thread waits for `SIGCHLD` and reaps exited children
//! without blocking, publishing exit statuses as completion events. The
//! pid table resolves the inherent registration race: a child can exit
//! (and be reaped) before the spawning fiber registers its pid, in
//! which case the status is parked as a `Zombie` entry and handed over
//! the moment registration happens.
//!
//! The table mutex is held across the reap syscalls so that removing an
//! entry and reaping its pid are atomic with respect to registration —
//! otherwise a recycled pid could be matched against a stale entry.
//!
//! `waitpid(-1)` is process-global: at most one scheduler per process
//! should wait on child processes.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::event::Event;
use crate::ivar::Ivar;
use crate::scheduler::{Scheduler, Shared};
use crate::sys;

/// One tracked pid.
pub(crate) enum ProcessEntry {
    /// Registered and not yet reaped; the cell receives the raw wait
    /// status.
    Running(Ivar<libc::c_int>),
    /// Reaped before registration; the status is parked here.
    Zombie(libc::c_int),
}

impl Scheduler {
    /// Suspends the calling fiber until the child with `pid` exits, and
    /// returns its exit status.
    ///
    /// The pid must belong to a direct child of this process that no
    /// other code wait(2)s on.
    ///
    /// # Panics
    ///
    /// Panics if `pid` is already registered: waiting twice on one pid
    /// without an intervening reap is a caller bug (pid reuse).
    pub async fn wait_for_process(&self, pid: i32) -> ExitStatus {
        let cell: Ivar<libc::c_int> = Ivar::new();
        self.shared.add_events(1);
        let parked = {
            let mut table = self.shared.processes.lock().unwrap();
            match table.remove(&pid) {
                Some(ProcessEntry::Zombie(status)) => Some(status),
                Some(ProcessEntry::Running(_)) => {
                    panic!("pid {pid} registered twice without an intervening reap")
                }
                None => {
                    table.insert(pid, ProcessEntry::Running(cell.clone()));
                    None
                }
            }
        };
        if let Some(status) = parked {
            trace!(pid, "pid had already exited; completing from parked status");
            let cell = cell.clone();
            self.shared
                .deliver(vec![Event::JobCompleted(Box::new(move || {
                    cell.fill(status);
                }))]);
        }
        let status = cell.read().await;
        ExitStatus::from_raw(status)
    }
}

/// Body of the watcher thread: wait for `SIGCHLD`/`SIGUSR1`, then reap.
pub(crate) fn watcher_loop(shared: &Shared) {
    trace!("process watcher started");
    loop {
        if let Err(err) = sys::wait_signal() {
            debug!(%err, "sigwait failed");
        }
        if !shared.running.load(Ordering::Acquire) {
            // Children killed during shutdown should not linger as
            // zombies for the host process's lifetime.
            while sys::reap_any().is_some() {}
            trace!("process watcher exiting");
            return;
        }
        reap(shared);
    }
}

/// Non-blocking reap pass: collect every currently reapable child.
fn reap(shared: &Shared) {
    let mut table = shared.processes.lock().unwrap();
    while let Some((pid, status)) = sys::reap_any() {
        match table.remove(&pid) {
            Some(ProcessEntry::Running(cell)) => {
                trace!(pid, status, "child reaped");
                shared.deliver(vec![Event::JobCompleted(Box::new(move || {
                    cell.fill(status);
                }))]);
            }
            Some(ProcessEntry::Zombie(_)) => {
                panic!("pid {pid} reaped twice")
            }
            None => {
                trace!(pid, status, "child exited before registration; parking status");
                table.insert(pid, ProcessEntry::Zombie(status));
            }
        }
    }
}

/// Sends `signal` to every running registered pid. Delivery errors are
/// swallowed; the target may already be gone.
pub(crate) fn killall(shared: &Shared, signal: libc::c_int) {
    let table = shared.processes.lock().unwrap();
    for (pid, entry) in table.iter() {
        if matches!(entry, ProcessEntry::Running(_)) {
            debug!(pid, signal, "signalling residual child");
            let _ = sys::kill(*pid, signal);
        }
    }
}
