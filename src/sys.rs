//! Thin safe wrappers around the Unix signal and wait syscalls.
//!
//! Every `unsafe` block in the crate lives here. The scheduler blocks
//! `SIGCHLD` and `SIGUSR1` on the driver thread before spawning any
//! background thread, so the mask is inherited everywhere and the
//! process watcher's `sigwait` is the only consumer of either signal.

use std::io;
use std::mem::MaybeUninit;

fn watched_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGCHLD);
        libc::sigaddset(set.as_mut_ptr(), libc::SIGUSR1);
        set.assume_init()
    }
}

/// Signal state captured at run start, restored at shutdown.
pub(crate) struct SavedSignals {
    prev_mask: libc::sigset_t,
    prev_chld: libc::sighandler_t,
}

/// Blocks `SIGCHLD`/`SIGUSR1` on the calling thread and resets the
/// `SIGCHLD` disposition to default (an inherited `SIG_IGN` would make
/// the kernel auto-reap children out from under the watcher).
///
/// Returns the prior state for [`restore_signals`].
pub(crate) fn block_watched_signals() -> SavedSignals {
    let set = watched_set();
    unsafe {
        let mut prev_mask = MaybeUninit::<libc::sigset_t>::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, prev_mask.as_mut_ptr());
        let prev_chld = libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        SavedSignals {
            prev_mask: prev_mask.assume_init(),
            prev_chld,
        }
    }
}

/// Restores the mask and `SIGCHLD` disposition captured at run start.
pub(crate) fn restore_signals(saved: &SavedSignals) {
    unsafe {
        if saved.prev_chld != libc::SIG_ERR {
            libc::signal(libc::SIGCHLD, saved.prev_chld);
        }
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved.prev_mask, std::ptr::null_mut());
    }
}

/// Waits until `SIGCHLD` or `SIGUSR1` is pending and consumes it.
///
/// On Linux this is `sigtimedwait` with a 50 ms fallback: a
/// process-directed signal can land on a thread that does not block it
/// (the host process may own threads the scheduler never saw) and be
/// discarded, so the watcher must not rely on delivery alone. Returns
/// `Ok(None)` on the timed fallback path.
#[cfg(target_os = "linux")]
pub(crate) fn wait_signal() -> io::Result<Option<libc::c_int>> {
    let set = watched_set();
    let timeout = libc::timespec {
        tv_sec: 0,
        tv_nsec: 50_000_000,
    };
    let rc = unsafe { libc::sigtimedwait(&set, std::ptr::null_mut(), &timeout) };
    if rc > 0 {
        Ok(Some(rc))
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN | libc::EINTR) => Ok(None),
            _ => Err(err),
        }
    }
}

/// Blocks until `SIGCHLD` or `SIGUSR1` is pending and consumes it.
///
/// Non-Linux Unix lacks a portable `sigtimedwait`; the watcher relies
/// on every thread in the process blocking the watched signals.
#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn wait_signal() -> io::Result<Option<libc::c_int>> {
    let set = watched_set();
    let mut signal: libc::c_int = 0;
    let rc = unsafe { libc::sigwait(&set, &mut signal) };
    if rc == 0 {
        Ok(Some(signal))
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Non-blocking reap of any child: `waitpid(-1, WNOHANG)`.
///
/// Returns the pid and raw wait status of a reaped child, or `None`
/// when no child is currently reapable (including `ECHILD`).
pub(crate) fn reap_any() -> Option<(libc::pid_t, libc::c_int)> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        Some((pid, status))
    } else {
        None
    }
}

/// Sends `signal` to `pid`.
pub(crate) fn kill(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Pops the watcher thread out of `sigwait` with a thread-directed
/// `SIGUSR1`. A process-directed signal could wake an unrelated
/// `sigwait`er when several schedulers coexist in one process.
pub(crate) fn wake_thread(thread: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(thread, libc::SIGUSR1);
    }
}
