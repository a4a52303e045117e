//! Restart signal plumbing
//!
//! A restart signal can land on any thread, possibly one holding locks, so
//! the handler itself must do almost nothing: it performs one retrying
//! non-blocking write to a private pipe and gets out. A dedicated worker
//! thread blocks on the pipe's read end and drives the actual state
//! transition, where taking locks and allocating are safe.
//!
//! The pipe's write end lives in a process-global atomic because a signal
//! handler has no way to reach the controller object; it is the one piece
//! of state in this crate that is not owned by the controller.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use libc::c_int;

use crate::restart::Controller;

/// Write end of the notify pipe, or -1. Owned by the signal handler once
/// armed: the handler closes it after the first delivered notification.
static NOTIFY_WR: AtomicI32 = AtomicI32::new(-1);

/// Read end of the notify pipe, or -1. Remembered only so a fork child
/// can close the end it inherited from its parent.
static NOTIFY_RD: AtomicI32 = AtomicI32::new(-1);

/// The restart signals molt listens for.
pub const RESTART_SIGNALS: [c_int; 2] = [libc::SIGHUP, libc::SIGUSR2];

extern "C" fn restart_handler(_signo: c_int) {
    // Async-signal-safe territory: write, close, nothing else.
    let fd = NOTIFY_WR.swap(-1, Ordering::SeqCst);
    if fd < 0 {
        // Already fired this generation.
        return;
    }
    loop {
        let byte = b'R';
        let rc = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        if rc == 1 {
            unsafe { libc::close(fd) };
            return;
        }
        if rc == 0 {
            continue;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => {
                // Nothing sensible left to do from a handler.
                unsafe { libc::close(fd) };
                return;
            }
        }
    }
}

/// Create the notify pipe and spawn the worker that consumes it.
///
/// Safe to call again in a fork child: any inherited pipe ends are closed
/// first (the parent's worker thread did not survive the fork).
pub(crate) fn spawn_restart_worker(controller: Arc<Controller>) -> io::Result<()> {
    let stale_wr = NOTIFY_WR.swap(-1, Ordering::SeqCst);
    if stale_wr >= 0 {
        unsafe { libc::close(stale_wr) };
    }
    let stale_rd = NOTIFY_RD.swap(-1, Ordering::SeqCst);
    if stale_rd >= 0 {
        unsafe { libc::close(stale_rd) };
    }

    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let (rd, wr) = (fds[0], fds[1]);
    // The pipe must not leak into the next process image.
    for fd in [rd, wr] {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(rd);
                libc::close(wr);
            }
            return Err(err);
        }
    }

    NOTIFY_RD.store(rd, Ordering::SeqCst);
    NOTIFY_WR.store(wr, Ordering::SeqCst);

    thread::Builder::new()
        .name("molt-restart".into())
        .spawn(move || {
            wait_for_notification(rd);
            unsafe { libc::close(rd) };
            NOTIFY_RD.store(-1, Ordering::SeqCst);
            log::debug!("restart notification received");
            controller.restart();
        })
        .map(|_| ())
}

/// Block until the handler writes its byte (or the pipe dies, which we
/// treat the same way rather than leave the process restart-deaf).
fn wait_for_notification(rd: RawFd) {
    loop {
        let mut byte = 0u8;
        let rc = unsafe { libc::read(rd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if rc == 1 {
            return;
        }
        if rc == 0 {
            log::warn!("restart pipe closed unexpectedly");
            return;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => {
                log::warn!("restart pipe read failed");
                return;
            }
        }
    }
}

/// Install the restart signal handlers and unmask them.
///
/// The signals may have been deliberately blocked across our own exec to
/// cover the window before the handlers exist, so unmasking here is not
/// optional.
pub(crate) fn install_handlers() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = restart_handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in RESTART_SIGNALS {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        for sig in [libc::SIGHUP, libc::SIGTERM, libc::SIGUSR2] {
            libc::sigaddset(set.as_mut_ptr(), sig);
        }
        libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_ptr(), std::ptr::null_mut());
    }
    Ok(())
}
