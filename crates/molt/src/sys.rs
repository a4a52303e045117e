//! The OS seam
//!
//! The interposition layer (out of scope here) hands the controller a table
//! of the *real* OS operations to delegate to; this module is that table.
//! [`Sys`] is the contract, [`LibcSys`] the production implementation, and
//! the test build carries an in-memory fake so the controller's state
//! machine can be exercised without touching the real descriptor table.
//!
//! `accept4`'s peer-address out-pointers pass through untouched: the
//! controller never inspects them, it only forwards what the intercepted
//! caller supplied.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::{c_int, pid_t};

/// Table of real OS operations the controller delegates to.
pub trait Sys: Send + Sync {
    fn bind(&self, fd: RawFd, addr: &[u8]) -> io::Result<()>;
    fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()>;
    fn accept4(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: c_int,
    ) -> io::Result<RawFd>;
    fn close(&self, fd: RawFd) -> io::Result<()>;
    fn dup(&self, fd: RawFd) -> io::Result<RawFd>;
    fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<RawFd>;
    fn dup3(&self, src: RawFd, dst: RawFd, flags: c_int) -> io::Result<RawFd>;
    fn fork(&self) -> io::Result<pid_t>;
    /// Terminate the process. Never returns in production; the fake
    /// records the status and does return, so callers must be prepared to
    /// simply unwind afterwards.
    fn exit(&self, status: c_int);
    fn wait(&self, status: *mut c_int) -> io::Result<pid_t>;
    fn waitpid(&self, pid: pid_t, status: *mut c_int, options: c_int) -> io::Result<pid_t>;

    /// Non-reaping peek: is any descendant sitting in a waitable state?
    fn waitable_child(&self) -> io::Result<bool>;

    /// Block until `fd` is readable. Fails with EINTR when a signal lands;
    /// that is the cancellation path, so no retry here.
    fn poll_in(&self, fd: RawFd) -> io::Result<()>;

    fn pipe(&self) -> io::Result<(RawFd, RawFd)>;
    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()>;
    fn set_reuseport(&self, fd: RawFd) -> io::Result<()>;

    /// Build a drain-time dummy listener: a connected loopback pair with
    /// exactly one client queued for accept. Returns (server, client).
    fn dummy_server(&self) -> io::Result<(RawFd, RawFd)>;

    fn open_null(&self) -> io::Result<RawFd>;
    /// Current file offset, -1 when not seekable.
    fn current_offset(&self, fd: RawFd) -> i64;
    /// Best-effort restore of a saved offset.
    fn seek_to(&self, fd: RawFd, offset: i64);
    /// Best-effort unlink.
    fn unlink(&self, path: &Path);

    /// Descriptor-number ceiling for scans (RLIMIT_NOFILE hard limit).
    fn max_fd(&self) -> RawFd;

    /// Block the restart signals around the fork window, so a racing
    /// signal cannot write into a pipe still shared with the parent.
    fn block_restart_signal(&self);
    fn unblock_restart_signal(&self);
    /// Mask restart signals for good just before exec; the next
    /// generation unmasks once its own handlers are installed.
    fn mask_handoff_signals(&self);

    /// Best-effort restore of a working directory.
    fn chdir(&self, path: &CStr);

    /// Replace the process image. Returns only on failure.
    fn execve(&self, exe: &CStr, args: &[CString], env: &[CString]) -> io::Result<()>;
}

fn cvt_i(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Production implementation: straight libc.
pub struct LibcSys;

impl LibcSys {
    fn sigmask(how: c_int, signals: &[c_int]) {
        unsafe {
            let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            for &sig in signals {
                libc::sigaddset(set.as_mut_ptr(), sig);
            }
            libc::pthread_sigmask(how, set.as_ptr(), std::ptr::null_mut());
        }
    }
}

impl Sys for LibcSys {
    fn bind(&self, fd: RawFd, addr: &[u8]) -> io::Result<()> {
        cvt_i(unsafe {
            libc::bind(
                fd,
                addr.as_ptr() as *const libc::sockaddr,
                addr.len() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()> {
        cvt_i(unsafe { libc::listen(fd, backlog) }).map(|_| ())
    }

    fn accept4(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: c_int,
    ) -> io::Result<RawFd> {
        cvt_i(unsafe { libc::accept4(fd, addr, addrlen, flags) })
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt_i(unsafe { libc::close(fd) }).map(|_| ())
    }

    fn dup(&self, fd: RawFd) -> io::Result<RawFd> {
        cvt_i(unsafe { libc::dup(fd) })
    }

    fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<RawFd> {
        cvt_i(unsafe { libc::dup2(src, dst) })
    }

    fn dup3(&self, src: RawFd, dst: RawFd, flags: c_int) -> io::Result<RawFd> {
        cvt_i(unsafe { libc::dup3(src, dst, flags) })
    }

    fn fork(&self) -> io::Result<pid_t> {
        cvt_i(unsafe { libc::fork() })
    }

    fn exit(&self, status: c_int) {
        unsafe { libc::exit(status) }
    }

    fn wait(&self, status: *mut c_int) -> io::Result<pid_t> {
        cvt_i(unsafe { libc::wait(status) })
    }

    fn waitpid(&self, pid: pid_t, status: *mut c_int, options: c_int) -> io::Result<pid_t> {
        cvt_i(unsafe { libc::waitpid(pid, status, options) })
    }

    fn waitable_child(&self) -> io::Result<bool> {
        loop {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::waitid(
                    libc::P_ALL,
                    0,
                    &mut info,
                    libc::WNOHANG | libc::WNOWAIT | libc::WEXITED,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ECHILD) => return Ok(false),
                    _ => return Err(err),
                }
            }
            // WNOHANG leaves si_pid zero when no child is waitable yet.
            return Ok(unsafe { info.si_pid() } != 0);
        }
    }

    fn poll_in(&self, fd: RawFd) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        cvt_i(unsafe { libc::poll(&mut pfd, 1, -1) }).map(|_| ())
    }

    fn pipe(&self) -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        cvt_i(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        Ok((fds[0], fds[1]))
    }

    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()> {
        let flags = cvt_i(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        cvt_i(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
    }

    fn set_reuseport(&self, fd: RawFd) -> io::Result<()> {
        let optval: c_int = 1;
        cvt_i(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const c_int as *const libc::c_void,
                std::mem::size_of::<c_int>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    fn dummy_server(&self) -> io::Result<(RawFd, RawFd)> {
        static SERIAL: AtomicU64 = AtomicU64::new(0);

        let path = format!(
            "/tmp/.molt-{}-{}",
            unsafe { libc::getpid() },
            SERIAL.fetch_add(1, Ordering::Relaxed)
        );
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.len() >= addr.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "dummy socket path too long",
            ));
        }
        for (slot, &b) in addr.sun_path.iter_mut().zip(bytes) {
            *slot = b as _;
        }
        let addr_ptr = &addr as *const libc::sockaddr_un as *const libc::sockaddr;
        let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

        let close_all = |fds: &[RawFd]| {
            for &fd in fds {
                unsafe { libc::close(fd) };
            }
        };

        unsafe {
            let server = cvt_i(libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0))?;
            if libc::fcntl(server, libc::F_SETFD, libc::FD_CLOEXEC) < 0
                || libc::bind(server, addr_ptr, addr_len) < 0
                || libc::listen(server, 1) < 0
            {
                let err = io::Error::last_os_error();
                close_all(&[server]);
                return Err(err);
            }

            let client = match cvt_i(libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0)) {
                Ok(fd) => fd,
                Err(err) => {
                    close_all(&[server]);
                    libc::unlink(path.as_ptr() as *const libc::c_char);
                    return Err(err);
                }
            };
            if libc::fcntl(client, libc::F_SETFD, libc::FD_CLOEXEC) < 0
                || libc::connect(client, addr_ptr, addr_len) < 0
            {
                let err = io::Error::last_os_error();
                close_all(&[server, client]);
                libc::unlink(path.as_ptr() as *const libc::c_char);
                return Err(err);
            }

            // Drain the server side so the queued client is half-closed:
            // the one accept it answers hands back a dead peer.
            match cvt_i(libc::accept(server, std::ptr::null_mut(), std::ptr::null_mut())) {
                Ok(accepted) => {
                    libc::close(accepted);
                }
                Err(err) => {
                    close_all(&[server, client]);
                    libc::unlink(path.as_ptr() as *const libc::c_char);
                    return Err(err);
                }
            }

            // The path served its purpose; the pair lives on anonymously.
            let cpath = CString::new(path).unwrap_or_default();
            libc::unlink(cpath.as_ptr());

            Ok((server, client))
        }
    }

    fn open_null(&self) -> io::Result<RawFd> {
        cvt_i(unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR) })
    }

    fn current_offset(&self, fd: RawFd) -> i64 {
        unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) as i64 }
    }

    fn seek_to(&self, fd: RawFd, offset: i64) {
        unsafe { libc::lseek(fd, offset as libc::off_t, libc::SEEK_SET) };
    }

    fn unlink(&self, path: &Path) {
        use std::os::unix::ffi::OsStrExt;
        if let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) {
            let rc = unsafe { libc::unlink(cpath.as_ptr()) };
            if rc < 0 {
                log::debug!("unlink {:?} failed: {}", path, io::Error::last_os_error());
            }
        }
    }

    fn max_fd(&self) -> RawFd {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } < 0 {
            return 1024;
        }
        rlim.rlim_max.min(1 << 20) as RawFd
    }

    fn block_restart_signal(&self) {
        Self::sigmask(libc::SIG_BLOCK, &[libc::SIGHUP, libc::SIGUSR2]);
    }

    fn unblock_restart_signal(&self) {
        Self::sigmask(libc::SIG_UNBLOCK, &[libc::SIGHUP, libc::SIGUSR2]);
    }

    fn mask_handoff_signals(&self) {
        Self::sigmask(
            libc::SIG_BLOCK,
            &[libc::SIGHUP, libc::SIGTERM, libc::SIGUSR2],
        );
    }

    fn chdir(&self, path: &CStr) {
        let rc = unsafe { libc::chdir(path.as_ptr()) };
        if rc < 0 {
            log::debug!("chdir {:?} failed: {}", path, io::Error::last_os_error());
        }
    }

    fn execve(&self, exe: &CStr, args: &[CString], env: &[CString]) -> io::Result<()> {
        let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        unsafe { libc::execve(exe.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        Err(io::Error::last_os_error())
    }
}
