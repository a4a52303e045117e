//! The restart controller
//!
//! One controller instance owns the process's descriptor bookkeeping: the
//! fd registry, the record arena, and the drain state machine. Every
//! intercepted descriptor operation funnels through here, takes the
//! process-wide lock, adjusts the bookkeeping, and delegates to the real
//! OS through the [`Sys`](crate::sys::Sys) table.
//!
//! The lock is reentrant because a drain can start from inside another
//! operation (a close that completes the drain ends up forking or
//! replacing the image while the close still holds the lock).

mod drain;
mod handoff;

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::{c_int, pid_t};
use parking_lot::ReentrantMutex;

use molt_core::{BoundSocket, FdRegistry, KindCounts, RecordArena, RecordHandle, RecordKind};

use crate::config::{Config, ExitStrategy};
use crate::image::ProcessImage;
use crate::signal;
use crate::sys::{LibcSys, Sys};

/// Drain phase of the current process generation. Moves from `Running`
/// to `Exiting` exactly once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exiting,
}

/// Lock-protected mutable state.
pub(crate) struct Core {
    pub(crate) registry: FdRegistry,
    pub(crate) arena: RecordArena,
    pub(crate) run_state: RunState,
    pub(crate) exit_strategy: ExitStrategy,
    /// The master owns the listening sockets' lifecycle and raises the
    /// successor; subordinates only drain.
    pub(crate) master: bool,
}

/// What a single accept attempt decided while holding the lock.
enum AcceptGate {
    /// Untracked descriptor; forward to the real OS untouched.
    Delegate,
    /// A drain placeholder had its one queued client left; hand it out.
    Handout(RawFd),
    /// Tracked listener; wait for readiness outside the lock, then retry
    /// under it.
    Park(RecordHandle),
}

/// Result of one gated accept attempt.
pub(crate) enum AcceptOutcome {
    Ready(RawFd),
    /// The readiness wakeup was stale (the forced non-blocking socket
    /// returned EAGAIN); wait again.
    Again,
}

pub struct Controller {
    sys: Arc<dyn Sys>,
    config: Config,
    image: ProcessImage,
    state: ReentrantMutex<RefCell<Core>>,
    /// Signal plumbing is live; a fork child must respawn it.
    watching: AtomicBool,
}

impl Controller {
    pub fn new(config: Config, image: ProcessImage) -> Self {
        Self::with_sys(config, image, Arc::new(LibcSys))
    }

    pub(crate) fn with_sys(config: Config, image: ProcessImage, sys: Arc<dyn Sys>) -> Self {
        let exit_strategy = config.exit_strategy;
        Controller {
            sys,
            config,
            image,
            state: ReentrantMutex::new(RefCell::new(Core {
                registry: FdRegistry::new(),
                arena: RecordArena::new(),
                run_state: RunState::Running,
                exit_strategy,
                master: true,
            })),
            watching: AtomicBool::new(false),
        }
    }

    /// Stand the controller up for this process generation: adopt any
    /// inherited descriptors (or scan the startup set), then arm the
    /// restart signal plumbing.
    pub fn install(config: Config, image: ProcessImage) -> io::Result<Arc<Self>> {
        if config.debug {
            let _ = env_logger::Builder::new()
                .filter_level(log::LevelFilter::Debug)
                .try_init();
        }
        let controller = Arc::new(Self::new(config, image));
        controller.adopt()?;
        controller.start_watch()?;
        Ok(controller)
    }

    pub fn start_watch(self: &Arc<Self>) -> io::Result<()> {
        signal::spawn_restart_worker(Arc::clone(self))?;
        signal::install_handlers()?;
        self.watching.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let guard = self.state.lock();
        let mut core = guard.borrow_mut();
        f(&mut core)
    }

    pub fn run_state(&self) -> RunState {
        self.with_state(|core| core.run_state)
    }

    pub fn is_master(&self) -> bool {
        self.with_state(|core| core.master)
    }

    /// Live record totals, mostly useful for diagnostics.
    pub fn counts(&self) -> KindCounts {
        self.with_state(|core| core.arena.counts())
    }

    /// Begin draining this generation. Idempotent; normally driven by a
    /// restart signal but callable directly by an embedder.
    pub fn restart(&self) {
        self.with_state(|core| {
            self.exit_start(core);
            self.exit_check(core);
        });
    }

    /// Intercepted bind().
    ///
    /// If a socket for the same raw address already exists (typically a
    /// ghost inherited from the previous generation), the caller's fresh
    /// socket is replaced by a clone of the existing one and the real
    /// bind is elided; the address was never released, so rebinding it
    /// would fail anyway.
    pub fn bind(&self, fd: RawFd, addr: &[u8]) -> io::Result<()> {
        self.with_state(|core| {
            let limit = core.registry.limit();
            for existing in 0..limit {
                if existing == fd {
                    continue;
                }
                let Some(handle) = core.registry.lookup(existing) else {
                    continue;
                };
                let same_addr = match core.arena.get(handle) {
                    Some(rec) => matches!(&rec.kind, RecordKind::Bound(b) if b.addr == addr),
                    None => false,
                };
                if !same_addr {
                    continue;
                }
                if self.dup3_locked(core, existing, fd, 0).is_err() {
                    continue;
                }
                let was_ghost = match core.arena.get_mut(handle) {
                    Some(rec) => match &mut rec.kind {
                        RecordKind::Bound(b) => {
                            let ghost = b.ghost;
                            b.ghost = false;
                            ghost
                        }
                        _ => false,
                    },
                    None => false,
                };
                if was_ghost {
                    // The inherited descriptor number has served its
                    // purpose; only the claimed clone matters now.
                    if let Some(old) = core.registry.lookup(existing) {
                        let _ = self.close_record(core, existing, old);
                    }
                }
                log::debug!("bind fd {} reclaimed existing socket (fd {})", fd, existing);
                return Ok(());
            }

            if self.config.multi_bind {
                self.sys.set_reuseport(fd)?;
            }
            self.sys.bind(fd, addr)?;
            // Accept attempts happen under the lock, so the socket must
            // never block there.
            self.sys.set_nonblocking(fd)?;
            let handle = core.arena.alloc(RecordKind::Bound(BoundSocket {
                addr: addr.to_vec(),
                ..Default::default()
            }));
            core.registry.save(fd, handle);
            log::debug!("bind fd {} tracked ({} byte address)", fd, addr.len());
            Ok(())
        })
    }

    /// Intercepted listen(). Only bound sockets may listen; the caller's
    /// backlog is ignored in favor of the maximum.
    ///
    /// The real listen is issued at most once per socket lifetime: a
    /// respawned program must not be able to shrink the queue an earlier
    /// generation already announced, and a second listen on a claimed
    /// ghost would reset accept state. While draining, no socket may
    /// start genuinely listening either; the program is told it did.
    pub fn listen(&self, fd: RawFd, _backlog: c_int) -> io::Result<()> {
        self.with_state(|core| {
            let Some(handle) = core.registry.lookup(fd) else {
                return Err(os_err(libc::EINVAL));
            };
            let Some(rec) = core.arena.get_mut(handle) else {
                return Err(os_err(libc::EINVAL));
            };
            let RecordKind::Bound(bound) = &mut rec.kind else {
                return Err(os_err(libc::EINVAL));
            };
            if !bound.real_listened && core.run_state == RunState::Running {
                self.sys.listen(fd, libc::SOMAXCONN)?;
                bound.real_listened = true;
            }
            bound.stub_listened = true;
            Ok(())
        })
    }

    /// Intercepted accept().
    pub fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    ) -> io::Result<RawFd> {
        self.accept4(fd, addr, addrlen, 0)
    }

    /// Intercepted accept4(). Interrupted and would-block outcomes are
    /// absorbed; the programs this serves are exactly the ones that do
    /// not handle them, and both arise here from machinery the caller
    /// never asked for (forced non-blocking sockets, restart signals).
    pub fn accept4(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: c_int,
    ) -> io::Result<RawFd> {
        loop {
            match self.accept_step(fd, addr, addrlen, flags) {
                Ok(AcceptOutcome::Ready(new_fd)) => return Ok(new_fd),
                Ok(AcceptOutcome::Again) => continue,
                Err(err)
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EINTR) | Some(libc::EAGAIN)
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One accept attempt: gate under the lock, wait for readiness
    /// outside it, retry under it. Exposed separately so a single
    /// attempt's outcome is observable.
    pub(crate) fn accept_step(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: c_int,
    ) -> io::Result<AcceptOutcome> {
        let gate = self.with_state(|core| -> io::Result<AcceptGate> {
            let Some(handle) = core.registry.lookup(fd) else {
                return Ok(AcceptGate::Delegate);
            };
            let Some(rec) = core.arena.get_mut(handle) else {
                return Ok(AcceptGate::Delegate);
            };
            match &mut rec.kind {
                RecordKind::Bound(bound) => {
                    if !bound.stub_listened {
                        return Err(os_err(libc::EINVAL));
                    }
                    Ok(AcceptGate::Park(handle))
                }
                // A consumed placeholder behaves like a listener with no
                // clients: the wait below never completes on its own.
                RecordKind::Dummy { client } => match client.take() {
                    Some(queued) => Ok(AcceptGate::Handout(queued)),
                    None => Ok(AcceptGate::Park(handle)),
                },
                _ => Ok(AcceptGate::Delegate),
            }
        })?;

        match gate {
            AcceptGate::Delegate => self
                .sys
                .accept4(fd, addr, addrlen, flags)
                .map(AcceptOutcome::Ready),
            AcceptGate::Handout(queued) => {
                log::debug!("accept fd {} handed out drain client {}", fd, queued);
                Ok(AcceptOutcome::Ready(queued))
            }
            AcceptGate::Park(handle) => {
                // A restart signal interrupts the poll; the re-check
                // below turns that into EINTR for the caller, which is
                // how a draining generation cancels its accept loops.
                self.sys.poll_in(fd)?;
                let attempt = self.with_state(|core| {
                    if core.run_state == RunState::Exiting {
                        return Err(os_err(libc::EINTR));
                    }
                    let new_fd = self.sys.accept4(fd, addr, addrlen, flags)?;
                    if core.arena.get(handle).is_some() {
                        let tracked = core.arena.alloc(RecordKind::Tracked { listener: handle });
                        core.registry.save(new_fd, tracked);
                    }
                    Ok(new_fd)
                });
                match attempt {
                    Ok(new_fd) => Ok(AcceptOutcome::Ready(new_fd)),
                    // Another thread won the race for this wakeup.
                    Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                        Ok(AcceptOutcome::Again)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Intercepted close().
    pub fn close(&self, fd: RawFd) -> io::Result<()> {
        self.with_state(|core| match core.registry.lookup(fd) {
            None => self.sys.close(fd),
            Some(handle) => {
                let result = self.close_record(core, fd, handle);
                self.exit_check(core);
                result
            }
        })
    }

    /// Intercepted dup().
    pub fn dup(&self, fd: RawFd) -> io::Result<RawFd> {
        self.with_state(|core| self.dup_locked(core, fd))
    }

    /// Intercepted dup2().
    pub fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<RawFd> {
        self.dup3(src, dst, 0)
    }

    /// Intercepted dup3().
    pub fn dup3(&self, src: RawFd, dst: RawFd, flags: c_int) -> io::Result<RawFd> {
        self.with_state(|core| {
            let (rc, displaced) = self.dup3_locked(core, src, dst, flags)?;
            if displaced {
                self.exit_check(core);
            }
            Ok(rc)
        })
    }

    /// Intercepted fork(). Restart signals are held off across the fork
    /// window so a racing notification cannot land in a pipe the child
    /// still shares; the child re-derives its role and respawns the
    /// signal plumbing the parent's worker thread did not survive into.
    pub fn fork(self: &Arc<Self>) -> io::Result<pid_t> {
        self.sys.block_restart_signal();
        let guard = self.state.lock();
        let result = self.sys.fork();
        if let Ok(0) = result {
            {
                let mut core = guard.borrow_mut();
                // A child holding no listening sockets is an independent
                // process and masters its own lifecycle; one sharing
                // sockets stays subordinate to the forking master.
                core.master = core.arena.counts().bound == 0;
            }
            drop(guard);
            if self.watching.load(Ordering::SeqCst) {
                if let Err(e) = signal::spawn_restart_worker(Arc::clone(self)) {
                    log::error!("failed to respawn restart worker: {}", e);
                }
            }
        } else {
            drop(guard);
        }
        self.sys.unblock_restart_signal();
        result
    }

    /// Intercepted exit(). In revive mode termination is itself a
    /// restart: the image is replaced instead of torn down.
    pub fn exit(&self, status: c_int) {
        if self.config.revive {
            let guard = self.state.lock();
            let core = guard.borrow();
            log::info!("reviving on exit({})", status);
            self.exec_handoff(&core);
        }
        self.sys.exit(status);
    }

    /// Intercepted wait(); reaping a child can unblock a deferred exit.
    pub fn wait(&self, status: *mut c_int) -> io::Result<pid_t> {
        let result = self.sys.wait(status);
        self.with_state(|core| self.exit_check(core));
        result
    }

    /// Intercepted waitpid().
    pub fn waitpid(&self, pid: pid_t, status: *mut c_int, options: c_int) -> io::Result<pid_t> {
        let result = self.sys.waitpid(pid, status, options);
        self.with_state(|core| self.exit_check(core));
        result
    }

    fn dup_locked(&self, core: &mut Core, fd: RawFd) -> io::Result<RawFd> {
        let source = core.registry.lookup(fd);
        let new_fd = self.sys.dup(fd)?;
        if let Some(handle) = source {
            core.arena.inc_ref(handle);
            core.registry.save(new_fd, handle);
        }
        Ok(new_fd)
    }

    /// dup3 with bookkeeping, no exit check. Reports whether a tracked
    /// record was displaced from the destination.
    fn dup3_locked(
        &self,
        core: &mut Core,
        src: RawFd,
        dst: RawFd,
        flags: c_int,
    ) -> io::Result<(RawFd, bool)> {
        if src == dst {
            // dup2 over itself neither closes nor copies anything.
            return Ok((dst, false));
        }
        let source = core.registry.lookup(src);
        let displaced = match core.registry.lookup(dst) {
            Some(old) => {
                self.displace(core, dst, old)?;
                true
            }
            None => false,
        };
        let rc = self.sys.dup3(src, dst, flags)?;
        if let Some(handle) = source {
            core.arena.inc_ref(handle);
            core.registry.save(dst, handle);
        }
        Ok((rc, displaced))
    }

    /// Release a record slot about to be overwritten by a dup. The OS
    /// descriptor is closed only where an explicit close would have
    /// closed it; either way the slot's reference is dropped, since the
    /// dup clobbers the descriptor regardless.
    fn displace(&self, core: &mut Core, dst: RawFd, handle: RecordHandle) -> io::Result<()> {
        let close_os = match core.arena.get(handle).map(|r| &r.kind) {
            Some(RecordKind::Bound(_)) => !self.config.revive,
            Some(RecordKind::Tracked { .. }) => true,
            _ => false,
        };
        core.arena.dec_ref(handle);
        core.registry.delete(dst);
        if close_os {
            self.sys.close(dst)?;
        }
        Ok(())
    }

    /// Close semantics for a tracked slot, without the exit check.
    fn close_record(&self, core: &mut Core, fd: RawFd, handle: RecordHandle) -> io::Result<()> {
        let Some(rec) = core.arena.get(handle) else {
            core.registry.delete(fd);
            return self.sys.close(fd);
        };
        match &rec.kind {
            // The socket must survive into the revived image.
            RecordKind::Bound(_) if self.config.revive => Ok(()),
            RecordKind::Bound(_) | RecordKind::Tracked { .. } => {
                core.arena.dec_ref(handle);
                core.registry.delete(fd);
                self.sys.close(fd)
            }
            // Programs close inherited descriptors defensively; the
            // bookkeeping stays authoritative and the close is absorbed.
            RecordKind::Saved { .. } | RecordKind::Dummy { .. } => Ok(()),
        }
    }
}

fn os_err(code: c_int) -> io::Error {
    io::Error::from_raw_os_error(code)
}
