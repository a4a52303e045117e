//! Crossing the exec boundary: encoding this generation's descriptors
//! onto the handoff pipe, and adopting them on the other side.

use std::io;
use std::os::unix::io::RawFd;

use molt_core::{codec, BoundSocket, RecordKind, WireRecord};

use super::{Controller, Core};

impl Controller {
    /// Replace the process image. Surviving records (bound sockets and
    /// preserved startup descriptors) are encoded onto an inheritable
    /// pipe whose read end is spliced into the successor's environment.
    ///
    /// Failure past this point leaves no process to hand control back
    /// to, so it terminates.
    pub(crate) fn exec_handoff(&self, core: &Core) {
        // No handler may fire between here and the successor installing
        // its own; the successor unmasks.
        self.sys.mask_handoff_signals();

        let (rd, wr) = match self.sys.pipe() {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("handoff pipe unavailable: {}", e);
                self.sys.exit(1);
                return;
            }
        };

        for fd in 0..core.registry.limit() {
            let Some(handle) = core.registry.lookup(fd) else {
                continue;
            };
            let Some(rec) = core.arena.get(handle) else {
                continue;
            };
            let wire = match &rec.kind {
                RecordKind::Bound(bound) => WireRecord::Bound {
                    listened: bound.real_listened,
                    addr: bound.addr.clone(),
                },
                RecordKind::Saved { fd: original, offset } => WireRecord::Saved {
                    fd: *original,
                    offset: *offset,
                },
                // Connections and placeholders die with this image.
                _ => continue,
            };
            if let Err(e) = codec::encode(wr, fd, &wire) {
                log::warn!("could not encode fd {}: {}", fd, e);
            }
        }
        let _ = self.sys.close(wr);

        let env = self.image.env_with_pipe(rd);
        self.sys.chdir(&self.image.cwd);
        log::info!("replacing image ({:?})", self.image.exe);
        if let Err(e) = self.sys.execve(&self.image.exe, &self.image.args, &env) {
            log::error!("exec failed: {}", e);
            self.sys.exit(1);
        }
    }

    /// Populate the bookkeeping for a fresh process generation: either
    /// adopt the stream a predecessor left on the inherited pipe, or
    /// (for a first generation) scan and preserve the startup
    /// descriptors.
    pub(crate) fn adopt(&self) -> io::Result<()> {
        // The predecessor could not wait on its own lingering children;
        // they reparent onto us.
        loop {
            match self
                .sys
                .waitpid(-1, std::ptr::null_mut(), libc::WNOHANG)
            {
                Ok(pid) if pid > 0 => continue,
                _ => break,
            }
        }
        self.with_state(|core| match self.config.inherited_pipe {
            Some(pipe) => self.adopt_from_pipe(core, pipe),
            None => {
                self.scan_startup_fds(core);
                Ok(())
            }
        })
    }

    fn adopt_from_pipe(&self, core: &mut Core, pipe: RawFd) -> io::Result<()> {
        loop {
            match codec::decode(pipe) {
                Ok(Some((fd, wire))) => {
                    let kind = match wire {
                        WireRecord::Bound { listened, addr } => RecordKind::Bound(BoundSocket {
                            addr,
                            real_listened: listened,
                            stub_listened: false,
                            ghost: true,
                        }),
                        WireRecord::Saved { fd: original, offset } => RecordKind::Saved {
                            fd: original,
                            offset,
                        },
                    };
                    log::debug!("inherited fd {} ({})", fd, kind.name());
                    let handle = core.arena.alloc(kind);
                    core.registry.save(fd, handle);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("handoff stream corrupt: {}", e);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }
        let _ = self.sys.close(pipe);

        // Anything the stream did not name is baggage from the previous
        // image.
        for fd in 0..self.sys.max_fd() {
            if fd == pipe {
                continue;
            }
            if core.registry.lookup(fd).is_none() {
                let _ = self.sys.close(fd);
            }
        }

        self.restore_saved(core);
        Ok(())
    }

    /// Plant each preserved descriptor back on its original number and
    /// restore its file offset. The parked high-numbered slot remains
    /// the tracked one.
    fn restore_saved(&self, core: &mut Core) {
        for fd in 0..core.registry.limit() {
            let Some(handle) = core.registry.lookup(fd) else {
                continue;
            };
            let (original, offset) = match core.arena.get(handle).map(|r| &r.kind) {
                Some(RecordKind::Saved { fd, offset }) => (*fd, *offset),
                _ => continue,
            };
            if fd != original {
                if let Some(occupant) = core.registry.lookup(original) {
                    // Move whatever sits on the original number out of
                    // the way first.
                    if self.dup_locked(core, original).is_ok() {
                        let _ = self.close_record(core, original, occupant);
                    }
                }
                if let Err(e) = self.sys.dup2(fd, original) {
                    log::warn!("could not restore fd {}: {}", original, e);
                    continue;
                }
            }
            if offset >= 0 {
                self.sys.seek_to(original, offset);
            }
        }
    }

    /// First generation: every descriptor open at startup gets a spare
    /// duplicate and a preservation record, so a later handoff can
    /// reconstruct the startup set even if the program closes or
    /// clobbers the originals.
    fn scan_startup_fds(&self, core: &mut Core) {
        for fd in 0..self.sys.max_fd() {
            if core.registry.lookup(fd).is_some() {
                continue;
            }
            let Ok(spare) = self.sys.dup(fd) else {
                // Not open.
                continue;
            };
            let offset = self.sys.current_offset(fd);
            let handle = core.arena.alloc(RecordKind::Saved { fd, offset });
            core.registry.save(spare, handle);
            log::debug!("preserving startup fd {} at {}", fd, spare);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{addr, controller, image};
    use super::super::Controller;
    use crate::config::{Config, ExitStrategy};
    use crate::sys::fake::FakeSys;
    use crate::sys::Sys;
    use molt_core::{codec, RecordKind, WireRecord};
    use std::sync::Arc;

    fn handoff_pipe_fd(fake: &FakeSys) -> i32 {
        let env = fake.last_exec_env().expect("exec not recorded");
        env.iter()
            .find_map(|entry| {
                let bytes = entry.to_bytes();
                bytes
                    .strip_prefix(b"MOLT_PIPE=")
                    .map(|rest| String::from_utf8_lossy(rest).parse().unwrap())
            })
            .expect("handoff pipe env entry missing")
    }

    #[test]
    fn test_startup_scan_preserves_open_fds() {
        let (fake, c) = controller(Config::default());
        let file = fake.open_plain();
        let sock = fake.socket();
        fake.set_offset(file, 7);

        c.adopt().unwrap();

        let counts = c.counts();
        assert_eq!(counts.saved, 2);
        assert_eq!(counts.bound, 0);
        // Each preserved fd is parked on a spare sharing the same open
        // file.
        c.with_state(|core| {
            let mut preserved = Vec::new();
            for fd in 0..core.registry.limit() {
                let Some(handle) = core.registry.lookup(fd) else {
                    continue;
                };
                if let Some(RecordKind::Saved { fd: original, offset }) =
                    core.arena.get(handle).map(|r| r.kind.clone())
                {
                    assert!(fake.same_desc(fd, original));
                    preserved.push((original, offset));
                }
            }
            preserved.sort_unstable();
            assert_eq!(preserved, vec![(file, 7), (sock, -1)]);
        });
    }

    #[test]
    fn test_adoption_from_handoff_stream() {
        let fake = Arc::new(FakeSys::new());
        // Descriptors as a predecessor left them: a parked ghost
        // listener and a preserved plain fd.
        let parked = fake.socket();
        let preserved = fake.open_plain();
        let (rd, wr) = Sys::pipe(&*fake).unwrap();
        codec::encode(
            wr,
            parked,
            &WireRecord::Bound {
                listened: true,
                addr: addr(),
            },
        )
        .unwrap();
        codec::encode(wr, preserved, &WireRecord::Saved { fd: 1, offset: 42 }).unwrap();
        Sys::close(&*fake, wr).unwrap();

        let config = Config {
            inherited_pipe: Some(rd),
            ..Default::default()
        };
        let sys: Arc<dyn Sys> = fake.clone();
        let c = Arc::new(Controller::with_sys(config, image(), sys));
        c.adopt().unwrap();

        let counts = c.counts();
        assert_eq!(counts.bound, 1);
        assert_eq!(counts.saved, 1);
        // The preserved descriptor is back on its original number, at
        // its original offset.
        assert!(fake.same_desc(1, preserved));
        assert_eq!(fake.seeks(), vec![(1, 42)]);

        // The ghost listener is claimable by a fresh bind.
        let fresh = fake.socket();
        c.bind(fresh, &addr()).unwrap();
        assert_eq!(c.counts().bound, 1);
        assert!(!fake.is_open(parked));
    }

    #[test]
    fn test_handoff_stream_carries_parked_listener() {
        let (fake, c) = controller(Config {
            exit_strategy: ExitStrategy::Exec,
            ..Default::default()
        });
        let listener = fake.socket();
        c.bind(listener, &addr()).unwrap();
        c.listen(listener, 16).unwrap();

        // No connections in flight, so the drain completes immediately
        // and the image is replaced.
        c.restart();
        assert_eq!(fake.exec_count(), 1);

        let rd = handoff_pipe_fd(&fake);
        let (fd, record) = codec::decode(rd).unwrap().expect("one surviving record");
        assert!(fd > 0);
        assert_eq!(
            record,
            WireRecord::Bound {
                listened: true,
                addr: addr(),
            }
        );
        assert!(codec::decode(rd).unwrap().is_none());
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_revive_exit_replaces_image() {
        let (fake, c) = controller(Config {
            revive: true,
            ..Default::default()
        });
        let listener = fake.socket();
        c.bind(listener, &addr()).unwrap();
        c.listen(listener, 16).unwrap();

        c.exit(3);
        assert_eq!(fake.exec_count(), 1);

        let rd = handoff_pipe_fd(&fake);
        let (_, record) = codec::decode(rd).unwrap().expect("listener must survive");
        assert_eq!(
            record,
            WireRecord::Bound {
                listened: true,
                addr: addr(),
            }
        );
        unsafe { libc::close(rd) };
    }
}
