//! Drain phase: what happens between the restart trigger and the moment
//! this generation's last tracked connection goes away.

use std::os::unix::io::RawFd;

use molt_core::{RecordHandle, RecordKind};

use crate::config::ExitStrategy;

use super::{Controller, Core, RunState};

enum DrainAction {
    Keep,
    /// A preserved startup descriptor; point its original number at
    /// /dev/null so the lingering generation stops writing to it.
    Redirect(RawFd),
    /// A live listener; swap a placeholder in under its number.
    Substitute,
}

impl Controller {
    /// Flip this generation into the draining state. Idempotent.
    ///
    /// The master additionally swaps placeholders under its listeners
    /// and raises the successor; a subordinate only drains and forces
    /// the fork strategy, since replacing its image would duplicate the
    /// master's successor.
    pub(crate) fn exit_start(&self, core: &mut Core) {
        if core.run_state == RunState::Exiting {
            return;
        }
        core.run_state = RunState::Exiting;

        if !core.master {
            // Hold what this process has; the master raises the
            // successor and neuters the shared descriptors.
            core.exit_strategy = ExitStrategy::Fork;
            log::info!("draining (subordinate)");
            return;
        }

        log::info!("draining (master, {:?} strategy)", core.exit_strategy);
        if let Some(path) = &self.config.unlink_on_exit {
            self.sys.unlink(path);
        }

        for fd in 0..core.registry.limit() {
            let Some(handle) = core.registry.lookup(fd) else {
                continue;
            };
            let action = match core.arena.get(handle).map(|r| &r.kind) {
                Some(RecordKind::Saved { fd: original, .. }) => DrainAction::Redirect(*original),
                Some(RecordKind::Bound(bound)) if !bound.ghost => DrainAction::Substitute,
                _ => DrainAction::Keep,
            };
            match action {
                DrainAction::Keep => {}
                DrainAction::Redirect(original) => {
                    // Only a lingering fork parent needs silencing; an
                    // exec hands the descriptors over intact.
                    if core.exit_strategy != ExitStrategy::Fork {
                        continue;
                    }
                    // Keep stderr flowing for late diagnostics.
                    if original == 2 {
                        continue;
                    }
                    match self.sys.open_null() {
                        Ok(null) => {
                            if let Err(e) = self.dup3_locked(core, null, original, 0) {
                                log::warn!("null redirect of fd {} failed: {}", original, e);
                            }
                            let _ = self.sys.close(null);
                        }
                        Err(e) => log::warn!("open /dev/null failed: {}", e),
                    }
                }
                DrainAction::Substitute => self.substitute_dummy(core, fd, handle),
            }
        }

        match core.exit_strategy {
            ExitStrategy::Fork => match self.sys.fork() {
                Ok(0) => {
                    // Successor child: replace the image right away; the
                    // parent lingers to finish its connections.
                    self.exec_handoff(core);
                }
                Ok(child) => {
                    core.master = false;
                    log::info!("successor pid {} raised", child);
                }
                Err(e) => log::error!("fork for restart failed: {}", e),
            },
            ExitStrategy::Exec => {
                // The image is replaced once the drain completes; see
                // exit_check.
            }
        }
    }

    /// Park the real listener on a spare descriptor and install a
    /// placeholder pair under its number. The parked socket stays alive
    /// as a ghost so the successor can claim it; accepts against the
    /// placeholder hand out one dead client, then cancel.
    fn substitute_dummy(&self, core: &mut Core, fd: RawFd, handle: RecordHandle) {
        let aside = match self.dup_locked(core, fd) {
            Ok(aside) => aside,
            Err(e) => {
                log::warn!("could not set aside listener fd {}: {}", fd, e);
                return;
            }
        };
        match self.sys.dummy_server() {
            Ok((server, client)) => {
                let dummy = core.arena.alloc(RecordKind::Dummy {
                    client: Some(client),
                });
                core.registry.save(server, dummy);
                core.arena.inc_ref(dummy);
                core.registry.save(client, dummy);
                if let Some(rec) = core.arena.get_mut(handle) {
                    if let RecordKind::Bound(bound) = &mut rec.kind {
                        bound.ghost = true;
                    }
                }
                if let Err(e) = self.dup3_locked(core, server, fd, 0) {
                    log::warn!("placeholder swap for fd {} failed: {}", fd, e);
                }
                log::debug!("listener fd {} parked at {}", fd, aside);
            }
            Err(e) => {
                log::warn!("no placeholder pair for fd {}: {}", fd, e);
                if let Some(parked) = core.registry.lookup(aside) {
                    let _ = self.close_record(core, aside, parked);
                }
            }
        }
    }

    /// Terminate or replace this generation if the drain is complete:
    /// draining, no tracked connections, and (in wait mode) no waitable
    /// children left. Runs after every operation that can release a
    /// tracked connection or reap a child.
    pub(crate) fn exit_check(&self, core: &mut Core) {
        if core.run_state != RunState::Exiting {
            return;
        }
        if core.arena.counts().tracked != 0 {
            return;
        }
        if self.config.wait_for_children {
            match self.sys.waitable_child() {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => log::warn!("child probe failed: {}", e),
            }
        }
        match core.exit_strategy {
            ExitStrategy::Fork => {
                log::info!("drain complete, exiting");
                self.sys.exit(0);
            }
            ExitStrategy::Exec => {
                log::info!("drain complete, replacing image");
                self.exec_handoff(core);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{addr, controller};
    use super::super::{AcceptOutcome, Controller, RunState};
    use crate::config::{Config, ExitStrategy};
    use crate::sys::fake::FakeSys;
    use std::ptr;
    use std::sync::Arc;

    fn draining_with_connection(
        config: Config,
    ) -> (Arc<FakeSys>, Arc<Controller>, i32, i32) {
        let (fake, c) = controller(config);
        let listener = fake.socket();
        c.bind(listener, &addr()).unwrap();
        c.listen(listener, 16).unwrap();
        fake.push_pending(listener);
        let conn = match c.accept_step(listener, ptr::null_mut(), ptr::null_mut(), 0) {
            Ok(AcceptOutcome::Ready(fd)) => fd,
            other => panic!("accept failed: {:?}", other.map(|_| ()).err()),
        };
        (fake, c, listener, conn)
    }

    #[test]
    fn test_restart_defers_exit_until_connections_close() {
        let (fake, c, listener, conn) = draining_with_connection(Config::default());
        fake.queue_fork(4242);

        c.restart();
        assert_eq!(c.run_state(), RunState::Exiting);
        // A placeholder sits under the listener, the real socket is
        // parked as a ghost, and the successor has been raised.
        assert_eq!(fake.dummy_pairs(), 1);
        let counts = c.counts();
        assert_eq!(counts.bound, 1);
        assert_eq!(counts.dummy, 1);
        assert_eq!(counts.tracked, 1);
        assert!(!c.is_master());
        assert_eq!(fake.exited(), None);
        c.with_state(|core| {
            let handle = core.registry.lookup(listener).unwrap();
            assert!(matches!(
                core.arena.get(handle).unwrap().kind,
                molt_core::RecordKind::Dummy { .. }
            ));
        });

        // Releasing the last connection completes the drain.
        c.close(conn).unwrap();
        assert_eq!(fake.exited(), Some(0));
    }

    #[test]
    fn test_restart_is_idempotent() {
        let (fake, c, _listener, _conn) = draining_with_connection(Config::default());
        fake.queue_fork(4242);
        c.restart();
        c.restart();
        assert_eq!(fake.dummy_pairs(), 1);
        assert_eq!(c.run_state(), RunState::Exiting);
    }

    #[test]
    fn test_listen_while_draining_is_stubbed() {
        let (fake, c, _listener, _conn) = draining_with_connection(Config::default());
        fake.queue_fork(4242);
        c.restart();
        assert_eq!(c.run_state(), RunState::Exiting);

        // A socket bound on a fresh address mid-drain is told its
        // listen succeeded, but the OS queue is never opened; new
        // traffic belongs to the successor.
        let late = fake.socket();
        let fresh = vec![2, 0, 0x23, 0x28, 127, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        c.bind(late, &fresh).unwrap();
        c.listen(late, 16).unwrap();
        assert_eq!(fake.listen_calls(late), 0);
    }

    #[test]
    fn test_placeholder_accept_hands_out_one_client_then_cancels() {
        let (fake, c, listener, _conn) = draining_with_connection(Config::default());
        fake.queue_fork(4242);
        c.restart();

        // Exactly one queued client comes out of the placeholder.
        let first = c.accept_step(listener, ptr::null_mut(), ptr::null_mut(), 0);
        assert!(matches!(first, Ok(AcceptOutcome::Ready(_))));

        // After that, every attempt is cancelled.
        for _ in 0..2 {
            let err = c
                .accept_step(listener, ptr::null_mut(), ptr::null_mut(), 0)
                .err()
                .expect("drained accept must be cancelled");
            assert_eq!(err.raw_os_error(), Some(libc::EINTR));
        }
    }

    #[test]
    fn test_exec_strategy_replaces_image_after_drain() {
        let (fake, c, _listener, conn) = draining_with_connection(Config {
            exit_strategy: ExitStrategy::Exec,
            ..Default::default()
        });

        c.restart();
        // Still draining: no exec, no exit, no fork.
        assert_eq!(fake.exec_count(), 0);
        assert_eq!(fake.exited(), None);

        c.close(conn).unwrap();
        assert_eq!(fake.exec_count(), 1);
        let env = fake.last_exec_env().unwrap();
        assert!(env
            .iter()
            .any(|e| e.to_bytes().starts_with(b"MOLT_PIPE=")));
    }

    #[test]
    fn test_subordinate_forces_fork_strategy() {
        let (fake, c) = controller(Config {
            exit_strategy: ExitStrategy::Exec,
            ..Default::default()
        });
        let listener = fake.socket();
        c.bind(listener, &addr()).unwrap();
        c.listen(listener, 16).unwrap();
        fake.push_pending(listener);
        let conn = match c.accept_step(listener, ptr::null_mut(), ptr::null_mut(), 0) {
            Ok(AcceptOutcome::Ready(fd)) => fd,
            _ => panic!("accept failed"),
        };

        // Become a fork child that shares the listening socket.
        fake.queue_fork(0);
        assert_eq!(c.fork().unwrap(), 0);
        assert!(!c.is_master());

        c.restart();
        // The subordinate drains in place: no placeholders, no
        // successor. The master generation owns those.
        assert_eq!(fake.dummy_pairs(), 0);
        c.with_state(|core| {
            let handle = core.registry.lookup(listener).unwrap();
            assert!(matches!(
                &core.arena.get(handle).unwrap().kind,
                molt_core::RecordKind::Bound(b) if !b.ghost
            ));
        });
        assert_eq!(fake.exec_count(), 0);
        assert_eq!(fake.exited(), None);

        c.close(conn).unwrap();
        // It exits instead of replacing its image.
        assert_eq!(fake.exited(), Some(0));
        assert_eq!(fake.exec_count(), 0);
    }

    #[test]
    fn test_fork_child_without_sockets_is_master() {
        let (fake, c) = controller(Config::default());
        fake.queue_fork(0);
        assert_eq!(c.fork().unwrap(), 0);
        assert!(c.is_master());
    }

    #[test]
    fn test_wait_mode_defers_exit_for_children() {
        let (fake, c) = controller(Config {
            wait_for_children: true,
            ..Default::default()
        });
        let listener = fake.socket();
        c.bind(listener, &addr()).unwrap();
        c.listen(listener, 16).unwrap();
        fake.set_waitable(true);
        fake.queue_fork(4242);

        c.restart();
        // No tracked connections, but a child is still running.
        assert_eq!(fake.exited(), None);

        fake.set_waitable(false);
        let _ = c.wait(ptr::null_mut());
        assert_eq!(fake.exited(), Some(0));
    }

    #[test]
    fn test_unlink_on_drain() {
        let (fake, c) = controller(Config {
            unlink_on_exit: Some("/run/app.pid".into()),
            ..Default::default()
        });
        fake.queue_fork(4242);
        c.restart();
        assert_eq!(fake.unlinked(), vec![std::path::PathBuf::from("/run/app.pid")]);
    }

    #[test]
    fn test_placeholder_failure_rolls_back() {
        let (fake, c, listener, _conn) = draining_with_connection(Config::default());
        fake.set_fail_dummy(true);
        fake.queue_fork(4242);

        c.restart();
        assert_eq!(fake.dummy_pairs(), 0);
        let counts = c.counts();
        assert_eq!(counts.dummy, 0);
        assert_eq!(counts.bound, 1);
        // The listener slot still points at the original record.
        c.with_state(|core| {
            let handle = core.registry.lookup(listener).unwrap();
            assert!(matches!(
                &core.arena.get(handle).unwrap().kind,
                molt_core::RecordKind::Bound(b) if !b.ghost
            ));
            assert_eq!(core.arena.get(handle).unwrap().strong_count(), 1);
        });
    }
}
