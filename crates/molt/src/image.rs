//! Saved process image for the exec handoff
//!
//! The controller re-executes the same binary with the same arguments,
//! environment and working directory it started with. Capturing those is
//! the embedder's job (it owns the interposition layer and runs before
//! anything has mutated them); the core treats them as opaque byte blobs
//! and only ever splices one variable -- the handoff pipe marker -- into
//! the environment copy.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::config::ENV_PIPE;

/// Everything needed to exec a fresh copy of the running program.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    /// Path to the executable image.
    pub exe: CString,
    /// argv, including argv[0].
    pub args: Vec<CString>,
    /// Environment as `KEY=value` entries.
    pub env: Vec<CString>,
    /// Working directory at startup.
    pub cwd: CString,
}

impl ProcessImage {
    pub fn new(exe: CString, args: Vec<CString>, env: Vec<CString>, cwd: CString) -> Self {
        Self {
            exe,
            args,
            env,
            cwd,
        }
    }

    /// Copy of the saved environment with `MOLT_PIPE=<fd>` spliced in,
    /// replacing an inherited entry or appending a new one.
    pub(crate) fn env_with_pipe(&self, pipe: RawFd) -> Vec<CString> {
        let marker = format!("{}=", ENV_PIPE);
        let entry = CString::new(format!("{}{}", marker, pipe))
            .unwrap_or_else(|_| CString::default());

        let mut env = self.env.clone();
        for slot in env.iter_mut() {
            if slot.to_bytes().starts_with(marker.as_bytes()) {
                *slot = entry;
                return env;
            }
        }
        env.push(entry);
        env
    }
}
