//! molt: zero-downtime restarts for unmodified servers
//!
//! This crate contains the process-side machinery: configuration from the
//! environment, the restart controller that tracks descriptor lifecycles
//! and drains a generation, the signal plumbing that triggers a restart,
//! and the exec handoff that carries listening sockets into the successor
//! image. The wire codec and record bookkeeping live in `molt-core`.

pub mod config;
pub mod image;
pub mod restart;
mod signal;
pub mod sys;

pub use config::{Config, ConfigError, ExitStrategy};
pub use image::ProcessImage;
pub use restart::{Controller, RunState};
pub use sys::{LibcSys, Sys};
