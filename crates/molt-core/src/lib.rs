//! molt-core: descriptor bookkeeping for zero-downtime restarts
//!
//! This crate provides the building blocks the restart controller is made
//! of:
//! - Reference-counted descriptor records (bound/tracked/saved/dummy)
//! - The sparse descriptor-number registry
//! - The wire codec that carries survivable records across an exec boundary

pub mod codec;
pub mod record;
pub mod registry;

pub use codec::{CodecError, WireRecord};
pub use record::{BoundSocket, KindCounts, Record, RecordArena, RecordHandle, RecordKind};
pub use registry::FdRegistry;
