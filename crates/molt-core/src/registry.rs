//! Sparse descriptor-number to record-handle table
//!
//! Absence of an entry means "untracked, pass the call through unchanged".
//! The table grows to the highest descriptor number it has seen and never
//! shrinks; descriptor numbers are small and dense, so a flat vector beats
//! any map here.

use std::os::unix::io::RawFd;

use crate::record::RecordHandle;

/// Descriptor number → record handle.
#[derive(Default)]
pub struct FdRegistry {
    slots: Vec<Option<RecordHandle>>,
}

impl FdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record handle for a descriptor, if tracked.
    pub fn lookup(&self, fd: RawFd) -> Option<RecordHandle> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize).copied().flatten()
    }

    /// Install a handle under a descriptor number, growing as needed.
    ///
    /// Does not touch reference counts; the caller owns that bookkeeping.
    pub fn save(&mut self, fd: RawFd, handle: RecordHandle) {
        if fd < 0 {
            return;
        }
        let index = fd as usize;
        if index >= self.slots.len() {
            let mut target = self.slots.len().max(1);
            while index >= target {
                target *= 2;
            }
            self.slots.resize(target, None);
        }
        self.slots[index] = Some(handle);
    }

    /// Clear a descriptor slot. Reference counts are untouched; the caller
    /// is responsible for releasing the record.
    pub fn delete(&mut self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            *slot = None;
        }
    }

    /// Current table capacity (not occupancy): one past the highest region
    /// of descriptor numbers ever tracked.
    pub fn limit(&self) -> RawFd {
        self.slots.len() as RawFd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordArena, RecordKind};

    fn handle(arena: &mut RecordArena) -> RecordHandle {
        arena.alloc(RecordKind::Saved { fd: 0, offset: -1 })
    }

    #[test]
    fn test_lookup_untracked_is_none() {
        let table = FdRegistry::new();
        assert!(table.lookup(0).is_none());
        assert!(table.lookup(100).is_none());
        assert!(table.lookup(-1).is_none());
    }

    #[test]
    fn test_save_and_delete() {
        let mut arena = RecordArena::new();
        let mut table = FdRegistry::new();
        let h = handle(&mut arena);

        table.save(5, h);
        assert_eq!(table.lookup(5), Some(h));

        table.delete(5);
        assert!(table.lookup(5).is_none());
        // Record untouched by table operations.
        assert!(arena.get(h).is_some());
    }

    #[test]
    fn test_capacity_grows_and_never_shrinks() {
        let mut arena = RecordArena::new();
        let mut table = FdRegistry::new();

        table.save(3, handle(&mut arena));
        let grown = table.limit();
        assert!(grown > 3);

        table.save(77, handle(&mut arena));
        assert!(table.limit() > 77);

        table.delete(77);
        table.delete(3);
        assert!(table.limit() > 77);
    }

    #[test]
    fn test_delete_out_of_range_is_noop() {
        let mut table = FdRegistry::new();
        table.delete(12);
        table.delete(-3);
        assert_eq!(table.limit(), 0);
    }
}
