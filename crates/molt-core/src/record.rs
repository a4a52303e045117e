//! Reference-counted descriptor records
//!
//! Every descriptor molt cares about is backed by a record describing what
//! the descriptor is (a bound listener, an accepted connection, a preserved
//! startup file, or a drain-time dummy socket). Records live in an
//! index-stable arena and are addressed through generation-checked handles,
//! so a record can outlive the descriptor slot that created it: an accepted
//! connection keeps its listener's record alive through a handle plus an
//! explicit strong count, even after the listener's own slot is closed.

use std::os::unix::io::RawFd;

/// State carried by a bound listening socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundSocket {
    /// Raw address bytes exactly as the program passed them to bind().
    pub addr: Vec<u8>,
    /// A real OS listen() has been issued for this socket.
    pub real_listened: bool,
    /// The program believes listen() succeeded (it may have been elided).
    pub stub_listened: bool,
    /// The OS socket comes from a prior process generation and may still
    /// be claimed by a fresh bind() for the same address.
    pub ghost: bool,
}

/// The closed set of record variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// A socket the program bound; survives handoff.
    Bound(BoundSocket),
    /// A connection accepted from a bound listener. Holds a strong
    /// reference to the listener's record.
    Tracked { listener: RecordHandle },
    /// A non-socket descriptor preserved from startup: its original
    /// number and file offset (-1 when not seekable).
    Saved { fd: RawFd, offset: i64 },
    /// A drain-time placeholder listener with at most one pre-queued
    /// client descriptor to hand out.
    Dummy { client: Option<RawFd> },
}

impl RecordKind {
    /// Variant name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Bound(_) => "bound",
            RecordKind::Tracked { .. } => "tracked",
            RecordKind::Saved { .. } => "saved",
            RecordKind::Dummy { .. } => "dummy",
        }
    }
}

/// A live record plus its strong count.
#[derive(Debug)]
pub struct Record {
    refs: u32,
    pub kind: RecordKind,
}

impl Record {
    /// Number of registry slots and back-references pointing here.
    pub fn strong_count(&self) -> u32 {
        self.refs
    }
}

/// Generation-checked handle into the arena.
///
/// Handles are cheap to copy and safe to hold across a record's death:
/// once the record is freed the handle resolves to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    index: u32,
    generation: u32,
}

/// Live record totals per variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub bound: usize,
    pub tracked: usize,
    pub saved: usize,
    pub dummy: usize,
}

struct Slot {
    generation: u32,
    entry: Option<Record>,
}

/// Index-stable arena of descriptor records.
///
/// All mutation is serialized by the controller's process-wide lock; the
/// arena itself only enforces the count/lifetime invariant (a record is
/// freed exactly when its strong count reaches zero, and freeing a tracked
/// record releases the listener reference it holds).
#[derive(Default)]
pub struct RecordArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    counts: KindCounts,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a record with strong count 1.
    ///
    /// Allocating a `Tracked` record takes a strong reference on its
    /// listener, released again when the tracked record dies.
    pub fn alloc(&mut self, kind: RecordKind) -> RecordHandle {
        if let RecordKind::Tracked { listener } = kind {
            self.inc_ref(listener);
        }
        self.bump_count(&kind, 1);
        let record = Record { refs: 1, kind };

        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.entry.is_none());
                slot.entry = Some(record);
                RecordHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(record),
                });
                RecordHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Resolve a handle; stale handles yield `None`.
    pub fn get(&self, handle: RecordHandle) -> Option<&Record> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut Record> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Take a strong reference.
    pub fn inc_ref(&mut self, handle: RecordHandle) {
        if let Some(record) = self.get_mut(handle) {
            record.refs += 1;
        } else {
            debug_assert!(false, "inc_ref on stale handle {:?}", handle);
        }
    }

    /// Drop a strong reference, freeing the record at zero.
    ///
    /// Freeing a tracked record releases its listener reference in turn,
    /// possibly freeing the listener as well (iterative chain release).
    pub fn dec_ref(&mut self, handle: RecordHandle) {
        let mut next = Some(handle);
        while let Some(h) = next.take() {
            let Some(slot) = self.slots.get_mut(h.index as usize) else {
                debug_assert!(false, "dec_ref on bad handle {:?}", h);
                return;
            };
            if slot.generation != h.generation {
                debug_assert!(false, "dec_ref on stale handle {:?}", h);
                return;
            }
            let Some(record) = slot.entry.as_mut() else {
                return;
            };
            debug_assert!(record.refs > 0);
            record.refs -= 1;
            if record.refs > 0 {
                continue;
            }

            let dead = slot.entry.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(h.index);
            if let Some(record) = dead {
                self.bump_count(&record.kind, -1);
                if let RecordKind::Tracked { listener } = record.kind {
                    next = Some(listener);
                }
            }
        }
    }

    /// Live record totals per variant.
    pub fn counts(&self) -> KindCounts {
        self.counts
    }

    /// Total number of live records.
    pub fn live(&self) -> usize {
        self.counts.bound + self.counts.tracked + self.counts.saved + self.counts.dummy
    }

    fn bump_count(&mut self, kind: &RecordKind, delta: isize) {
        let counter = match kind {
            RecordKind::Bound(_) => &mut self.counts.bound,
            RecordKind::Tracked { .. } => &mut self.counts.tracked,
            RecordKind::Saved { .. } => &mut self.counts.saved,
            RecordKind::Dummy { .. } => &mut self.counts.dummy,
        };
        *counter = counter.checked_add_signed(delta).unwrap_or(0);
    }
}
