// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use util::CachePadded;

use crate::loom::sync::atomic::{AtomicU32, Ordering};

// same grain as the allocator headers
const ALIGN: usize = 16;

/// Number of arena slots in the ring. Power of two.
pub const SLOT_COUNT: u32 = 32;
/// Bytes per arena slot.
pub const SLOT_CAPACITY: u32 = 1 << 20;

const SLOT_MASK: u32 = SLOT_COUNT - 1;

/// Handle to an acquired arena slot.
///
/// The handle is nothing but the sequence number the slot was acquired
/// under; it stays valid exactly until [`ArenaRing::release`] (or until a
/// later epoch reuses the slot, which the sequence check detects).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ArenaHandle {
    seqno: u32,
}

impl fmt::Debug for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArenaHandle").field(&self.seqno).finish()
    }
}

/// A lock-free ring of linear arenas for scratch scopes inside parallel
/// tasks.
///
/// Each slot carries a sequence number `ringseq[i]`, initialized to
/// `i + SLOT_COUNT`. A slot whose sequence is `s` is free and will next be
/// acquired as handle `s`; an acquired slot holds `s + 1`; releasing bumps
/// it to `s + SLOT_COUNT`, where it becomes the free sequence of the next
/// epoch. Handles are live iff `ringseq[seqno & mask] == seqno + 1`, which
/// can be true for at most one epoch per wrap — that monotonicity is the
/// whole use-after-free story, there are no locks to take.
pub struct ArenaRing {
    mem: NonNull<u8>,
    seqno: CachePadded<AtomicU32>,
    ringseq: Box<[CachePadded<AtomicU32>]>,
    heads: Box<[CachePadded<AtomicU32>]>,
}

// Safety: slot ownership is handed off through the ringseq atomics
unsafe impl Send for ArenaRing {}
// Safety: see above
unsafe impl Sync for ArenaRing {}

// === impl ArenaRing ===

impl ArenaRing {
    #[must_use]
    pub fn new() -> Self {
        // Safety: layout has non-zero size
        let mem = unsafe { std::alloc::alloc(Self::layout()) };

        Self {
            mem: NonNull::new(mem).expect("arena ring allocation failed"),
            seqno: CachePadded::new(AtomicU32::new(SLOT_COUNT)),
            ringseq: (0..SLOT_COUNT)
                .map(|i| CachePadded::new(AtomicU32::new(SLOT_COUNT + i)))
                .collect(),
            heads: (0..SLOT_COUNT)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align((SLOT_COUNT * SLOT_CAPACITY) as usize, ALIGN)
            .expect("arena ring layout")
    }

    /// Whether `handle` refers to a currently-acquired slot.
    #[inline]
    pub fn exists(&self, handle: ArenaHandle) -> bool {
        let slot = (handle.seqno & SLOT_MASK) as usize;
        self.ringseq[slot].load(Ordering::Relaxed) == handle.seqno.wrapping_add(1)
    }

    /// Claims a free slot, resetting its bump pointer.
    ///
    /// Returns `None` when all `SLOT_COUNT` slots are simultaneously
    /// acquired.
    pub fn acquire(&self) -> Option<ArenaHandle> {
        let seqbase = self.seqno.load(Ordering::Relaxed);
        for i in 0..SLOT_COUNT {
            let seqno = seqbase.wrapping_add(i);
            let slot = (seqno & SLOT_MASK) as usize;
            if self.ringseq[slot]
                .compare_exchange(
                    seqno,
                    seqno.wrapping_add(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.seqno.fetch_add(1, Ordering::Release);
                self.heads[slot].store(0, Ordering::Release);
                return Some(ArenaHandle { seqno });
            }
        }
        None
    }

    /// Releases an acquired slot. Idempotent: a second release (or a release
    /// of a stale handle) fails the sequence comparison and does nothing.
    pub fn release(&self, handle: ArenaHandle) {
        let slot = (handle.seqno & SLOT_MASK) as usize;
        let _ = self.ringseq[slot].compare_exchange(
            handle.seqno.wrapping_add(1),
            handle.seqno.wrapping_add(SLOT_COUNT),
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Bump-allocates `bytes` (padded to 16) out of the handle's slot.
    ///
    /// Returns `None` for a stale handle, a zero or over-sized request, or a
    /// spent slot. The returned memory is valid until the slot is released.
    pub fn alloc(&self, handle: ArenaHandle, bytes: u32) -> Option<NonNull<u8>> {
        if !self.exists(handle) {
            return None;
        }
        let bytes = bytes.checked_add(15)? & !15;
        if bytes == 0 || bytes >= SLOT_CAPACITY {
            return None;
        }

        let slot = handle.seqno & SLOT_MASK;
        let head = self.heads[slot as usize].fetch_add(bytes, Ordering::Acquire);
        if head.checked_add(bytes)? > SLOT_CAPACITY {
            // over-allocation is silently refused; the slot stays usable for
            // smaller requests until release
            return None;
        }
        // Safety: [head, head + bytes) lies inside slot `slot`, which the
        // sequence protocol hands to exactly one holder per epoch
        Some(unsafe { self.mem.add((slot * SLOT_CAPACITY + head) as usize) })
    }
}

impl Default for ArenaRing {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArenaRing {
    fn drop(&mut self) {
        // Safety: `mem` was allocated with `Self::layout()` in `new`
        unsafe {
            std::alloc::dealloc(self.mem.as_ptr(), Self::layout());
        }
    }
}

impl fmt::Debug for ArenaRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaRing")
            .field("seqno", &self.seqno.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
