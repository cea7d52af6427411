// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use crate::header::{ALIGN, Header};
use crate::pool::Pool;
use crate::temp::TempRing;

/// Which tier an allocation lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum AllocKind {
    /// System allocator; usable before (and while) the pools exist.
    Init = 0,
    /// Process-lifetime pool shared by all threads.
    Perm = 1,
    /// Frame-lifetime scratch, reclaimed wholesale every frame.
    Temp = 2,
    /// Per-thread pool; allocations must be freed on the owning thread.
    Thread = 3,
}

impl AllocKind {
    pub(crate) fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Init),
            1 => Some(Self::Perm),
            2 => Some(Self::Temp),
            3 => Some(Self::Thread),
            _ => None,
        }
    }
}

/// Sizing for [`Memory::new`].
#[derive(Copy, Clone, Debug)]
pub struct MemoryConfig {
    /// Capacity of the shared `Perm` pool in bytes.
    pub perm_capacity: usize,
    /// Capacity of each `Temp` frame buffer in bytes.
    pub temp_capacity: usize,
    /// Number of `Temp` frame buffers (at least 2).
    pub temp_frames: usize,
    /// Capacity of each per-thread pool in bytes.
    pub thread_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            perm_capacity: 64 << 20,
            temp_capacity: 16 << 20,
            temp_frames: 4,
            thread_capacity: 4 << 20,
        }
    }
}

/// An owning handle to one allocation.
///
/// The handle knows where the block lives and how long the user region is;
/// the tier and the allocating thread are recorded in the opaque prefix the
/// allocator keeps in front of the pointer. Dropping an `Allocation` leaks
/// the block (harmless for `Temp`, a leak for the pool tiers) — hand it
/// back with [`Memory::free`].
pub struct Allocation {
    user: NonNull<u8>,
    len: usize,
}

// Safety: an Allocation is an exclusive handle to its memory region
unsafe impl Send for Allocation {}
// Safety: shared references only expose reads of the region; callers that
// mix reads with raw-pointer writes (the ECS row stores) provide their own
// locking
unsafe impl Sync for Allocation {}

// === impl Allocation ===

impl Allocation {
    /// Length of the user region in bytes, as requested at allocation time.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The tier this allocation was served from.
    #[inline]
    pub fn kind(&self) -> AllocKind {
        self.header().kind()
    }

    /// Engine thread id of the allocating thread.
    #[inline]
    pub fn tid(&self) -> usize {
        self.header().tid()
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.user.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.user
    }

    /// Borrows the user region.
    ///
    /// For `Temp` allocations the region is only defined until the ring has
    /// advanced `temp_frames` times; reading after that races the next
    /// frame's writers.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the handle owns [user, user + len)
        unsafe { core::slice::from_raw_parts(self.user.as_ptr(), self.len) }
    }

    /// Mutably borrows the user region. See [`as_slice`](Self::as_slice)
    /// for the `Temp` lifetime caveat.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the handle owns [user, user + len) exclusively
        unsafe { core::slice::from_raw_parts_mut(self.user.as_ptr(), self.len) }
    }

    fn header(&self) -> &Header {
        // Safety: the handle was produced by Memory::alloc, which installed
        // a header right below the user pointer
        unsafe { Header::from_user(self.user).as_ref() }
    }

    /// Reconstitutes a handle from a raw user pointer.
    ///
    /// # Safety
    ///
    /// `user` must be the pointer of a live allocation made by this module,
    /// with `len` its original request size, and no other handle to it may
    /// exist.
    pub unsafe fn from_raw(user: NonNull<u8>, len: usize) -> Self {
        Self { user, len }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("kind", &self.kind())
            .field("len", &self.len)
            .field("ptr", &self.user)
            .finish()
    }
}

/// The engine's memory system. One value per engine, shared by reference
/// across all threads.
pub struct Memory {
    perm: Pool,
    temp: TempRing,
    thread_pools: Box<[std::sync::OnceLock<Pool>]>,
    thread_capacity: usize,
}

// === impl Memory ===

impl Memory {
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        let this = Self {
            perm: Pool::new(config.perm_capacity),
            temp: TempRing::new(config.temp_frames, config.temp_capacity),
            thread_pools: (0..util::tid::MAX_THREADS)
                .map(|_| std::sync::OnceLock::new())
                .collect(),
            thread_capacity: config.thread_capacity,
        };
        tracing::debug!(
            perm = this.perm.capacity(),
            temp = this.temp.frame_capacity(),
            temp_frames = this.temp.frame_count(),
            thread = this.thread_capacity,
            "memory system up"
        );
        this
    }

    /// Allocates `bytes` from the given tier.
    ///
    /// Returns `None` for zero-sized requests and on capacity exhaustion
    /// (`Temp` frame budget spent, pool full). The returned pointer is
    /// 16-aligned.
    pub fn alloc(&self, kind: AllocKind, bytes: usize) -> Option<Allocation> {
        if bytes == 0 {
            return None;
        }
        let total = Header::total_size(bytes);
        let tid = util::tid::current();

        let block = match kind {
            AllocKind::Init => {
                let layout = Layout::from_size_align(total, ALIGN).ok()?;
                // Safety: layout has non-zero size
                NonNull::new(unsafe { std::alloc::alloc(layout) })?
            }
            AllocKind::Perm => self.perm.alloc(total)?,
            AllocKind::Temp => self.temp.alloc(total)?,
            AllocKind::Thread => self.thread_pool(tid).alloc(total)?,
        };

        // Safety: `block` is a fresh, exclusive region of `total` bytes
        let user = unsafe { Header::install(block, kind, total, tid) };
        Some(Allocation { user, len: bytes })
    }

    /// Allocates and zeroes.
    pub fn calloc(&self, kind: AllocKind, bytes: usize) -> Option<Allocation> {
        let mut allocation = self.alloc(kind, bytes)?;
        allocation.as_mut_slice().fill(0);
        Some(allocation)
    }

    /// Grows `allocation` to at least `bytes`, preserving its contents.
    ///
    /// A request that still fits the existing padded region returns the
    /// allocation unchanged. Growth allocates
    /// `max(2 × previous, 64, bytes)` from the same tier, copies, and frees
    /// the old block; `None` means the tier is exhausted (the original
    /// allocation is returned untouched inside the error).
    pub fn realloc(&self, allocation: Allocation, bytes: usize) -> Result<Allocation, Allocation> {
        let prev_user_bytes = allocation.header().user_bytes();
        if bytes <= prev_user_bytes {
            let mut allocation = allocation;
            allocation.len = bytes.max(allocation.len);
            return Ok(allocation);
        }

        let next_bytes = (prev_user_bytes * 2).max(64).max(bytes);
        let Some(mut next) = self.alloc(allocation.kind(), next_bytes) else {
            return Err(allocation);
        };
        next.len = bytes;
        next.as_mut_slice()[..allocation.len].copy_from_slice(allocation.as_slice());
        self.free(allocation);
        Ok(next)
    }

    /// Releases an allocation back to its tier.
    ///
    /// `Temp` frees are best-effort LIFO rollbacks; anything not freed in
    /// LIFO order is reclaimed at the frame boundary instead. `Thread`
    /// allocations must be freed on the thread that made them.
    pub fn free(&self, allocation: Allocation) {
        // Safety: the Allocation handle guarantees a live header
        let header = unsafe { Header::from_user(allocation.user) };
        // Safety: consuming the handle makes this the sole release
        let (kind, user_bytes, tid) = unsafe { Header::retire(header) };
        let total = user_bytes + ALIGN;
        let block = header.cast::<u8>();

        match kind {
            AllocKind::Init => {
                let layout = Layout::from_size_align(total, ALIGN).expect("alloc layout");
                // Safety: the block was produced by std::alloc::alloc with
                // this layout
                unsafe { std::alloc::dealloc(block.as_ptr(), layout) }
            }
            // Safety: the block came from the perm pool with this size
            AllocKind::Perm => unsafe { self.perm.free(block, total) },
            AllocKind::Temp => self.temp.free(block, total),
            AllocKind::Thread => {
                assert_eq!(
                    tid,
                    util::tid::current(),
                    "thread-tier allocation freed from a foreign thread"
                );
                // Safety: the block came from this thread's pool with this
                // size
                unsafe { self.thread_pool(tid).free(block, total) }
            }
        }
    }

    /// Advances the temp ring at the frame boundary.
    ///
    /// Everything allocated from `Temp` N-1 frames ago becomes invalid after
    /// the Nth call (N = configured frame count). Must not race in-flight
    /// `Temp` allocation.
    pub fn update(&self) {
        self.temp.update();
    }

    /// Number of frames a `Temp` allocation outlives its own.
    pub fn temp_frames(&self) -> usize {
        self.temp.frame_count()
    }

    fn thread_pool(&self, tid: usize) -> &Pool {
        self.thread_pools[tid].get_or_init(|| {
            tracing::debug!(tid, capacity = self.thread_capacity, "thread pool up");
            Pool::new(self.thread_capacity)
        })
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("perm_capacity", &self.perm.capacity())
            .field("temp_frames", &self.temp.frame_count())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small() -> Memory {
        Memory::new(&MemoryConfig {
            perm_capacity: 1 << 20,
            temp_capacity: 4096,
            temp_frames: 4,
            thread_capacity: 1 << 20,
        })
    }

    #[test]
    fn header_reflects_parameters() {
        let memory = small();
        for kind in [
            AllocKind::Init,
            AllocKind::Perm,
            AllocKind::Temp,
            AllocKind::Thread,
        ] {
            let allocation = memory.alloc(kind, 100).unwrap();
            assert_eq!(allocation.kind(), kind);
            assert_eq!(allocation.len(), 100);
            assert_eq!(allocation.tid(), util::tid::current());
            assert_eq!(allocation.as_ptr().addr() % 16, 0);
            memory.free(allocation);
        }
    }

    #[test]
    fn zero_sized_requests_refused() {
        let memory = small();
        assert!(memory.alloc(AllocKind::Perm, 0).is_none());
    }

    #[test]
    fn calloc_zeroes() {
        let memory = small();
        let allocation = memory.calloc(AllocKind::Perm, 256).unwrap();
        assert!(allocation.as_slice().iter().all(|&b| b == 0));
        memory.free(allocation);
    }

    #[test]
    fn realloc_preserves_contents() {
        let memory = small();
        let mut allocation = memory.alloc(AllocKind::Perm, 32).unwrap();
        allocation.as_mut_slice().fill(0x5a);

        let grown = memory.realloc(allocation, 1024).unwrap();
        assert_eq!(grown.len(), 1024);
        assert!(grown.as_slice()[..32].iter().all(|&b| b == 0x5a));
        memory.free(grown);
    }

    #[test]
    fn temp_overflow_returns_none() {
        let memory = small();
        // 4096-byte frames: a 16-byte request costs 32 bytes with its
        // header, so well under 512 requests must hit the budget
        let mut served = 0;
        for _ in 0..512 {
            if memory.alloc(AllocKind::Temp, 16).is_none() {
                break;
            }
            served += 1;
        }
        assert!(served < 512, "temp frame never overflowed");
        assert_eq!(served, 4096 / 32);
    }

    #[test]
    fn temp_survives_until_ring_wraps() {
        let memory = small();
        let mut allocation = memory.alloc(AllocKind::Temp, 64).unwrap();
        allocation.as_mut_slice().fill(0x77);

        // valid for frame_count - 1 further updates
        for _ in 0..memory.temp_frames() - 1 {
            memory.update();
            assert!(allocation.as_slice().iter().all(|&b| b == 0x77));
        }

        // after a full cycle the frame is reset; the same block is handed
        // out again
        memory.update();
        let recycled = memory.alloc(AllocKind::Temp, 64).unwrap();
        assert_eq!(recycled.as_ptr(), allocation.as_ptr());
    }

    #[test]
    fn thread_pool_is_lazy_and_owned() {
        let memory = small();
        let allocation = memory.alloc(AllocKind::Thread, 48).unwrap();
        memory.free(allocation);
    }

    #[test]
    #[should_panic]
    fn double_free_trips() {
        let memory = small();
        let allocation = memory.alloc(AllocKind::Perm, 32).unwrap();
        // Safety: deliberately aliased to provoke the double-free tripwire
        let alias = unsafe { Allocation::from_raw(allocation.as_non_null(), 32) };
        memory.free(allocation);
        memory.free(alias);
    }
}
