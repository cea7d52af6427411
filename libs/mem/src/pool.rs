// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::ptr::NonNull;

use spin::RawSpinlock;
use talc::{ErrOnOom, Span, Talc, Talck};

use crate::header::ALIGN;

/// A fixed-capacity general-purpose pool: a segregated-fit [`Talc`] heap
/// claiming one system allocation, fronted by a spinlock.
///
/// This backs the `Perm` tier (one pool shared by everyone) and the `Thread`
/// tier (one pool per thread). Exhaustion surfaces as `None`; the pool never
/// grows.
pub(crate) struct Pool {
    talck: Talck<RawSpinlock, ErrOnOom>,
    base: NonNull<u8>,
    layout: Layout,
}

// Safety: the base pointer is only used by the lock-guarded talc heap and
// the Drop impl
unsafe impl Send for Pool {}
// Safety: see above
unsafe impl Sync for Pool {}

// === impl Pool ===

impl Pool {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 4 * ALIGN, "pool capacity too small");
        let layout = Layout::from_size_align(capacity, ALIGN).expect("pool layout");

        // Safety: layout has non-zero size
        let base = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(base).expect("pool backing allocation failed");

        let talck = Talc::new(ErrOnOom).lock();
        // Safety: the span covers exactly the fresh allocation above, which
        // is unused and owned by this pool for its whole lifetime
        unsafe {
            talck
                .lock()
                .claim(Span::from_base_size(base.as_ptr(), capacity))
                .expect("claiming pool span");
        }

        Self { talck, base, layout }
    }

    /// Allocates `total` bytes aligned to [`ALIGN`], or `None` when the pool
    /// is exhausted.
    pub(crate) fn alloc(&self, total: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(total, ALIGN).ok()?;
        // Safety: the heap was claimed in `new` and stays valid until drop
        unsafe { self.talck.lock().malloc(layout).ok() }
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`Pool::alloc`] on this pool with the
    /// same `total`, and must not be used afterwards.
    pub(crate) unsafe fn free(&self, block: NonNull<u8>, total: usize) {
        let layout = Layout::from_size_align(total, ALIGN).expect("pool layout");
        // Safety: ensured by caller
        unsafe {
            self.talck.lock().free(block, layout);
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Safety: `base` was allocated with `layout` in `new`; the talc heap
        // dies with self so no block can outlive the backing storage
        unsafe {
            std::alloc::dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let pool = Pool::new(64 << 10);
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(128).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr().addr() % ALIGN, 0);
        assert_eq!(b.as_ptr().addr() % ALIGN, 0);
        // Safety: both blocks came from this pool with these sizes
        unsafe {
            pool.free(a, 64);
            pool.free(b, 128);
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = Pool::new(4 << 10);
        let mut blocks = Vec::new();
        while let Some(block) = pool.alloc(256) {
            blocks.push(block);
            assert!(blocks.len() < 64, "pool failed to exhaust");
        }
        // Safety: every block came from this pool with size 256
        unsafe {
            for block in blocks {
                pool.free(block, 256);
            }
        }
        // freed everything, so a fresh alloc succeeds again
        assert!(pool.alloc(256).is_some());
    }
}
