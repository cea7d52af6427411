// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, Ordering};

use static_assertions::const_assert_eq;

use crate::AllocKind;

/// Allocation alignment, header size, and padding quantum, all in one.
pub const ALIGN: usize = 16;
const ALIGN_MASK: usize = ALIGN - 1;

/// The opaque prefix the allocator places immediately before every user
/// pointer.
///
/// `user_bytes` is the padded user region size (a multiple of [`ALIGN`]),
/// `tid` the engine thread id of the allocating thread, and `ref_count` a
/// double-free tripwire: it starts at one and must still be one when the
/// allocation is freed.
#[repr(C, align(16))]
pub(crate) struct Header {
    kind: i32,
    user_bytes: i32,
    tid: i32,
    ref_count: AtomicI32,
}

const_assert_eq!(size_of::<Header>(), ALIGN);

// === impl Header ===

impl Header {
    /// Total block size (header + padded user region) for a user request of
    /// `bytes`.
    #[inline]
    pub(crate) fn total_size(bytes: usize) -> usize {
        (bytes + ALIGN + ALIGN_MASK) & !ALIGN_MASK
    }

    /// Stamps a fresh header at `block` and returns the user pointer living
    /// right behind it.
    ///
    /// # Safety
    ///
    /// `block` must point to at least `total` bytes of writable memory
    /// aligned to [`ALIGN`], where `total` came from [`Header::total_size`].
    pub(crate) unsafe fn install(
        block: NonNull<u8>,
        kind: AllocKind,
        total: usize,
        tid: usize,
    ) -> NonNull<u8> {
        debug_assert!(is_aligned(block.as_ptr().addr()));
        debug_assert!(is_aligned(total) && total > ALIGN);

        let header = block.cast::<Header>();
        let user_bytes = total - ALIGN;
        // Safety: caller guarantees the block is big enough and exclusive
        unsafe {
            header.write(Header {
                kind: kind as i32,
                user_bytes: i32::try_from(user_bytes).expect("allocation exceeds i32 bytes"),
                tid: i32::try_from(tid).expect("thread id"),
                ref_count: AtomicI32::new(1),
            });
            let user = block.add(ALIGN);
            #[cfg(debug_assertions)]
            user.write_bytes(0xcc, user_bytes);
            user
        }
    }

    /// Recovers the header behind a user pointer.
    ///
    /// # Safety
    ///
    /// `user` must be a pointer previously returned by [`Header::install`]
    /// whose allocation is still live.
    #[inline]
    pub(crate) unsafe fn from_user(user: NonNull<u8>) -> NonNull<Header> {
        assert!(is_aligned(user.as_ptr().addr()), "misaligned free");
        // Safety: `install` placed the header exactly ALIGN bytes below
        unsafe { user.sub(ALIGN).cast::<Header>() }
    }

    /// Validates the header and flips the ref count for release.
    ///
    /// # Safety
    ///
    /// See [`Header::from_user`]; additionally this must be called at most
    /// once per allocation.
    pub(crate) unsafe fn retire(header: NonNull<Header>) -> (AllocKind, usize, usize) {
        // Safety: ensured by caller
        let this = unsafe { header.as_ref() };
        let kind = AllocKind::from_raw(this.kind).expect("corrupt allocation header");
        let user_bytes = usize::try_from(this.user_bytes).expect("corrupt allocation header");
        let tid = usize::try_from(this.tid).expect("corrupt allocation header");
        assert!(user_bytes > 0 && is_aligned(user_bytes));
        assert!(tid < util::tid::MAX_THREADS);

        let prev = this.ref_count.fetch_sub(1, Ordering::Relaxed);
        assert_eq!(prev, 1, "double free of {kind:?} allocation");

        #[cfg(debug_assertions)]
        // Safety: the user region spans `user_bytes` behind the header
        unsafe {
            header.cast::<u8>().add(ALIGN).write_bytes(0xcd, user_bytes);
        }

        (kind, user_bytes, tid)
    }

    #[inline]
    pub(crate) fn kind(&self) -> AllocKind {
        AllocKind::from_raw(self.kind).expect("corrupt allocation header")
    }

    #[inline]
    pub(crate) fn user_bytes(&self) -> usize {
        usize::try_from(self.user_bytes).expect("corrupt allocation header")
    }

    #[inline]
    pub(crate) fn tid(&self) -> usize {
        usize::try_from(self.tid).expect("corrupt allocation header")
    }
}

#[inline]
pub(crate) fn is_aligned(value: usize) -> bool {
    value & ALIGN_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_size_pads_to_align() {
        assert_eq!(Header::total_size(1), 32);
        assert_eq!(Header::total_size(16), 32);
        assert_eq!(Header::total_size(17), 48);
        assert_eq!(Header::total_size(48), 64);
    }

    #[test]
    fn install_and_retire_round_trip() {
        let total = Header::total_size(24);
        let layout = std::alloc::Layout::from_size_align(total, ALIGN).unwrap();
        // Safety: fresh block of `total` bytes, freed below
        unsafe {
            let block = NonNull::new(std::alloc::alloc(layout)).unwrap();
            let user = Header::install(block, AllocKind::Perm, total, 3);
            assert_eq!(user.as_ptr().addr(), block.as_ptr().addr() + ALIGN);

            let header = Header::from_user(user);
            assert_eq!(header.as_ref().kind(), AllocKind::Perm);
            assert_eq!(header.as_ref().user_bytes(), total - ALIGN);
            assert_eq!(header.as_ref().tid(), 3);

            let (kind, user_bytes, tid) = Header::retire(header);
            assert_eq!((kind, user_bytes, tid), (AllocKind::Perm, total - ALIGN, 3));
            std::alloc::dealloc(block.as_ptr(), layout);
        }
    }
}
