// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use core::{fmt, mem as core_mem};

use mem::{AllocKind, Allocation, Memory};

// Bias keeps live version words far away from plausible scribble values
// (zeroes, small integers, 0xcd fill).
const START_VERSION: u64 = 1_855_542_631;

// Stride of 4 keeps version parity stable: live versions are always odd
// biased, deleted versions even, and the bias is never reissued.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(0);

/// Payload begins at this offset; the version word occupies the first 8
/// bytes and the rest of the prefix is padding up to the allocator's 16-byte
/// grain.
const PAYLOAD_OFFSET: usize = 16;

/// A version-stamped handle to one heap-allocated value of type `T`.
///
/// The allocation embeds a version word in front of the payload; a handle
/// is valid exactly while the word matches the handle's version. [`del`]
/// flips the word with a compare-exchange, so across any number of racing
/// reclaimers exactly one wins, receives the value, and frees the memory —
/// everyone else gets `None`.
///
/// The handle is `Copy` and freely shareable. Stale access is detected, not
/// prevented: a [`get`] that races the winning [`del`] may read a payload
/// that is concurrently being reclaimed, which is only acceptable because
/// payloads are plain `Copy` data from the engine's own pool. Callers that
/// need stronger guarantees must fence deletes themselves.
///
/// [`get`]: VHandle::get
/// [`del`]: VHandle::del
pub struct VHandle<T> {
    version: u64,
    ptr: NonNull<u8>,
    _ty: core::marker::PhantomData<fn() -> T>,
}

impl<T> Copy for VHandle<T> {}
impl<T> Clone for VHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

// Safety: the handle carries a pointer it only reads through version-checked
// copies of `T: Copy` data
unsafe impl<T: Send> Send for VHandle<T> {}
// Safety: see above
unsafe impl<T: Sync> Sync for VHandle<T> {}

// === impl VHandle ===

impl<T: Copy> VHandle<T> {
    /// Copies `value` into a fresh `Perm` allocation stamped with a
    /// process-unique version.
    ///
    /// Returns `None` when the permanent pool is exhausted.
    pub fn new(memory: &Memory, value: T) -> Option<Self> {
        const {
            assert!(align_of::<T>() <= 16, "vhandle payloads are 16-aligned");
        }

        let allocation = memory.alloc(AllocKind::Perm, PAYLOAD_OFFSET + size_of::<T>())?;
        let ptr = allocation.as_non_null();
        let version = START_VERSION + NEXT_VERSION.fetch_add(4, Ordering::Relaxed);

        // Safety: the allocation spans the version word and the payload;
        // nothing else references it yet
        unsafe {
            Self::version_word(ptr).store(version, Ordering::Relaxed);
            ptr.add(PAYLOAD_OFFSET).cast::<T>().write(value);
        }
        // ownership moves into the version word; `del`'s winner rebuilds the
        // handle to free it
        core_mem::forget(allocation);

        Some(Self {
            version,
            ptr,
            _ty: core::marker::PhantomData,
        })
    }

    /// Reads the value if the handle is still live.
    pub fn get(self) -> Option<T> {
        // Safety: the pointer came from `new`; the pool keeps the region
        // mapped even after deletion, and the version check rejects stale
        // handles
        unsafe {
            if Self::version_word(self.ptr).load(Ordering::Acquire) != self.version {
                return None;
            }
            Some(self.ptr.add(PAYLOAD_OFFSET).cast::<T>().read())
        }
    }

    /// Deletes the handle, returning the value to exactly one caller.
    ///
    /// The first caller to flip the version word wins: it receives the
    /// payload and frees the allocation. Every other caller — concurrent or
    /// later, including holders of stale copies — gets `None`.
    pub fn del(self, memory: &Memory) -> Option<T> {
        // Safety: as in `get`; the compare-exchange makes the read-and-free
        // path exclusive
        unsafe {
            let word = Self::version_word(self.ptr);
            word.compare_exchange(
                self.version,
                self.version + 1,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .ok()?;

            let value = self.ptr.add(PAYLOAD_OFFSET).cast::<T>().read();
            memory.free(Allocation::from_raw(
                self.ptr,
                PAYLOAD_OFFSET + size_of::<T>(),
            ));
            Some(value)
        }
    }

    /// # Safety
    ///
    /// `ptr` must point at a live (or pool-retained) vhandle allocation.
    unsafe fn version_word<'a>(ptr: NonNull<u8>) -> &'a AtomicU64 {
        // Safety: the first 8 bytes of every vhandle allocation are the
        // version word, 16-aligned by the allocator
        unsafe { AtomicU64::from_ptr(ptr.cast::<u64>().as_ptr()) }
    }
}

impl<T> fmt::Debug for VHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VHandle")
            .field("version", &self.version)
            .field("ptr", &self.ptr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mem::MemoryConfig;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn memory() -> Memory {
        Memory::new(&MemoryConfig {
            perm_capacity: 1 << 20,
            temp_capacity: 4096,
            temp_frames: 2,
            thread_capacity: 1 << 20,
        })
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Payload {
        a: u64,
        b: u32,
    }

    #[test]
    fn get_after_new() {
        let memory = memory();
        let value = Payload { a: 77, b: 13 };
        let handle = VHandle::new(&memory, value).unwrap();
        assert_eq!(handle.get(), Some(value));
        assert_eq!(handle.get(), Some(value), "get is repeatable");
        assert_eq!(handle.del(&memory), Some(value));
    }

    #[test]
    fn del_invalidates() {
        let memory = memory();
        let handle = VHandle::new(&memory, 42_u64).unwrap();
        assert_eq!(handle.del(&memory), Some(42));
        assert_eq!(handle.get(), None);
        assert_eq!(handle.del(&memory), None, "second delete loses");
    }

    #[test]
    fn versions_are_process_unique() {
        let memory = memory();
        let a = VHandle::new(&memory, 1_u32).unwrap();
        let b = VHandle::new(&memory, 2_u32).unwrap();
        assert_ne!(a.version, b.version);
        a.del(&memory);
        b.del(&memory);
    }

    #[test]
    fn racing_deleters_have_one_winner() {
        const THREADS: usize = 16;

        let memory = Arc::new(memory());
        let handle = VHandle::new(&memory, 0xdead_beef_u64).unwrap();
        let wins = Arc::new(AtomicUsize::new(0));

        let gate = Arc::new(std::sync::Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let memory = memory.clone();
                let wins = wins.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    gate.wait();
                    if let Some(value) = handle.del(&memory) {
                        assert_eq!(value, 0xdead_beef);
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for join in handles {
            join.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
