// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide registry of small dense thread ids.
//!
//! Every thread that touches the engine core gets a stable `usize` id below
//! [`MAX_THREADS`], assigned lazily on first use and recycled when the thread
//! exits. The per-thread allocator tier and the allocation headers key off
//! these ids, so they must stay small and dense rather than being the OS
//! thread id.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Upper bound on concurrently live thread ids.
///
/// Exceeding this is a contract violation: the engine sizes per-thread state
/// (thread allocator pools, scratch stacks) as fixed arrays of this length.
pub const MAX_THREADS: usize = 64;

struct Registry {
    next: AtomicUsize,
    free: Mutex<Vec<usize>>,
}

static REGISTRY: Registry = Registry {
    next: AtomicUsize::new(0),
    free: Mutex::new(Vec::new()),
};

struct Registration(Cell<Option<usize>>);

impl Registration {
    const fn new() -> Self {
        Self(Cell::new(None))
    }

    #[inline(always)]
    fn current(&self) -> usize {
        if let Some(tid) = self.0.get() {
            return tid;
        }

        self.register()
    }

    #[cold]
    fn register(&self) -> usize {
        let id = REGISTRY
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| REGISTRY.next.fetch_add(1, Ordering::AcqRel));

        assert!(
            id < MAX_THREADS,
            "thread id {id} would exceed the maximum thread count ({MAX_THREADS})",
        );

        self.0.set(Some(id));
        id
    }
}

// Returning the id to the free list on thread exit keeps the id space dense
// even when worker pools are torn down and rebuilt.
impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(id) = self.0.get() {
            REGISTRY.free.lock().push(id);
        }
    }
}

std::thread_local! {
    static REGISTRATION: Registration = const { Registration::new() };
}

/// Returns the calling thread's engine-local id, assigning one on first use.
#[inline]
pub fn current() -> usize {
    REGISTRATION.with(Registration::current)
}
