// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The tiered memory system of the engine core.
//!
//! Four tiers, one front door: [`Memory::alloc`] routes by [`AllocKind`] and
//! every returned block carries an opaque 16-byte prefix that
//! [`Memory::free`] uses to route the release back to the right tier.
//!
//! - `Init` — the system allocator; bootstrap and backing storage.
//! - `Perm` — one shared segregated-fit pool behind a spinlock.
//! - `Temp` — a ring of per-frame bump buffers, reset collectively by
//!   [`Memory::update`].
//! - `Thread` — a lazily-built pool per thread, never shared.
//!
//! The [`ArenaRing`] and the per-thread [`with_scratch`] stack are the two
//! sidecar allocators for scratch scopes that are too short-lived even for
//! `Temp`.
//!
//! Under `cfg(loom)` only the arena ring is compiled — the pool tiers sit
//! on real system allocations that the model checker has no business
//! exploring.

mod arena;
mod loom;

pub use arena::{ArenaHandle, ArenaRing, SLOT_CAPACITY, SLOT_COUNT};

cfg_if::cfg_if! {
    if #[cfg(not(loom))] {
        mod header;
        mod memory;
        mod pool;
        mod stack;
        mod temp;

        pub use memory::{AllocKind, Allocation, Memory, MemoryConfig};
        pub use stack::with_scratch;
    }
}
