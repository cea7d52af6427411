// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking synchronization primitives for the engine core.
//!
//! Workers idle on an [`Event`] rather than spinning; frame boundaries
//! rendezvous on a two-phase [`Barrier`]; the entity and slab registries are
//! guarded by the packed-word [`RwLock`]. All of them bottom out in the
//! counting [`Semaphore`].

mod barrier;
mod event;
mod mutex;
mod rw_lock;
mod semaphore;

pub use barrier::Barrier;
pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use rw_lock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
