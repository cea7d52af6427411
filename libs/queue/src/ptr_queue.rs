// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use sync::RwLock;

const MIN_CAPACITY: u32 = 16;

/// Error returned by [`PtrQueue::try_push`] when every slot is occupied.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Full(pub(crate) ());

impl fmt::Display for Full {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("queue full")
    }
}

impl core::error::Error for Full {}

/// A bounded multi-producer multi-consumer pointer queue.
///
/// Slots are `AtomicPtr`s in a power-of-two ring; null marks an empty slot.
/// Producers claim any null slot at or after the write cursor with a release
/// compare-exchange, consumers claim any non-null slot at or after the read
/// cursor with an acquire compare-exchange, and the free-running cursors
/// only track the element count. The reader/writer lock is taken shared by
/// every operation and exclusively only by [`reserve`], which rebuilds the
/// ring.
///
/// Because null-vs-non-null is the only discriminator, the queue cannot
/// tell two pushes of the same pointer apart: each successful push must
/// stand for its own unit of ownership, consumed by exactly one pop.
/// Re-publishing a pointer whose earlier push is still in flight is only
/// sound under that discipline (the scheduler's task references follow it).
///
/// [`reserve`]: Self::reserve
pub struct PtrQueue<T> {
    lock: RwLock<()>,
    slots: UnsafeCell<Vec<AtomicPtr<T>>>,
    width: AtomicU32,
    iwrite: AtomicU32,
    iread: AtomicU32,
}

// Safety: the queue hands raw pointers between threads without dereferencing
// them; `T: Send` makes that hand-off sound.
unsafe impl<T: Send> Send for PtrQueue<T> {}
// Safety: see above; all interior mutability is fenced by atomics and the
// resize lock.
unsafe impl<T: Send> Sync for PtrQueue<T> {}

fn null_slots<T>(width: u32) -> Vec<AtomicPtr<T>> {
    let mut slots = Vec::with_capacity(width as usize);
    slots.resize_with(width as usize, || AtomicPtr::new(ptr::null_mut()));
    slots
}

// === impl PtrQueue ===

impl<T> PtrQueue<T> {
    /// Creates a queue with at least `capacity` slots (rounded up to a power
    /// of two, minimum 16).
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let width = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            lock: RwLock::new(()),
            slots: UnsafeCell::new(null_slots(width)),
            width: AtomicU32::new(width),
            iwrite: AtomicU32::new(0),
            iread: AtomicU32::new(0),
        }
    }

    /// Number of elements currently in flight.
    #[inline]
    pub fn len(&self) -> u32 {
        self.iwrite
            .load(Ordering::Acquire)
            .wrapping_sub(self.iread.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    /// Grows the ring to hold at least `capacity` elements, preserving the
    /// in-flight order. No-op if the ring is already large enough.
    pub fn reserve(&self, capacity: u32) {
        let new_width = capacity.max(MIN_CAPACITY).next_power_of_two();
        if new_width <= self.capacity() {
            return;
        }

        // build the replacement ring before taking the write lock
        let new_slots = null_slots::<T>(new_width);

        let guard = self.lock.write();
        let old_width = self.width.load(Ordering::Acquire);
        if new_width > old_width {
            let old_mask = old_width - 1;
            let iread = self.iread.load(Ordering::Acquire);
            let len = self.iwrite.load(Ordering::Acquire).wrapping_sub(iread);

            // Safety: the write lock excludes every other accessor of `slots`
            let slots = unsafe { &mut *self.slots.get() };
            for i in 0..len {
                let src = (iread.wrapping_add(i) & old_mask) as usize;
                let value = slots[src].load(Ordering::Relaxed);
                new_slots[i as usize].store(value, Ordering::Relaxed);
            }
            *slots = new_slots;
            self.width.store(new_width, Ordering::Release);
            self.iread.store(0, Ordering::Release);
            self.iwrite.store(len, Ordering::Release);
        }
        drop(guard);
    }

    /// Attempts to publish `value` without growing the ring.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] when every slot is occupied.
    pub fn try_push(&self, value: NonNull<T>) -> Result<(), Full> {
        let guard = self.lock.read();
        let result = self.push_in_place(value);
        drop(guard);
        result
    }

    /// Publishes `value`, growing the ring if it is full.
    pub fn push(&self, value: NonNull<T>) {
        loop {
            if self.try_push(value).is_ok() {
                return;
            }
            self.reserve(self.len() + 1);
        }
    }

    /// Consumes one pointer, or `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<NonNull<T>> {
        let guard = self.lock.read();

        let mask = self.capacity() - 1;
        let mut i = self.iread.load(Ordering::Acquire);
        while self.len() != 0 {
            let slot = self.slot(i & mask);
            let prev = slot.load(Ordering::Relaxed);
            if !prev.is_null()
                && slot
                    .compare_exchange(prev, ptr::null_mut(), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                self.iread.fetch_add(1, Ordering::Release);
                drop(guard);
                // Safety: only non-null pointers are ever published
                return Some(unsafe { NonNull::new_unchecked(prev) });
            }
            i = i.wrapping_add(1);
        }

        drop(guard);
        None
    }

    fn push_in_place(&self, value: NonNull<T>) -> Result<(), Full> {
        let mask = self.capacity() - 1;
        let mut i = self.iwrite.load(Ordering::Acquire);
        while self.len() <= mask {
            let slot = self.slot(i & mask);
            if slot
                .compare_exchange(
                    ptr::null_mut(),
                    value.as_ptr(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.iwrite.fetch_add(1, Ordering::Release);
                return Ok(());
            }
            i = i.wrapping_add(1);
        }
        Err(Full(()))
    }

    #[inline]
    fn slot(&self, index: u32) -> &AtomicPtr<T> {
        // Safety: callers hold at least the read lock, so the slot vector is
        // not being replaced; the atomics themselves handle slot races.
        let slots = unsafe { &*self.slots.get() };
        &slots[index as usize]
    }
}

impl<T> fmt::Debug for PtrQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtrQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}
