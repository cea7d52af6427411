// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};
use core::fmt;

use spin::Backoff;

use crate::Semaphore;

mycelium_bitfield::bitfield! {
    /// Reader/writer accounting packed into one word so a single
    /// compare-exchange can transition the whole lock.
    #[derive(Eq, PartialEq)]
    struct State<u32> {
        /// Writers holding or queued for the lock.
        const WRITERS = 8;
        /// Readers parked behind a writer.
        const WAITERS = 8;
        /// Readers holding the lock.
        const READERS = 8;
    }
}

const FIELD_MAX: u32 = 0xff;

/// A blocking readers-writer lock.
///
/// Reader, parked-reader and writer counts are packed into one atomic word;
/// blocked threads sleep on one of two semaphores instead of spinning. On
/// write-unlock, parked readers are promoted as a batch before the next
/// queued writer runs, so a stream of writers cannot starve readers
/// indefinitely.
///
/// At most 255 concurrent holders of each class are supported; exceeding
/// that is a contract violation.
pub struct RwLock<T: ?Sized> {
    state: AtomicU32,
    rsema: Semaphore,
    wsema: Semaphore,
    data: UnsafeCell<T>,
}

/// RAII guard for shared access. Read access is released on drop.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    marker: PhantomData<&'a T>,
}

/// RAII guard for exclusive access. Write access is released on drop.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the packed state word and semaphores serialize access to the data
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
// Safety: the packed state word and semaphores serialize access to the data
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

// === impl RwLock ===

impl<T> RwLock<T> {
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            rsema: Semaphore::new(0),
            wsema: Semaphore::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this lock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires shared access, blocking while a writer holds the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut boff = Backoff::new();
        let mut old = State::from_bits(self.state.load(Ordering::Relaxed));
        loop {
            let behind_writer = old.get(State::WRITERS) != 0;
            let new = if behind_writer {
                let waiters = old.get(State::WAITERS) + 1;
                assert!(waiters <= FIELD_MAX, "rwlock waiter count overflow");
                old.with(State::WAITERS, waiters)
            } else {
                let readers = old.get(State::READERS) + 1;
                assert!(readers <= FIELD_MAX, "rwlock reader count overflow");
                old.with(State::READERS, readers)
            };

            match self.state.compare_exchange(
                old.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if behind_writer {
                        self.rsema.wait();
                    }
                    break;
                }
                Err(observed) => old = State::from_bits(observed),
            }
            boff.spin();
        }

        RwLockReadGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Acquires exclusive access, blocking while any readers or another
    /// writer hold the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut boff = Backoff::new();
        let mut old = State::from_bits(self.state.load(Ordering::Relaxed));
        loop {
            let writers = old.get(State::WRITERS) + 1;
            assert!(writers <= FIELD_MAX, "rwlock writer count overflow");
            let new = old.with(State::WRITERS, writers);

            match self.state.compare_exchange(
                old.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if old.get(State::READERS) != 0 || old.get(State::WRITERS) != 0 {
                        self.wsema.wait();
                    }
                    break;
                }
                Err(observed) => old = State::from_bits(observed),
            }
            boff.spin();
        }

        RwLockWriteGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    fn unlock_read(&self) {
        let mut boff = Backoff::new();
        let mut old = State::from_bits(self.state.load(Ordering::Relaxed));
        loop {
            let readers = old.get(State::READERS);
            debug_assert!(readers > 0, "read-unlocked an rwlock with no readers");
            let new = old.with(State::READERS, readers - 1);

            match self.state.compare_exchange(
                old.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // the last reader out hands the lock to a queued writer
                    if readers == 1 && old.get(State::WRITERS) != 0 {
                        self.wsema.signal(1);
                    }
                    break;
                }
                Err(observed) => old = State::from_bits(observed),
            }
            boff.spin();
        }
    }

    fn unlock_write(&self) {
        let mut boff = Backoff::new();
        let mut old = State::from_bits(self.state.load(Ordering::Relaxed));
        loop {
            let writers = old.get(State::WRITERS);
            let waiters = old.get(State::WAITERS);
            debug_assert!(writers > 0, "write-unlocked an rwlock with no writer");
            debug_assert_eq!(old.get(State::READERS), 0);

            // promote parked readers as a batch before the next writer runs
            let new = if waiters != 0 {
                old.with(State::READERS, waiters)
                    .with(State::WAITERS, 0)
                    .with(State::WRITERS, writers - 1)
            } else {
                old.with(State::WRITERS, writers - 1)
            };

            match self.state.compare_exchange(
                old.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if waiters != 0 {
                        self.rsema.signal(waiters as usize);
                    } else if writers > 1 {
                        self.wsema.signal(1);
                    }
                    break;
                }
                Err(observed) => old = State::from_bits(observed),
            }
            boff.spin();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &State::from_bits(self.state.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

// === impl RwLockReadGuard ===

impl<'a, T: ?Sized + 'a> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds shared access; only readers are live
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> Drop for RwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

// === impl RwLockWriteGuard ===

impl<'a, T: ?Sized + 'a> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds exclusive access
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for RwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds exclusive access
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> Drop for RwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
