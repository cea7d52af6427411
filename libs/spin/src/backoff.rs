// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;
use std::time::Instant;

// Each retry is charged this many nanoseconds of busy-waiting.
const TICKS_PER_SPIN: u64 = 100;
// Budgets at or past this point are cheaper to sleep through than to burn.
const YIELD_THRESHOLD: u64 = 2_500;

/// Returns a monotonically non-decreasing tick in nanoseconds.
///
/// The epoch is the first call in the process; only differences between two
/// timestamps are meaningful.
#[inline]
pub fn timestamp() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Hardware hint that the caller is in a spin loop.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Relinquishes the remainder of the calling thread's timeslice.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

/// Adaptive back-off for contended retry loops.
///
/// Converts `spins` into a nanosecond budget; small budgets are burned on
/// [`pause`] so the waiter stays hot, large ones are handed back to the
/// scheduler with [`yield_now`]. Callers pass a monotonically increasing
/// `spins` count so that the back-off grows between retries.
pub fn spin(spins: u64) {
    let ticks = spins.saturating_mul(TICKS_PER_SPIN);
    if ticks >= YIELD_THRESHOLD {
        yield_now();
    } else {
        let end = timestamp() + ticks;
        loop {
            // loom interleavings never advance wall-clock time, so the loop
            // must hand control back to the model checker
            #[cfg(loom)]
            loom::thread::yield_now();

            pause();
            if timestamp() >= end {
                break;
            }
        }
    }
}

/// Retry helper carrying the growing spin count for [`spin`].
#[derive(Debug, Copy, Clone, Default)]
pub struct Backoff {
    spins: u64,
}

// === impl Backoff ===

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { spins: 0 }
    }

    /// Backs off once, waiting longer than the previous call did.
    #[inline]
    pub fn spin(&mut self) {
        self.spins += 1;
        spin(self.spins);
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.spins = 0;
    }
}
