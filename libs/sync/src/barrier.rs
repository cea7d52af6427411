// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::Semaphore;

/// A reusable two-phase rendezvous for a fixed set of threads.
///
/// Phase one counts arrivals up; the last arriver releases everyone. Phase
/// two counts back down; the last departer releases everyone again. The
/// second phase keeps a fast re-entering thread from slipping back into
/// phase one while a laggard is still leaving, which is what makes the
/// barrier safe to reuse every frame.
pub struct Barrier {
    counter: AtomicI32,
    size: i32,
    phases: [Semaphore; 2],
}

// === impl Barrier ===

impl Barrier {
    /// Creates a barrier for `size` threads.
    #[must_use]
    pub const fn new(size: i32) -> Self {
        assert!(size > 0);
        Self {
            counter: AtomicI32::new(0),
            size,
            phases: [Semaphore::new(0), Semaphore::new(0)],
        }
    }

    /// Blocks until all `size` threads have arrived, then again until all of
    /// them have left.
    pub fn wait(&self) {
        self.phase1();
        self.phase2();
    }

    fn phase1(&self) {
        let counter = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(counter <= self.size);
        if counter == self.size {
            self.phases[0].signal(self.size as usize);
        }
        self.phases[0].wait();
    }

    fn phase2(&self) {
        let counter = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(counter >= 0);
        if counter == 0 {
            self.phases[1].signal(self.size as usize);
        }
        self.phases[1].wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn single_thread_passes() {
        let bar = Barrier::new(1);
        bar.wait();
        bar.wait();
    }

    #[test]
    fn reusable_across_rounds() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 16;

        let bar = Arc::new(Barrier::new(THREADS as i32));
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let bar = bar.clone();
                let arrived = arrived.clone();
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        bar.wait();
                        // every thread observes the full round's arrivals
                        assert!(arrived.load(Ordering::SeqCst) >= (round + 1) * THREADS);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arrived.load(Ordering::SeqCst), THREADS * ROUNDS);
    }
}
