// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Release-once handles under contention: sixteen racing deleters, one
//! winner, one payload copy, one free.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use glint_engine::{Memory, MemoryConfig, VHandle};

fn memory() -> Arc<Memory> {
    Arc::new(Memory::new(&MemoryConfig {
        perm_capacity: 4 << 20,
        temp_capacity: 4096,
        temp_frames: 2,
        thread_capacity: 1 << 20,
    }))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Sample {
    tag: u64,
    value: u32,
}

#[test]
fn sixteen_deleters_one_winner() {
    const THREADS: usize = 16;
    const ROUNDS: usize = 50;

    let memory = memory();
    for round in 0..ROUNDS {
        let expected = Sample {
            tag: 0x5eed_0000 + round as u64,
            value: round as u32,
        };
        let handle = VHandle::new(&memory, expected).expect("perm pool");
        let wins = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(std::sync::Barrier::new(THREADS));

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let memory = memory.clone();
                let wins = wins.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    gate.wait();
                    if let Some(value) = handle.del(&memory) {
                        assert_eq!(value, expected, "winner reads the payload intact");
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("deleter panicked");
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one delete wins");
        assert_eq!(handle.get(), None, "handle is dead after the race");
    }
}

#[test]
fn stale_copies_stay_dead() {
    let memory = memory();
    let handle = VHandle::new(&memory, 7_u64).expect("perm pool");
    let copy = handle;

    assert_eq!(handle.del(&memory), Some(7));
    assert_eq!(copy.get(), None);
    assert_eq!(copy.del(&memory), None);

    // later allocations never revive old versions
    for _ in 0..100 {
        let fresh = VHandle::new(&memory, 9_u64).expect("perm pool");
        assert_eq!(copy.get(), None);
        fresh.del(&memory);
    }
}
