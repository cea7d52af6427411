// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;

use criterion::{Criterion, criterion_group, criterion_main};
use glint_queue::PtrQueue;

fn push_pop(c: &mut Criterion) {
    let queue = PtrQueue::<u8>::new(256);
    let token = NonNull::new(0x10_usize as *mut u8).unwrap();

    c.bench_function("ptr_queue/push_pop", |b| {
        b.iter(|| {
            queue.try_push(std::hint::black_box(token)).unwrap();
            std::hint::black_box(queue.try_pop());
        });
    });

    c.bench_function("ptr_queue/burst_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                queue.try_push(token).unwrap();
            }
            while queue.try_pop().is_some() {}
        });
    });
}

criterion_group!(benches, push_pop);
criterion_main!(benches);
