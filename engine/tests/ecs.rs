// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Entity-store scenarios through a whole engine: bulk create, interleaved
//! destroy, parallel slab sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use glint_engine::{ComponentFlags, Config, Engine, MemoryConfig, Position};

fn engine() -> Engine {
    Engine::new(&Config {
        memory: MemoryConfig {
            perm_capacity: 64 << 20,
            temp_capacity: 1 << 20,
            temp_frames: 2,
            thread_capacity: 1 << 20,
        },
        worker_threads: 4,
    })
}

const TRANSFORM: ComponentFlags = ComponentFlags::POSITION
    .union(ComponentFlags::ROTATION)
    .union(ComponentFlags::SCALE)
    .union(ComponentFlags::LOCAL_TO_WORLD);

#[test]
fn create_destroy_half_then_sweep() {
    const COUNT: usize = 10_000;

    let engine = engine();
    let world = engine.world();

    let entities: Vec<_> = (0..COUNT).map(|_| world.create(TRANSFORM)).collect();

    // destroy every other entity
    for entity in entities.iter().step_by(2) {
        assert!(world.destroy(*entity));
    }
    for (i, entity) in entities.iter().enumerate() {
        assert_eq!(world.is_current(*entity), i % 2 == 1);
    }

    // sweep: one marker per surviving entity
    let sum = Arc::new(AtomicI64::new(0));
    {
        let sum = sum.clone();
        world.run_foreach(TRANSFORM, ComponentFlags::empty(), move |view| {
            for entity in view.entities() {
                assert!(entity.version & 1 == 1);
                sum.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    assert_eq!(sum.load(Ordering::Relaxed), (COUNT / 2) as i64);

    // destroyed ids stay destroyed through the sweep
    for entity in entities.iter().step_by(2) {
        assert!(!world.destroy(*entity));
    }
}

#[test]
fn parallel_writes_stay_per_slab() {
    const COUNT: i32 = 5_000;

    let engine = engine();
    let world = engine.world();
    for _ in 0..COUNT {
        world.create(TRANSFORM);
    }

    // write a marker through one sweep, verify through another
    world.run_foreach(TRANSFORM, ComponentFlags::empty(), |view| {
        // Safety: the only view of the position column in this callback
        let positions = unsafe { view.column_mut::<Position>() }.unwrap();
        for position in positions {
            *position = Position([1.0, 2.0, 3.0, 4.0]);
        }
    });

    let checked = Arc::new(AtomicI64::new(0));
    {
        let checked = checked.clone();
        world.run_foreach(TRANSFORM, ComponentFlags::empty(), move |view| {
            let positions = view.column::<Position>().unwrap();
            for position in positions {
                assert_eq!(position.0, [1.0, 2.0, 3.0, 4.0]);
                checked.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    assert_eq!(checked.load(Ordering::Relaxed), i64::from(COUNT));
}

#[test]
fn stale_ids_are_harmless_queries() {
    let engine = engine();
    let world = engine.world();

    let entity = world.create(ComponentFlags::POSITION | ComponentFlags::DRAWABLE);
    assert!(world.has_all(entity, ComponentFlags::POSITION | ComponentFlags::DRAWABLE));

    world.destroy(entity);
    assert!(!world.is_current(entity));
    assert_eq!(world.flags_of(entity), ComponentFlags::empty());
    assert!(!world.has_any(entity, ComponentFlags::all()));

    // the recycled index gets a different generation
    let successor = world.create(ComponentFlags::POSITION | ComponentFlags::DRAWABLE);
    assert_eq!(successor.index, entity.index);
    assert_ne!(successor.version, entity.version);
    assert!(!world.is_current(entity));
}

#[test]
fn frame_loop_with_mixed_load() {
    let engine = engine();
    let world = engine.world();
    let mut live = Vec::new();

    for frame in 0..8 {
        for _ in 0..256 {
            live.push(world.create(TRANSFORM));
        }
        // retire a third of the population each frame
        let retire = live.len() / 3;
        for entity in live.drain(..retire) {
            assert!(world.destroy(entity));
        }

        let seen = Arc::new(AtomicI64::new(0));
        {
            let seen = seen.clone();
            world.run_foreach(TRANSFORM, ComponentFlags::empty(), move |view| {
                seen.fetch_add(i64::from(view.len()), Ordering::Relaxed);
            });
        }
        assert_eq!(
            seen.load(Ordering::Relaxed),
            live.len() as i64,
            "sweep count diverged on frame {frame}"
        );

        engine.update();
    }
}
