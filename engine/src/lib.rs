// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The engine runtime core: one [`Engine`] value wiring the memory system,
//! the arena ring, the task scheduler, and the entity store together.
//!
//! Renderers, bakers and loaders are collaborators on top of this crate:
//! they submit tasks, sweep slabs with `foreach`, and burn `Temp` scratch
//! that the per-frame [`update`](Engine::update) reclaims. The engine owns
//! nothing global — construct it, share the pieces by `Arc`, drop it to
//! shut everything down.

mod config;

use std::sync::Arc;

pub use config::Config;
pub use ecs::{
    Bounds, Component, ComponentFlags, ComponentId, Drawable, Entity, Float4, LocalToWorld,
    Position, Rotation, Scale, SlabView, World,
};
pub use handle::{GenId, IdSet, VHandle};
pub use mem::{AllocKind, Allocation, ArenaHandle, ArenaRing, Memory, MemoryConfig, with_scratch};
pub use queue::{IntQueue, PtrQueue};
pub use task::{Scheduler, TaskRef, TaskStatus, Work};

/// The assembled runtime core.
///
/// Subsystems come up in dependency order (memory, arena, scheduler,
/// world) and shut down in reverse when the engine is dropped. Call
/// [`update`](Self::update) once per frame.
pub struct Engine {
    world: World,
    arena: ArenaRing,
    scheduler: Arc<Scheduler>,
    memory: Arc<Memory>,
}

// === impl Engine ===

impl Engine {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let memory = Arc::new(Memory::new(&config.memory));
        let arena = ArenaRing::new();
        let scheduler = Arc::new(if config.worker_threads == 0 {
            Scheduler::new()
        } else {
            Scheduler::with_thread_count(config.worker_threads)
        });
        let world = World::new(memory.clone(), scheduler.clone());
        tracing::debug!("engine core up");

        Self {
            world,
            arena,
            scheduler,
            memory,
        }
    }

    #[inline]
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    #[inline]
    pub fn arena(&self) -> &ArenaRing {
        &self.arena
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Frame boundary: wake the workers for freshly submitted tasks, then
    /// advance the temp ring.
    ///
    /// Anything still holding `Temp` memory from `temp_frames` updates ago
    /// is now invalid; callers sequence this after the frame's task waves
    /// have been awaited.
    pub fn update(&self) {
        self.scheduler.update();
        self.memory.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_update_teardown() {
        let engine = Engine::new(&Config {
            worker_threads: 2,
            ..Config::default()
        });
        for _ in 0..3 {
            engine.update();
        }
        assert_eq!(engine.world().entity_count(), 0);
    }
}
