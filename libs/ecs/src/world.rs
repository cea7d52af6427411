// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use std::sync::Arc;

use handle::{GenId, IdSet};
use mem::{AllocKind, Allocation, Memory};
use sync::{Mutex, RwLock};
use task::{Scheduler, TaskRef};

use crate::component::{COMPONENT_COUNT, Component, ComponentFlags, ComponentId};

/// Entities per slab. Fixed so relocation cost is bounded and row pointers
/// are stable while a slab lock is held.
pub const SLAB_CAPACITY: i32 = 1024;

/// A generational entity id.
///
/// Stable across slab relocations; stale ids fail the registry's version
/// check instead of dangling.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Entity {
    pub index: i32,
    pub version: i32,
}

impl Entity {
    pub const INVALID: Self = Self {
        index: 0,
        version: 0,
    };

    #[inline]
    fn id(self) -> GenId {
        GenId {
            index: self.index,
            version: self.version,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.version)
    }
}

#[inline]
fn pack_id(id: GenId) -> u64 {
    (u64::from(id.index as u32) << 32) | u64::from(id.version as u32)
}

#[inline]
fn unpack_id(bits: u64) -> GenId {
    GenId {
        index: (bits >> 32) as u32 as i32,
        version: bits as u32 as i32,
    }
}

/// One fixed-capacity bucket of entities sharing a component signature.
///
/// `flags` and `rows` change only under the registry write lock; `len` and
/// row contents change under the per-slab mutex while the registry is read
/// locked.
struct Slab {
    lock: Mutex<()>,
    len: AtomicI32,
    flags: ComponentFlags,
    rows: [Option<Allocation>; COMPONENT_COUNT],
}

impl Slab {
    fn empty() -> Self {
        Self {
            lock: Mutex::new(()),
            len: AtomicI32::new(0),
            flags: ComponentFlags::empty(),
            rows: core::array::from_fn(|_| None),
        }
    }

    #[inline]
    fn row_ptr(&self, id: ComponentId) -> Option<NonNull<u8>> {
        self.rows[id as usize]
            .as_ref()
            .map(Allocation::as_non_null)
    }

    /// Zeroes every present row at `slot`. Caller holds the slab lock.
    fn clear_slot(&self, slot: i32) {
        debug_assert!((0..SLAB_CAPACITY).contains(&slot));
        for id in ComponentId::ALL {
            if let Some(row) = self.row_ptr(id) {
                let stride = id.stride();
                // Safety: slot < capacity, so the range is inside the row
                unsafe {
                    row.add(stride * slot as usize).write_bytes(0, stride);
                }
            }
        }
    }

    /// Copies every present row's value from `src` into `dst`. Caller holds
    /// the slab lock.
    fn copy_slot(&self, dst: i32, src: i32) {
        if dst == src {
            return;
        }
        debug_assert!((0..SLAB_CAPACITY).contains(&dst));
        debug_assert!((0..SLAB_CAPACITY).contains(&src));
        for id in ComponentId::ALL {
            if let Some(row) = self.row_ptr(id) {
                let stride = id.stride();
                // Safety: both slots are in bounds and dst != src, so the
                // ranges are disjoint
                unsafe {
                    let src_ptr = row.add(stride * src as usize);
                    let dst_ptr = row.add(stride * dst as usize);
                    core::ptr::copy_nonoverlapping(src_ptr.as_ptr(), dst_ptr.as_ptr(), stride);
                }
            }
        }
    }

    /// Caller holds the slab lock.
    fn write_entity(&self, slot: i32, entity: Entity) {
        let row = self.row_ptr(ComponentId::Entity).expect("entity row");
        // Safety: slot is in bounds; the entity row stores `Entity` values
        unsafe {
            row.cast::<Entity>().add(slot as usize).write(entity);
        }
    }

    /// Caller holds the slab lock.
    fn read_entity(&self, slot: i32) -> Entity {
        let row = self.row_ptr(ComponentId::Entity).expect("entity row");
        // Safety: slot is in bounds; the entity row stores `Entity` values
        unsafe { row.cast::<Entity>().add(slot as usize).read() }
    }
}

struct Slabs {
    ids: IdSet,
    slabs: Vec<Slab>,
}

struct Entities {
    ids: IdSet,
    // (slab GenId, slot) per entity index; written through atomics because
    // publication happens under the registry *read* lock — each index is
    // only ever touched by the thread that owns the entity at that moment
    slabs: Vec<AtomicU64>,
    offsets: Vec<AtomicI32>,
}

struct WorldInner {
    memory: Arc<Memory>,
    scheduler: Arc<Scheduler>,
    slabs: RwLock<Slabs>,
    ents: RwLock<Entities>,
}

/// The entity store: slabs keyed by component signature, entities addressed
/// by generational id.
///
/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

// === impl World ===

impl World {
    #[must_use]
    pub fn new(memory: Arc<Memory>, scheduler: Arc<Scheduler>) -> Self {
        tracing::debug!("entity store up");
        Self {
            inner: Arc::new(WorldInner {
                memory,
                scheduler,
                slabs: RwLock::new(Slabs {
                    ids: IdSet::new(),
                    slabs: Vec::new(),
                }),
                ents: RwLock::new(Entities {
                    ids: IdSet::new(),
                    slabs: Vec::new(),
                    offsets: Vec::new(),
                }),
            }),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// Creates an entity carrying `flags` (the entity-owner bit is implied)
    /// and places it in a matching slab.
    pub fn create(&self, flags: ComponentFlags) -> Entity {
        let flags = flags | ComponentFlags::ENTITY;

        let entity = {
            let mut ents = self.inner.ents.write();
            let id = ents.ids.alloc();
            let index = id.index as usize;
            if index >= ents.slabs.len() {
                debug_assert_eq!(index, ents.slabs.len());
                ents.slabs.push(AtomicU64::new(0));
                ents.offsets.push(AtomicI32::new(0));
            }
            Entity {
                index: id.index,
                version: id.version,
            }
        };

        let (slab_id, slot) = loop {
            if let Some(found) = self.try_place(entity, flags) {
                break found;
            }
            self.create_slab(flags);
        };

        // publication under the read lock: only this entity's cells move
        let ents = self.inner.ents.read();
        ents.slabs[entity.index as usize].store(pack_id(slab_id), Ordering::Release);
        ents.offsets[entity.index as usize].store(slot, Ordering::Release);
        entity
    }

    /// Scans slabs newest-first for a matching signature with space,
    /// claiming a slot under the slab lock.
    fn try_place(&self, entity: Entity, flags: ComponentFlags) -> Option<(GenId, i32)> {
        let slabs = self.inner.slabs.read();
        for index in (0..slabs.slabs.len()).rev() {
            let slab = &slabs.slabs[index];
            if slab.len.load(Ordering::Relaxed) >= SLAB_CAPACITY || slab.flags != flags {
                continue;
            }

            let guard = slab.lock.lock();
            let len = slab.len.load(Ordering::Relaxed);
            if len < SLAB_CAPACITY {
                slab.len.store(len + 1, Ordering::Relaxed);
                slab.clear_slot(len);
                slab.write_entity(len, entity);
                drop(guard);

                let slab_id = slabs
                    .ids
                    .live_at(i32::try_from(index).expect("slab index"))
                    .expect("matched a dead slab");
                return Some((slab_id, len));
            }
            drop(guard);
        }
        None
    }

    fn create_slab(&self, flags: ComponentFlags) -> GenId {
        let mut slabs = self.inner.slabs.write();
        let id = slabs.ids.alloc();
        let index = id.index as usize;
        if index >= slabs.slabs.len() {
            debug_assert_eq!(index, slabs.slabs.len());
            slabs.slabs.push(Slab::empty());
        }

        let slab = &mut slabs.slabs[index];
        slab.flags = flags;
        slab.len.store(0, Ordering::Relaxed);
        for comp in ComponentId::ALL {
            slab.rows[comp as usize] = if flags.has(comp) {
                let bytes = comp.stride() * SLAB_CAPACITY as usize;
                Some(
                    self.inner
                        .memory
                        .calloc(AllocKind::Perm, bytes)
                        .expect("permanent pool exhausted allocating slab rows"),
                )
            } else {
                None
            };
        }
        tracing::trace!(?id, ?flags, "slab up");
        id
    }

    fn destroy_slab(&self, id: GenId) {
        let mut slabs = self.inner.slabs.write();
        if slabs.ids.release(id) {
            let slab = &mut slabs.slabs[id.index as usize];
            slab.flags = ComponentFlags::empty();
            slab.len.store(0, Ordering::Relaxed);
            let rows = core::mem::replace(&mut slab.rows, core::array::from_fn(|_| None));
            for row in rows.into_iter().flatten() {
                self.inner.memory.free(row);
            }
            tracing::trace!(?id, "slab down");
        }
    }

    /// Destroys `entity`, relocating the slab's back entry into its slot.
    ///
    /// Returns `false` for stale ids. An emptied slab is destroyed eagerly.
    pub fn destroy(&self, entity: Entity) -> bool {
        let mut ents = self.inner.ents.write();
        if !ents.ids.release(entity.id()) {
            return false;
        }
        let index = entity.index as usize;
        let slab_id = unpack_id(ents.slabs[index].load(Ordering::Relaxed));
        ents.slabs[index].store(0, Ordering::Relaxed);
        let offset = ents.offsets[index].load(Ordering::Relaxed);

        let back;
        {
            let slabs = self.inner.slabs.read();
            debug_assert!(slabs.ids.current(slab_id));
            let slab = &slabs.slabs[slab_id.index as usize];

            let _guard = slab.lock.lock();
            back = slab.len.load(Ordering::Relaxed) - 1;
            assert!(back >= 0, "slab length underflow");
            slab.len.store(back, Ordering::Relaxed);

            debug_assert_eq!(slab.read_entity(offset), entity);
            let back_entity = slab.read_entity(back);
            slab.copy_slot(offset, back);
            ents.offsets[back_entity.index as usize].store(offset, Ordering::Relaxed);
            slab.clear_slot(back);
        }

        if back == 0 {
            self.destroy_slab(slab_id);
        }
        true
    }

    /// Whether `entity` is the live generation of its index.
    pub fn is_current(&self, entity: Entity) -> bool {
        self.inner.ents.read().ids.current(entity.id())
    }

    /// Component signature of `entity`, or empty for stale ids.
    pub fn flags_of(&self, entity: Entity) -> ComponentFlags {
        let ents = self.inner.ents.read();
        if !ents.ids.current(entity.id()) {
            return ComponentFlags::empty();
        }
        let slab_id = unpack_id(ents.slabs[entity.index as usize].load(Ordering::Acquire));

        let slabs = self.inner.slabs.read();
        if slabs.ids.current(slab_id) {
            slabs.slabs[slab_id.index as usize].flags
        } else {
            ComponentFlags::empty()
        }
    }

    pub fn has(&self, entity: Entity, id: ComponentId) -> bool {
        self.flags_of(entity).has(id)
    }

    pub fn has_all(&self, entity: Entity, all: ComponentFlags) -> bool {
        self.flags_of(entity).has_all(all)
    }

    pub fn has_any(&self, entity: Entity, any: ComponentFlags) -> bool {
        self.flags_of(entity).has_any(any)
    }

    pub fn has_none(&self, entity: Entity, none: ComponentFlags) -> bool {
        self.flags_of(entity).has_none(none)
    }

    /// Number of entity index slots ever allocated.
    pub fn entity_count(&self) -> i32 {
        self.inner.ents.read().ids.len()
    }

    /// Number of slab index slots ever allocated.
    pub fn slab_count(&self) -> i32 {
        self.inner.slabs.read().ids.len()
    }

    /// Submits a task visiting every slab whose signature has all of `all`
    /// and none of `none`, calling `f` once per matching non-empty slab
    /// under that slab's lock.
    ///
    /// Returns the submitted task (await it through the scheduler), or
    /// `None` when there are no slabs at all. Workers are not woken — call
    /// [`Scheduler::schedule`] (the engine frame update does).
    pub fn foreach<F>(&self, all: ComponentFlags, none: ComponentFlags, f: F) -> Option<TaskRef>
    where
        F: Fn(&SlabView<'_>) + Send + Sync + 'static,
    {
        let worksize = self.slab_count();
        if worksize <= 0 {
            return None;
        }

        // a weak capture keeps pending foreach tasks in worker inboxes from
        // pinning the world (and through it the scheduler) alive
        let world = Arc::downgrade(&self.inner);
        let task = TaskRef::from_fn(move |begin, end| {
            let Some(inner) = world.upgrade() else {
                return;
            };
            let slabs = inner.slabs.read();
            debug_assert!(end as usize <= slabs.slabs.len());
            for index in begin..end {
                let slab = &slabs.slabs[index as usize];
                let has = slab.flags;
                if !(has.has_all(all) && has.has_none(none)) {
                    continue;
                }
                let _guard = slab.lock.lock();
                let len = slab.len.load(Ordering::Relaxed);
                if len > 0 {
                    f(&SlabView { slab, len });
                }
            }
        });

        self.inner.scheduler.submit(&task, worksize);
        Some(task)
    }

    /// [`foreach`](Self::foreach), then wake the workers and block until
    /// the sweep is complete.
    pub fn run_foreach<F>(&self, all: ComponentFlags, none: ComponentFlags, f: F)
    where
        F: Fn(&SlabView<'_>) + Send + Sync + 'static,
    {
        if let Some(task) = self.foreach(all, none, f) {
            self.inner.scheduler.schedule();
            self.inner.scheduler.await_task(&task);
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entity_count())
            .field("slabs", &self.slab_count())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one matching slab handed to a [`World::foreach`] consumer.
///
/// The slab's lock is held for the duration of the callback: `len` is
/// stable and the row pointers valid.
pub struct SlabView<'a> {
    slab: &'a Slab,
    len: i32,
}

// === impl SlabView ===

impl SlabView<'_> {
    /// Live entities in this slab.
    #[inline]
    pub fn len(&self) -> i32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn flags(&self) -> ComponentFlags {
        self.slab.flags
    }

    /// The owner column: which entity occupies each slot.
    pub fn entities(&self) -> &[Entity] {
        let row = self.slab.row_ptr(ComponentId::Entity).expect("entity row");
        // Safety: the entity row always exists with `len` initialized slots,
        // and nothing mutates it while the slab lock is held by this view
        unsafe { core::slice::from_raw_parts(row.cast::<Entity>().as_ptr(), self.len as usize) }
    }

    /// Shared view of a component column, or `None` if this slab's
    /// signature lacks it.
    ///
    /// Must not be combined with [`column_mut`](Self::column_mut) of the
    /// same component within one callback.
    pub fn column<T: Component>(&self) -> Option<&[T]> {
        let row = self.slab.row_ptr(T::ID)?;
        debug_assert_eq!(size_of::<T>(), T::ID.stride());
        // Safety: the row holds `len` initialized values of T; the slab lock
        // serializes against writers
        Some(unsafe { core::slice::from_raw_parts(row.cast::<T>().as_ptr(), self.len as usize) })
    }

    /// Exclusive view of a component column.
    ///
    /// # Safety
    ///
    /// The caller must not hold any other view of the same component column
    /// (from [`column`](Self::column) or a previous `column_mut`) while the
    /// returned slice lives.
    pub unsafe fn column_mut<T: Component>(&self) -> Option<&mut [T]> {
        let row = self.slab.row_ptr(T::ID)?;
        debug_assert_eq!(size_of::<T>(), T::ID.stride());
        // Safety: as in `column`; exclusivity over this column is the
        // caller's obligation
        Some(unsafe {
            core::slice::from_raw_parts_mut(row.cast::<T>().as_ptr(), self.len as usize)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Position;
    use std::sync::atomic::AtomicI64;

    fn world() -> World {
        let memory = Arc::new(Memory::new(&mem::MemoryConfig {
            perm_capacity: 32 << 20,
            temp_capacity: 1 << 20,
            temp_frames: 2,
            thread_capacity: 1 << 20,
        }));
        let scheduler = Arc::new(Scheduler::with_thread_count(4));
        World::new(memory, scheduler)
    }

    const POS_ROT: ComponentFlags = ComponentFlags::POSITION.union(ComponentFlags::ROTATION);

    #[test]
    fn create_sets_owner_bit() {
        let world = world();
        let entity = world.create(ComponentFlags::POSITION);
        assert!(world.is_current(entity));
        assert!(world.has(entity, ComponentId::Entity));
        assert!(world.has(entity, ComponentId::Position));
        assert!(!world.has(entity, ComponentId::Rotation));
    }

    #[test]
    fn destroy_invalidates() {
        let world = world();
        let entity = world.create(POS_ROT);
        assert!(world.destroy(entity));
        assert!(!world.is_current(entity));
        assert!(!world.destroy(entity), "stale destroy must fail");
        assert_eq!(world.flags_of(entity), ComponentFlags::empty());
    }

    #[test]
    fn same_signature_shares_a_slab() {
        let world = world();
        let a = world.create(POS_ROT);
        let b = world.create(POS_ROT);
        let c = world.create(ComponentFlags::SCALE);
        assert_eq!(world.slab_count(), 2);

        world.destroy(a);
        world.destroy(b);
        world.destroy(c);
    }

    #[test]
    fn swap_with_back_preserves_rows() {
        let world = world();
        let entities: Vec<_> = (0..4).map(|_| world.create(POS_ROT)).collect();

        // stamp each entity's position with its creation order
        world.run_foreach(POS_ROT, ComponentFlags::empty(), |view| {
            let owners: Vec<Entity> = view.entities().to_vec();
            // Safety: the only view of the position column in this callback
            let positions = unsafe { view.column_mut::<Position>() }.unwrap();
            for (slot, owner) in owners.iter().enumerate() {
                positions[slot] = Position([owner.index as f32, 0.0, 0.0, 0.0]);
            }
        });

        // destroying the first entity moves the back entry into slot 0
        world.destroy(entities[0]);

        let sum = Arc::new(AtomicI64::new(0));
        let count = Arc::new(AtomicI64::new(0));
        {
            let sum = sum.clone();
            let count = count.clone();
            world.run_foreach(POS_ROT, ComponentFlags::empty(), move |view| {
                let owners = view.entities();
                let positions = view.column::<Position>().unwrap();
                for slot in 0..view.len() as usize {
                    // every surviving entity still sees its own marker
                    assert_eq!(positions[slot].0[0], owners[slot].index as f32);
                    sum.fetch_add(i64::from(owners[slot].index), Ordering::Relaxed);
                    count.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
        let expected: i64 = entities[1..].iter().map(|e| i64::from(e.index)).sum();
        assert_eq!(sum.load(Ordering::Relaxed), expected);
    }

    #[test]
    fn emptied_slab_is_destroyed() {
        let world = world();
        let entity = world.create(ComponentFlags::BOUNDS);
        let before = world.slab_count();
        world.destroy(entity);

        // the slab id slot is recycled by the next creation
        let again = world.create(ComponentFlags::BOUNDS);
        assert_eq!(world.slab_count(), before);
        world.destroy(again);
    }

    #[test]
    fn foreach_filters_by_signature() {
        let world = world();
        for _ in 0..10 {
            world.create(POS_ROT);
        }
        for _ in 0..5 {
            world.create(ComponentFlags::POSITION | ComponentFlags::DRAWABLE);
        }

        let matched = Arc::new(AtomicI64::new(0));
        {
            let matched = matched.clone();
            world.run_foreach(
                ComponentFlags::POSITION,
                ComponentFlags::DRAWABLE,
                move |view| {
                    assert!(view.flags().has_all(ComponentFlags::POSITION));
                    assert!(view.flags().has_none(ComponentFlags::DRAWABLE));
                    matched.fetch_add(i64::from(view.len()), Ordering::Relaxed);
                },
            );
        }
        assert_eq!(matched.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn spills_into_second_slab_past_capacity() {
        let world = world();
        let count = SLAB_CAPACITY + 100;
        let entities: Vec<_> = (0..count)
            .map(|_| world.create(ComponentFlags::SCALE))
            .collect();
        assert_eq!(world.slab_count(), 2);

        let seen = Arc::new(AtomicI64::new(0));
        {
            let seen = seen.clone();
            world.run_foreach(ComponentFlags::SCALE, ComponentFlags::empty(), move |view| {
                seen.fetch_add(i64::from(view.len()), Ordering::Relaxed);
            });
        }
        assert_eq!(seen.load(Ordering::Relaxed), i64::from(count));

        for entity in entities {
            assert!(world.destroy(entity));
        }
    }
}
