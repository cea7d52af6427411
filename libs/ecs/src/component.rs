// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::world::Entity;

/// Number of component kinds, including the engine-owned entity column.
pub const COMPONENT_COUNT: usize = 7;

/// The fixed set of component kinds a slab row can hold.
///
/// `Entity` is the owner column: present in every slab, stamped by the
/// store itself, and not addressable through the [`Component`] trait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ComponentId {
    Entity = 0,
    Position = 1,
    Rotation = 2,
    Scale = 3,
    LocalToWorld = 4,
    Drawable = 5,
    Bounds = 6,
}

impl ComponentId {
    pub const ALL: [Self; COMPONENT_COUNT] = [
        Self::Entity,
        Self::Position,
        Self::Rotation,
        Self::Scale,
        Self::LocalToWorld,
        Self::Drawable,
        Self::Bounds,
    ];

    /// Row stride in bytes for this component kind.
    #[inline]
    pub const fn stride(self) -> usize {
        match self {
            Self::Entity => size_of::<Entity>(),
            Self::Position => size_of::<Position>(),
            Self::Rotation => size_of::<Rotation>(),
            Self::Scale => size_of::<Scale>(),
            Self::LocalToWorld => size_of::<LocalToWorld>(),
            Self::Drawable => size_of::<Drawable>(),
            Self::Bounds => size_of::<Bounds>(),
        }
    }

    /// The single-bit flag set for this kind.
    #[inline]
    pub const fn flag(self) -> ComponentFlags {
        ComponentFlags::from_bits_retain(1 << self as u32)
    }
}

bitflags::bitflags! {
    /// Bitset over component kinds: one bit per kind, the entity-owner bit
    /// always set on live slabs.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ComponentFlags: u32 {
        const ENTITY = 1 << ComponentId::Entity as u32;
        const POSITION = 1 << ComponentId::Position as u32;
        const ROTATION = 1 << ComponentId::Rotation as u32;
        const SCALE = 1 << ComponentId::Scale as u32;
        const LOCAL_TO_WORLD = 1 << ComponentId::LocalToWorld as u32;
        const DRAWABLE = 1 << ComponentId::Drawable as u32;
        const BOUNDS = 1 << ComponentId::Bounds as u32;
    }
}

impl ComponentFlags {
    /// `self` carries every kind in `all`.
    #[inline]
    pub fn has_all(self, all: Self) -> bool {
        self.contains(all)
    }

    /// `self` carries at least one kind in `any`.
    #[inline]
    pub fn has_any(self, any: Self) -> bool {
        self.intersects(any)
    }

    /// `self` carries no kind in `none`.
    #[inline]
    pub fn has_none(self, none: Self) -> bool {
        !self.intersects(none)
    }

    #[inline]
    pub fn has(self, id: ComponentId) -> bool {
        self.contains(id.flag())
    }
}

/// Marker tying a plain-data Rust type to its component kind.
///
/// # Safety
///
/// Implementors must be plain bytes (no padding-sensitive invariants, no
/// drop glue, any bit pattern valid) and `size_of::<Self>()` must equal
/// `Self::ID.stride()`. Rows are stored as raw columns and copied with
/// `memcpy` semantics.
pub unsafe trait Component: Copy + Send + Sync + 'static {
    const ID: ComponentId;
}

pub type Float4 = [f32; 4];

/// World-space position (xyz, w unused).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Position(pub Float4);

/// Orientation quaternion.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Rotation(pub Float4);

/// Per-axis scale (xyz, w unused).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Scale(pub Float4);

/// Cached object-to-world transform, column-major.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LocalToWorld(pub [Float4; 4]);

/// Renderable reference: mesh and material slots in the asset tables.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Drawable {
    pub mesh: u32,
    pub material: u32,
}

/// World-space AABB.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bounds {
    pub center: Float4,
    pub extents: Float4,
}

// Safety: plain #[repr(C)] float/int data matching the stride table
unsafe impl Component for Position {
    const ID: ComponentId = ComponentId::Position;
}
// Safety: as above
unsafe impl Component for Rotation {
    const ID: ComponentId = ComponentId::Rotation;
}
// Safety: as above
unsafe impl Component for Scale {
    const ID: ComponentId = ComponentId::Scale;
}
// Safety: as above
unsafe impl Component for LocalToWorld {
    const ID: ComponentId = ComponentId::LocalToWorld;
}
// Safety: as above
unsafe impl Component for Drawable {
    const ID: ComponentId = ComponentId::Drawable;
}
// Safety: as above
unsafe impl Component for Bounds {
    const ID: ComponentId = ComponentId::Bounds;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_one_bit() {
        for id in ComponentId::ALL {
            assert_eq!(id.flag().bits().count_ones(), 1);
        }
    }

    #[test]
    fn flag_queries() {
        let flags = ComponentFlags::ENTITY | ComponentFlags::POSITION | ComponentFlags::SCALE;
        assert!(flags.has_all(ComponentFlags::POSITION | ComponentFlags::SCALE));
        assert!(!flags.has_all(ComponentFlags::POSITION | ComponentFlags::BOUNDS));
        assert!(flags.has_any(ComponentFlags::BOUNDS | ComponentFlags::SCALE));
        assert!(flags.has_none(ComponentFlags::DRAWABLE | ComponentFlags::BOUNDS));
        assert!(flags.has(ComponentId::Position));
        assert!(!flags.has(ComponentId::Rotation));
    }

    #[test]
    fn strides_match_types() {
        assert_eq!(ComponentId::Position.stride(), 16);
        assert_eq!(ComponentId::LocalToWorld.stride(), 64);
        assert_eq!(ComponentId::Entity.stride(), 8);
        assert_eq!(ComponentId::Drawable.stride(), 8);
    }
}
