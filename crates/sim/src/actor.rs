use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::geometry::{Aabb, Vec2};
use crate::spatial::ProxyId;

/// Lifecycle and collision behavior bits carried by every actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActorFlags(pub u32);

impl ActorFlags {
    pub const NONE: ActorFlags = ActorFlags(0);

    /// Marked for removal; swept out at the start of the next resolve pass.
    pub const DESTROYED: ActorFlags = ActorFlags(1 << 0);
    /// Position or bounds changed since the broad phase last saw this actor.
    pub const DIRTY: ActorFlags = ActorFlags(1 << 1);

    pub const CREATED_FROM_EVENT_MAP: ActorFlags = ActorFlags(1 << 2);
    pub const FROM_GENERATOR: ActorFlags = ActorFlags(1 << 3);
    /// Survives a death rollback even if spawned after the checkpoint.
    pub const PRESERVE_ON_ROLLBACK: ActorFlags = ActorFlags(1 << 4);
    /// Spawn may be deferred to asynchronous asset loading.
    pub const ASYNC: ActorFlags = ActorFlags(1 << 5);
    pub const ILLUMINATED: ActorFlags = ActorFlags(1 << 6);

    pub const COLLIDE_WITH_TILESET: ActorFlags = ActorFlags(1 << 8);
    /// Tall actors probe the tile map with a reduced pair of slabs instead of
    /// the full box.
    pub const COLLIDE_WITH_TILESET_REDUCED: ActorFlags = ActorFlags(1 << 9);
    pub const COLLIDE_WITH_SOLID_OBJECTS: ActorFlags = ActorFlags(1 << 10);
    /// Only solids whose midline is below our feet block movement.
    pub const COLLIDE_WITH_SOLID_OBJECTS_BELOW: ActorFlags = ActorFlags(1 << 11);
    pub const COLLIDE_WITH_OTHER_ACTORS: ActorFlags = ActorFlags(1 << 12);
    pub const IS_SOLID_OBJECT: ActorFlags = ActorFlags(1 << 13);
    pub const IS_ONE_WAY: ActorFlags = ActorFlags(1 << 14);
    /// Two solids that both carry this bit pass through each other.
    pub const EXCLUDE_SIMILAR: ActorFlags = ActorFlags(1 << 15);
    pub const FORCE_DISABLE_COLLISIONS: ActorFlags = ActorFlags(1 << 16);

    /// True when every bit of `other` is set.
    pub fn contains(self, other: ActorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set.
    pub fn intersects(self, other: ActorFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ActorFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ActorFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for ActorFlags {
    type Output = ActorFlags;

    fn bitor(self, rhs: ActorFlags) -> ActorFlags {
        ActorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ActorFlags {
    fn bitor_assign(&mut self, rhs: ActorFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ActorFlags {
    type Output = ActorFlags;

    fn bitand(self, rhs: ActorFlags) -> ActorFlags {
        ActorFlags(self.0 & rhs.0)
    }
}

/// A simulated entity. Hitboxes are stored in local space and projected to
/// world space by `update_aabb`; everything that moves an actor or resizes a
/// hitbox must set `DIRTY` so the broad phase catches up next frame.
#[derive(Debug, Clone)]
pub struct Actor {
    pub state: ActorFlags,
    pub pos: Vec2,
    pub speed: Vec2,
    pub health: i32,
    /// Outer hitbox in local space, relative to `pos`.
    pub hitbox: Aabb,
    /// Tighter inner hitbox used for solid-object stacking checks.
    pub inner_hitbox: Aabb,
    /// World-space outer hitbox, derived.
    pub aabb: Aabb,
    /// World-space inner hitbox, derived.
    pub aabb_inner: Aabb,
    /// Grid cell this actor was spawned from, if event-born.
    pub origin_tile: (i32, i32),
    /// Frame counter value at spawn time; drives rollback purging.
    pub spawn_frames: f32,
    pub proxy: Option<ProxyId>,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            state: ActorFlags::NONE,
            pos: Vec2::ZERO,
            speed: Vec2::ZERO,
            health: 1,
            hitbox: Aabb::default(),
            inner_hitbox: Aabb::default(),
            aabb: Aabb::default(),
            aabb_inner: Aabb::default(),
            origin_tile: (-1, -1),
            spawn_frames: 0.0,
            proxy: None,
        }
    }
}

impl Actor {
    pub fn update_aabb(&mut self) {
        self.aabb = self.hitbox.translated(self.pos);
        self.aabb_inner = self.inner_hitbox.translated(self.pos);
    }

    pub fn has_state(&self, flags: ActorFlags) -> bool {
        self.state.contains(flags)
    }

    pub fn set_state(&mut self, flags: ActorFlags, on: bool) {
        if on {
            self.state.insert(flags);
        } else {
            self.state.remove(flags);
        }
    }

    pub fn move_to(&mut self, pos: Vec2) {
        self.pos = pos;
        self.update_aabb();
        self.state.insert(ActorFlags::DIRTY);
    }

    pub fn is_colliding_with(&self, other: &Actor) -> bool {
        self.aabb.overlaps(&other.aabb)
    }

    pub fn is_colliding_with_aabb(&self, aabb: &Aabb) -> bool {
        self.aabb.overlaps(aabb)
    }
}

/// Stable handle to an arena slot. Holding an id never keeps the actor
/// alive; a reused slot bumps the generation so stale ids resolve to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    actor: Option<Actor>,
}

/// Generational storage for live actors.
#[derive(Debug, Default)]
pub struct ActorArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ActorArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, actor: Actor) -> ActorId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.actor.is_none());
            slot.actor = Some(actor);
            return ActorId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            actor: Some(actor),
        });
        ActorId {
            index,
            generation: 0,
        }
    }

    pub fn remove(&mut self, id: ActorId) -> Option<Actor> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let actor = slot.actor.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(actor)
    }

    pub fn get(&self, id: ActorId) -> Option<&Actor> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.actor.as_ref()
    }

    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut Actor> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.actor.as_mut()
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActorId, &Actor)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let actor = slot.actor.as_ref()?;
            let id = ActorId {
                index: index as u32,
                generation: slot.generation,
            };
            Some((id, actor))
        })
    }

    /// Snapshot of live ids, for loops that mutate or remove while iterating.
    pub fn ids(&self) -> Vec<ActorId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_id_resolves_to_none_after_slot_reuse() {
        let mut arena = ActorArena::new();
        let first = arena.insert(Actor::default());
        assert!(arena.remove(first).is_some());
        let second = arena.insert(Actor::default());
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut arena = ActorArena::new();
        let id = arena.insert(Actor::default());
        assert!(arena.remove(id).is_some());
        assert!(arena.remove(id).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn update_aabb_projects_both_hitboxes() {
        let mut actor = Actor {
            pos: Vec2::new(100.0, 50.0),
            hitbox: Aabb::new(-8.0, -12.0, 8.0, 12.0),
            inner_hitbox: Aabb::new(-4.0, -6.0, 4.0, 6.0),
            ..Actor::default()
        };
        actor.update_aabb();
        assert_eq!(actor.aabb, Aabb::new(92.0, 38.0, 108.0, 62.0));
        assert_eq!(actor.aabb_inner, Aabb::new(96.0, 44.0, 104.0, 56.0));
    }

    #[test]
    fn flag_queries_distinguish_all_and_any() {
        let flags = ActorFlags::IS_SOLID_OBJECT | ActorFlags::COLLIDE_WITH_TILESET;
        assert!(flags.contains(ActorFlags::IS_SOLID_OBJECT));
        assert!(!flags.contains(ActorFlags::IS_SOLID_OBJECT | ActorFlags::DESTROYED));
        assert!(flags.intersects(ActorFlags::IS_SOLID_OBJECT | ActorFlags::DESTROYED));
    }
}
