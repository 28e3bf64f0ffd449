use tracing::warn;

use crate::actor::{ActorArena, ActorFlags, ActorId};
use crate::geometry::{Aabb, Vec2};
use crate::spatial::SpatialIndex;

/// Parameters for a tile-map probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileCollisionParams {
    /// The probing actor is moving downward; one-way platforms and top-slab
    /// checks behave differently in that case.
    pub downwards: bool,
}

/// Host-side hooks the resolver dispatches into.
pub trait CollisionHost {
    /// Reacts to `first` touching `second`. Returns whether the contact was
    /// handled; unhandled contacts are retried with the roles swapped.
    fn try_handle_collision(
        &mut self,
        arena: &mut ActorArena,
        first: ActorId,
        second: ActorId,
    ) -> bool;

    /// Whether the tile map is free of solid geometry inside `aabb`.
    fn is_tile_empty(&mut self, aabb: Aabb, params: TileCollisionParams) -> bool;

    /// Called right before a destroyed actor is dropped from the arena.
    fn before_actor_destroyed(&mut self, _arena: &mut ActorArena, _id: ActorId) {}
}

/// Outcome of a position probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionProbe {
    Empty,
    /// Blocked by tile-map geometry.
    Tile,
    /// Blocked by a solid actor that neither side's handler resolved.
    Collider(ActorId),
}

impl PositionProbe {
    pub fn is_empty(&self) -> bool {
        matches!(self, PositionProbe::Empty)
    }
}

/// Tall actors probe the tile map with two thin slabs instead of the whole
/// box, so stairs and shallow slopes do not snag the torso.
const REDUCED_PROBE_MIN_HEIGHT: f32 = 20.0;

/// One broad-phase maintenance and contact-dispatch pass.
///
/// Destroyed actors are evicted first (proxy before arena slot), dirty actors
/// get their bounds recomputed and their proxies re-rooted, then every newly
/// formed pair where at least one side opted into actor collisions is
/// dispatched to the host.
pub fn resolve_collisions<H: CollisionHost>(
    arena: &mut ActorArena,
    index: &mut SpatialIndex,
    host: &mut H,
    time_mult: f32,
) {
    for id in arena.ids() {
        let Some(actor) = arena.get(id) else {
            continue;
        };
        if actor.state.contains(ActorFlags::DESTROYED) {
            host.before_actor_destroyed(arena, id);
            if let Some(actor) = arena.remove(id) {
                if let Some(proxy) = actor.proxy {
                    index.remove(proxy);
                }
            }
            continue;
        }
        if !actor.state.contains(ActorFlags::DIRTY) {
            continue;
        }
        let Some(actor) = arena.get_mut(id) else {
            continue;
        };
        let Some(proxy) = actor.proxy else {
            warn!(?id, "dirty_actor_without_proxy");
            continue;
        };
        actor.update_aabb();
        let aabb = actor.aabb;
        let displacement = actor.speed.scaled(time_mult);
        actor.state.remove(ActorFlags::DIRTY);
        index.move_proxy(proxy, aabb, displacement);
    }

    index.update_pairs(|a, b| {
        let (Some(first), Some(second)) = (arena.get(a), arena.get(b)) else {
            return;
        };
        let joint = first.state | second.state;
        if (joint & (ActorFlags::COLLIDE_WITH_OTHER_ACTORS | ActorFlags::DESTROYED))
            != ActorFlags::COLLIDE_WITH_OTHER_ACTORS
        {
            return;
        }
        if !first.is_colliding_with(second) {
            return;
        }
        if !host.try_handle_collision(arena, a, b) {
            host.try_handle_collision(arena, b, a);
        }
    });
}

/// Collects actors overlapping `aabb` that participate in actor collisions,
/// calling `callback` for each; the callback returns `false` to stop.
pub fn find_collision_actors_by_aabb(
    arena: &ActorArena,
    index: &SpatialIndex,
    exclude: Option<ActorId>,
    aabb: Aabb,
    mut callback: impl FnMut(ActorId) -> bool,
) {
    index.query_box(aabb, |_, owner| {
        if exclude == Some(owner) {
            return true;
        }
        let Some(actor) = arena.get(owner) else {
            return true;
        };
        if (actor.state & (ActorFlags::COLLIDE_WITH_OTHER_ACTORS | ActorFlags::DESTROYED))
            != ActorFlags::COLLIDE_WITH_OTHER_ACTORS
        {
            return true;
        }
        if !actor.is_colliding_with_aabb(&aabb) {
            return true;
        }
        callback(owner)
    });
}

/// Radius variant of `find_collision_actors_by_aabb`; the distance test runs
/// against the actor's tight box.
pub fn find_collision_actors_by_radius(
    arena: &ActorArena,
    index: &SpatialIndex,
    exclude: Option<ActorId>,
    center: Vec2,
    radius: f32,
    mut callback: impl FnMut(ActorId) -> bool,
) {
    index.query_radius(center, radius, |_, owner| {
        if exclude == Some(owner) {
            return true;
        }
        let Some(actor) = arena.get(owner) else {
            return true;
        };
        if (actor.state & (ActorFlags::COLLIDE_WITH_OTHER_ACTORS | ActorFlags::DESTROYED))
            != ActorFlags::COLLIDE_WITH_OTHER_ACTORS
        {
            return true;
        }
        if !actor.aabb.intersects_circle(center, radius) {
            return true;
        }
        callback(owner)
    });
}

/// Whether `probe_id` could occupy `aabb`: first against the tile map, then
/// against solid objects, giving both sides' handlers a chance to resolve the
/// contact before it counts as blocking.
pub fn is_position_empty<H: CollisionHost>(
    arena: &mut ActorArena,
    index: &SpatialIndex,
    host: &mut H,
    probe_id: ActorId,
    aabb: Aabb,
    params: TileCollisionParams,
) -> PositionProbe {
    let Some(actor) = arena.get(probe_id) else {
        return PositionProbe::Empty;
    };
    let state = actor.state;
    let self_inner_bottom = actor.aabb_inner.b;

    if state.contains(ActorFlags::COLLIDE_WITH_TILESET) {
        if state.contains(ActorFlags::COLLIDE_WITH_TILESET_REDUCED)
            && aabb.height() >= REDUCED_PROBE_MIN_HEIGHT
        {
            let bottom = Aabb {
                t: aabb.b - (aabb.height() - 10.0).max(14.0),
                ..aabb
            };
            if !host.is_tile_empty(bottom, params) {
                return PositionProbe::Tile;
            }
            if !params.downwards {
                let top = Aabb {
                    b: aabb.t + 6.0,
                    ..aabb
                };
                if !host.is_tile_empty(top, params) {
                    return PositionProbe::Tile;
                }
            }
        } else if !host.is_tile_empty(aabb, params) {
            return PositionProbe::Tile;
        }
    }

    if !state.contains(ActorFlags::COLLIDE_WITH_SOLID_OBJECTS) {
        return PositionProbe::Empty;
    }

    // Candidates are collected first so the contact handlers below can take
    // the arena mutably.
    let mut candidates = Vec::new();
    index.query_box(aabb, |_, owner| {
        if owner != probe_id {
            candidates.push(owner);
        }
        true
    });

    for other_id in candidates {
        let Some(other) = arena.get(other_id) else {
            continue;
        };
        let solid = ActorFlags::IS_SOLID_OBJECT | ActorFlags::COLLIDE_WITH_OTHER_ACTORS;
        if (other.state & (solid | ActorFlags::DESTROYED)) != solid {
            continue;
        }
        if !other.is_colliding_with_aabb(&aabb) {
            continue;
        }
        if state.contains(ActorFlags::EXCLUDE_SIMILAR)
            && other.state.contains(ActorFlags::EXCLUDE_SIMILAR)
        {
            continue;
        }
        if state.contains(ActorFlags::COLLIDE_WITH_SOLID_OBJECTS_BELOW)
            && self_inner_bottom > (other.aabb_inner.t + other.aabb_inner.b) * 0.5
        {
            continue;
        }
        let one_way = other.state.contains(ActorFlags::IS_ONE_WAY);
        if !one_way || params.downwards {
            if !host.try_handle_collision(arena, probe_id, other_id)
                && !host.try_handle_collision(arena, other_id, probe_id)
            {
                return PositionProbe::Collider(other_id);
            }
        }
    }

    PositionProbe::Empty
}
