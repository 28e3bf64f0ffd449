pub mod actor;
pub mod collision;
pub mod geometry;
pub mod spatial;

pub use actor::{Actor, ActorArena, ActorFlags, ActorId};
pub use collision::{
    find_collision_actors_by_aabb, find_collision_actors_by_radius, is_position_empty,
    resolve_collisions, CollisionHost, PositionProbe, TileCollisionParams,
};
pub use geometry::{Aabb, Vec2};
pub use spatial::{ProxyId, SpatialIndex};
