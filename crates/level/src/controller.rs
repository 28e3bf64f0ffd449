use rand::rngs::SmallRng;
use rand::SeedableRng;
use sim::{
    resolve_collisions, Actor, ActorArena, ActorFlags, ActorId, CollisionHost, SpatialIndex, Vec2,
};
use tracing::{info, warn};

use crate::events::{EventGrid, EventKind, PitType, PlayerArchetype};
use crate::weather::Weather;
use crate::{ACTIVATE_TILE_MARGIN, ACTIVATE_TILE_RANGE, TILE_SIZE};

/// Everything the host needs to realize an event as an actor.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub kind: EventKind,
    pub pos: Vec2,
    pub elevation: f32,
    pub flags: ActorFlags,
    pub params: [u8; 16],
    pub origin_tile: (i32, i32),
}

/// Game-side hooks for the level simulation: actor factories, the tile map,
/// and presentation concerns like weather.
pub trait LevelHost: CollisionHost {
    /// Builds and inserts the actor for an event. `None` means the kind has
    /// no factory; the event stays consumed either way.
    fn spawn_event(&mut self, arena: &mut ActorArena, request: &SpawnRequest) -> Option<ActorId>;

    fn set_weather(&mut self, weather: Weather, intensity: u8);

    /// Mirrors a tile-modifier event into the tile map at load time.
    fn set_tile_event_flags(&mut self, _x: i32, _y: i32, _kind: EventKind, _params: &[u8; 16]) {}

    /// Snapshot tile-map state alongside the event-grid checkpoint.
    fn create_tile_checkpoint(&mut self) {}

    /// Restore the tile-map snapshot during a rollback.
    fn rollback_tiles(&mut self) {}

    /// Asks whether an out-of-range actor consents to being despawned.
    fn on_tile_deactivated(&mut self, _arena: &ActorArena, _id: ActorId) -> bool {
        true
    }

    /// Hands control of a boss fight to the game. Returns whether a boss
    /// was actually armed.
    fn activate_boss(&mut self, _arena: &mut ActorArena) -> bool {
        false
    }

    /// Fallback when a level scripted a boss fight that cannot start, e.g.
    /// the boss actor failed to spawn. Hosts typically end the level here.
    fn on_boss_activation_failed(&mut self) {}
}

/// Split borrow of the controller's actor storage plus the host, handed to
/// grid operations that spawn.
pub struct LevelContext<'a, H: LevelHost> {
    pub arena: &'a mut ActorArena,
    pub index: &'a mut SpatialIndex,
    pub host: &'a mut H,
    pub elapsed_frames: f32,
}

impl<H: LevelHost> LevelContext<'_, H> {
    /// Spawns through the host and finishes bookkeeping: request flags,
    /// spawn time, origin tile, and a broad-phase proxy unless collisions
    /// are disabled for the actor.
    pub fn spawn_event(&mut self, request: &SpawnRequest) -> Option<ActorId> {
        let id = self.host.spawn_event(self.arena, request)?;
        let aabb = {
            let actor = self.arena.get_mut(id)?;
            actor.state.insert(request.flags);
            actor.spawn_frames = self.elapsed_frames;
            actor.origin_tile = request.origin_tile;
            actor.update_aabb();
            if actor.state.contains(ActorFlags::FORCE_DISABLE_COLLISIONS) {
                return Some(id);
            }
            actor.aabb
        };
        let proxy = self.index.insert(id, aabb);
        if let Some(actor) = self.arena.get_mut(id) {
            actor.proxy = Some(proxy);
        }
        Some(id)
    }
}

/// Owns the per-level simulation state and drives the per-frame pipeline:
/// activation zones, generator ticking, collision resolution, and
/// checkpoint/rollback.
pub struct LevelController {
    arena: ActorArena,
    index: SpatialIndex,
    events: EventGrid,
    players: Vec<ActorId>,
    elapsed_frames: f32,
    checkpoint_frames: f32,
    checkpoint_created: bool,
    rollback_tiles: bool,
    rng: SmallRng,
}

impl LevelController {
    pub fn new(events: EventGrid, seed: u64) -> Self {
        Self {
            arena: ActorArena::new(),
            index: SpatialIndex::new(),
            events,
            players: Vec::new(),
            elapsed_frames: 0.0,
            checkpoint_frames: 0.0,
            checkpoint_created: false,
            rollback_tiles: false,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn arena(&self) -> &ActorArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ActorArena {
        &mut self.arena
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn events(&self) -> &EventGrid {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventGrid {
        &mut self.events
    }

    pub fn elapsed_frames(&self) -> f32 {
        self.elapsed_frames
    }

    pub fn pit_type(&self) -> PitType {
        self.events.pit_type()
    }

    /// Whether the tile map is restored on rollback too. Off by default;
    /// collected-but-respawning destructible scenery is usually acceptable.
    pub fn set_rollback_tiles(&mut self, enabled: bool) {
        self.rollback_tiles = enabled;
    }

    /// Inserts an actor and gives it a broad-phase proxy unless it opted
    /// out of collisions entirely.
    pub fn add_actor(&mut self, mut actor: Actor) -> ActorId {
        actor.update_aabb();
        actor.spawn_frames = self.elapsed_frames;
        let disable = actor.state.contains(ActorFlags::FORCE_DISABLE_COLLISIONS);
        let aabb = actor.aabb;
        let id = self.arena.insert(actor);
        if !disable {
            let proxy = self.index.insert(id, aabb);
            if let Some(actor) = self.arena.get_mut(id) {
                actor.proxy = Some(proxy);
            }
        }
        id
    }

    pub fn add_player(&mut self, actor: Actor) -> ActorId {
        let id = self.add_actor(actor);
        self.players.push(id);
        id
    }

    pub fn spawn_position(&mut self, archetype: PlayerArchetype) -> Option<Vec2> {
        self.events.spawn_position(archetype, &mut self.rng)
    }

    pub fn warp_target(&mut self, id: u16) -> Option<Vec2> {
        self.events.warp_target(id, &mut self.rng)
    }

    /// One fixed-rate simulation step.
    pub fn advance_frame<H: LevelHost>(&mut self, host: &mut H, time_mult: f32) {
        self.process_events(host, time_mult);
        resolve_collisions(&mut self.arena, &mut self.index, host, time_mult);
        self.elapsed_frames += time_mult;
    }

    /// Event upkeep for one step: despawn actors that drifted out of every
    /// player's extended zone, activate cells in each player's zone, lay
    /// down the initial checkpoint after the first activation pass, and
    /// tick generators.
    pub fn process_events<H: LevelHost>(&mut self, host: &mut H, time_mult: f32) {
        if !self.players.is_empty() {
            self.deactivate_out_of_range(host);

            let player_tiles = self.player_tiles();
            let mut ctx = LevelContext {
                arena: &mut self.arena,
                index: &mut self.index,
                host,
                elapsed_frames: self.elapsed_frames,
            };
            for (tx, ty) in player_tiles {
                self.events.activate_region(
                    &mut ctx,
                    tx - ACTIVATE_TILE_RANGE,
                    ty - ACTIVATE_TILE_RANGE,
                    tx + ACTIVATE_TILE_RANGE,
                    ty + ACTIVATE_TILE_RANGE,
                    true,
                );
            }

            if !self.checkpoint_created {
                self.events.create_checkpoint();
                host.create_tile_checkpoint();
                self.checkpoint_created = true;
                self.checkpoint_frames = self.elapsed_frames;
                info!("initial_checkpoint_created");
            }
        }

        let mut ctx = LevelContext {
            arena: &mut self.arena,
            index: &mut self.index,
            host,
            elapsed_frames: self.elapsed_frames,
        };
        self.events.tick_generators(&mut ctx, time_mult);
    }

    /// Records a mid-level checkpoint, e.g. when a checkpoint sign is hit.
    pub fn set_checkpoint<H: LevelHost>(&mut self, host: &mut H) {
        self.events.create_checkpoint();
        host.create_tile_checkpoint();
        self.checkpoint_created = true;
        self.checkpoint_frames = self.elapsed_frames;
    }

    /// Rewinds to the last checkpoint after a player death: actors spawned
    /// since are purged (unless marked to survive), the event grid is
    /// restored and respawns what the player had consumed, and the frame
    /// counter rewinds so respawned actors predate the checkpoint again.
    pub fn rollback_to_checkpoint<H: LevelHost>(&mut self, host: &mut H) {
        if !self.checkpoint_created {
            warn!("rollback_without_checkpoint");
            return;
        }
        for id in self.arena.ids() {
            let Some(actor) = self.arena.get(id) else {
                continue;
            };
            if actor.spawn_frames <= self.checkpoint_frames
                || actor.state.contains(ActorFlags::PRESERVE_ON_ROLLBACK)
            {
                continue;
            }
            let origin = actor.origin_tile;
            let event_born = actor
                .state
                .intersects(ActorFlags::CREATED_FROM_EVENT_MAP | ActorFlags::FROM_GENERATOR);
            let from_generator = actor.state.contains(ActorFlags::FROM_GENERATOR);
            host.before_actor_destroyed(&mut self.arena, id);
            if let Some(actor) = self.arena.remove(id) {
                if let Some(proxy) = actor.proxy {
                    self.index.remove(proxy);
                }
            }
            if event_born {
                if from_generator {
                    self.events.reset_generator(origin.0, origin.1);
                }
                self.events.deactivate(origin.0, origin.1);
            }
        }

        let mut ctx = LevelContext {
            arena: &mut self.arena,
            index: &mut self.index,
            host,
            elapsed_frames: self.checkpoint_frames,
        };
        self.events.rollback_to_checkpoint(&mut ctx);
        if self.rollback_tiles {
            host.rollback_tiles();
        }
        self.elapsed_frames = self.checkpoint_frames;
    }

    /// Starts a scripted boss fight, falling back to the host when no boss
    /// can take over.
    pub fn activate_boss<H: LevelHost>(&mut self, host: &mut H) -> bool {
        if host.activate_boss(&mut self.arena) {
            return true;
        }
        warn!("boss_activation_failed");
        host.on_boss_activation_failed();
        false
    }

    fn player_tiles(&self) -> Vec<(i32, i32)> {
        self.players
            .iter()
            .filter_map(|&id| self.arena.get(id))
            .map(|actor| {
                (
                    (actor.pos.x as i32).div_euclid(TILE_SIZE),
                    (actor.pos.y as i32).div_euclid(TILE_SIZE),
                )
            })
            .collect()
    }

    /// Despawns event-born actors whose origin tile left every player's
    /// zone plus margin. The margin keeps edge-of-zone actors from
    /// despawning and respawning as the player paces in place.
    fn deactivate_out_of_range<H: LevelHost>(&mut self, host: &mut H) {
        let player_tiles = self.player_tiles();
        if player_tiles.is_empty() {
            return;
        }
        let reach = ACTIVATE_TILE_RANGE + ACTIVATE_TILE_MARGIN;
        for id in self.arena.ids() {
            let Some(actor) = self.arena.get(id) else {
                continue;
            };
            if !actor
                .state
                .intersects(ActorFlags::CREATED_FROM_EVENT_MAP | ActorFlags::FROM_GENERATOR)
            {
                continue;
            }
            let (ox, oy) = actor.origin_tile;
            let in_reach = player_tiles
                .iter()
                .any(|&(tx, ty)| (ox - tx).abs() <= reach && (oy - ty).abs() <= reach);
            if in_reach {
                continue;
            }
            let from_generator = actor.state.contains(ActorFlags::FROM_GENERATOR);
            if !host.on_tile_deactivated(&self.arena, id) {
                continue;
            }
            if from_generator {
                self.events.reset_generator(ox, oy);
            }
            self.events.deactivate(ox, oy);
            if let Some(actor) = self.arena.get_mut(id) {
                actor.state.insert(ActorFlags::DESTROYED);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::tile_center;
    use sim::{Aabb, TileCollisionParams};

    #[derive(Default)]
    pub(crate) struct TestHost {
        pub(crate) spawned: Vec<(EventKind, (i32, i32))>,
        pub(crate) weather: Option<(Weather, u8)>,
        pub(crate) refuse_spawns: bool,
        pub(crate) deny_deactivation: bool,
        pub(crate) tile_checkpoints: usize,
        pub(crate) tile_rollbacks: usize,
        pub(crate) boss_fallbacks: usize,
    }

    impl CollisionHost for TestHost {
        fn try_handle_collision(
            &mut self,
            _arena: &mut ActorArena,
            _first: ActorId,
            _second: ActorId,
        ) -> bool {
            false
        }

        fn is_tile_empty(&mut self, _aabb: Aabb, _params: TileCollisionParams) -> bool {
            true
        }
    }

    impl LevelHost for TestHost {
        fn spawn_event(
            &mut self,
            arena: &mut ActorArena,
            request: &SpawnRequest,
        ) -> Option<ActorId> {
            if self.refuse_spawns {
                return None;
            }
            self.spawned.push((request.kind, request.origin_tile));
            let mut actor = Actor {
                pos: request.pos,
                state: request.flags,
                hitbox: Aabb::new(-8.0, -8.0, 8.0, 8.0),
                inner_hitbox: Aabb::new(-6.0, -6.0, 6.0, 6.0),
                ..Actor::default()
            };
            actor.update_aabb();
            Some(arena.insert(actor))
        }

        fn set_weather(&mut self, weather: Weather, intensity: u8) {
            self.weather = Some((weather, intensity));
        }

        fn create_tile_checkpoint(&mut self) {
            self.tile_checkpoints += 1;
        }

        fn rollback_tiles(&mut self) {
            self.tile_rollbacks += 1;
        }

        fn on_tile_deactivated(&mut self, _arena: &ActorArena, _id: ActorId) -> bool {
            !self.deny_deactivation
        }

        fn on_boss_activation_failed(&mut self) {
            self.boss_fallbacks += 1;
        }
    }

    const GEM: EventKind = EventKind(40);

    fn player_at(pos: Vec2) -> Actor {
        let mut actor = Actor {
            pos,
            hitbox: Aabb::new(-10.0, -15.0, 10.0, 15.0),
            inner_hitbox: Aabb::new(-8.0, -12.0, 8.0, 12.0),
            ..Actor::default()
        };
        actor.update_aabb();
        actor
    }

    fn wide_level_with_gem() -> LevelController {
        let mut grid = EventGrid::new(200, 12);
        grid.store_event(3, 3, GEM, 0, [0; 16]);
        LevelController::new(grid, 1)
    }

    #[test]
    fn nearby_event_spawns_and_checkpoint_is_laid_down_once() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        controller.add_player(player_at(tile_center(5, 5)));

        controller.advance_frame(&mut host, 1.0);
        assert_eq!(host.spawned, vec![(GEM, (3, 3))]);
        assert!(controller.events().cell(3, 3).unwrap().active);
        assert_eq!(host.tile_checkpoints, 1);

        controller.advance_frame(&mut host, 1.0);
        assert_eq!(host.spawned.len(), 1);
        assert_eq!(host.tile_checkpoints, 1);
    }

    #[test]
    fn actors_despawn_only_past_the_margin_zone() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        let player = controller.add_player(player_at(tile_center(5, 5)));
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.arena().len(), 2);

        // Origin tile (3,3); primary reach ends at tile 3 + 26 = 29, the
        // margin keeps it alive through tile 33.
        let inside_margin = tile_center(3 + ACTIVATE_TILE_RANGE + ACTIVATE_TILE_MARGIN, 5);
        if let Some(actor) = controller.arena_mut().get_mut(player) {
            actor.move_to(inside_margin);
        }
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.arena().len(), 2);
        assert!(controller.events().cell(3, 3).unwrap().active);

        let past_margin = tile_center(3 + ACTIVATE_TILE_RANGE + ACTIVATE_TILE_MARGIN + 1, 5);
        if let Some(actor) = controller.arena_mut().get_mut(player) {
            actor.move_to(past_margin);
        }
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.arena().len(), 1);
        assert!(!controller.events().cell(3, 3).unwrap().active);
    }

    #[test]
    fn actors_can_refuse_deactivation() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        let player = controller.add_player(player_at(tile_center(5, 5)));
        controller.advance_frame(&mut host, 1.0);

        host.deny_deactivation = true;
        if let Some(actor) = controller.arena_mut().get_mut(player) {
            actor.move_to(tile_center(150, 5));
        }
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.arena().len(), 2);
        assert!(controller.events().cell(3, 3).unwrap().active);
    }

    #[test]
    fn proxies_track_live_actors_through_despawns() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        let player = controller.add_player(player_at(tile_center(5, 5)));
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.spatial().proxy_count(), controller.arena().len());

        if let Some(actor) = controller.arena_mut().get_mut(player) {
            actor.move_to(tile_center(150, 5));
        }
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(controller.spatial().proxy_count(), controller.arena().len());
    }

    #[test]
    fn collisionless_actors_get_no_proxy() {
        let mut controller = wide_level_with_gem();
        let mut actor = player_at(Vec2::ZERO);
        actor.state.insert(ActorFlags::FORCE_DISABLE_COLLISIONS);
        let id = controller.add_actor(actor);
        assert!(controller.arena().get(id).unwrap().proxy.is_none());
        assert_eq!(controller.spatial().proxy_count(), 0);
    }

    #[test]
    fn rollback_purges_late_spawns_and_restores_the_grid() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        controller.add_player(player_at(tile_center(5, 5)));
        controller.advance_frame(&mut host, 1.0);
        let frames_at_checkpoint = 0.0;

        // Time passes; the gem is collected and two late actors appear.
        for _ in 0..10 {
            controller.advance_frame(&mut host, 1.0);
        }
        let gem_id = controller
            .arena()
            .iter()
            .find(|(_, a)| a.state.contains(ActorFlags::CREATED_FROM_EVENT_MAP))
            .map(|(id, _)| id)
            .unwrap();
        controller.events_mut().deactivate(3, 3);
        if let Some(actor) = controller.arena_mut().get_mut(gem_id) {
            actor.state.insert(ActorFlags::DESTROYED);
        }
        controller.advance_frame(&mut host, 1.0);

        let doomed = controller.add_actor(player_at(tile_center(6, 6)));
        let mut keeper_actor = player_at(tile_center(7, 7));
        keeper_actor.state.insert(ActorFlags::PRESERVE_ON_ROLLBACK);
        let keeper = controller.add_actor(keeper_actor);

        controller.rollback_to_checkpoint(&mut host);

        assert!(controller.arena().get(doomed).is_none());
        assert!(controller.arena().get(keeper).is_some());
        assert_eq!(controller.elapsed_frames(), frames_at_checkpoint);
        // The collected gem is back.
        assert!(controller.events().cell(3, 3).unwrap().active);
        assert_eq!(host.spawned.last().unwrap(), &(GEM, (3, 3)));
        // Tile rollback is off by default.
        assert_eq!(host.tile_rollbacks, 0);
    }

    #[test]
    fn tile_rollback_is_policy_gated() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        controller.add_player(player_at(tile_center(5, 5)));
        controller.advance_frame(&mut host, 1.0);

        controller.set_rollback_tiles(true);
        controller.rollback_to_checkpoint(&mut host);
        assert_eq!(host.tile_rollbacks, 1);
    }

    #[test]
    fn generator_despawn_rearms_through_the_cell_back_reference() {
        let mut grid = EventGrid::new(200, 12);
        grid.add_generator(4, 4, GEM, 0, [0; 16], 2, true);
        let mut controller = LevelController::new(grid, 1);
        let mut host = TestHost::default();
        let player = controller.add_player(player_at(tile_center(5, 5)));

        controller.advance_frame(&mut host, 1.0);
        controller.advance_frame(&mut host, 1.0);
        assert_eq!(host.spawned.len(), 1);
        let entry_time = controller.events().generators()[0].time_left;
        assert!(entry_time > 0.0);

        if let Some(actor) = controller.arena_mut().get_mut(player) {
            actor.move_to(tile_center(150, 5));
        }
        controller.advance_frame(&mut host, 1.0);
        // Spawned actor despawned, generator rearmed for the next visit;
        // the same-frame tick already counts it further down.
        assert!(controller.events().generators()[0].time_left <= 0.0);
        assert!(controller.events().generators()[0].spawned.is_none());
        assert!(!controller.events().cell(4, 4).unwrap().active);
    }

    #[test]
    fn boss_activation_without_a_boss_falls_back_to_the_host() {
        let mut controller = wide_level_with_gem();
        let mut host = TestHost::default();
        assert!(!controller.activate_boss(&mut host));
        assert_eq!(host.boss_fallbacks, 1);
    }
}
