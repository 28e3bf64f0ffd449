use rand::Rng;
use sim::{ActorFlags, ActorId, Vec2};
use tracing::warn;

use crate::controller::{LevelContext, LevelHost, SpawnRequest};
use crate::weather::Weather;
use crate::{FRAMES_PER_SECOND, MAIN_PLANE_Z, SPRITE_PLANE_Z, TILE_SIZE};

/// Event identifier as stored in level data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(pub u16);

impl EventKind {
    pub const EMPTY: EventKind = EventKind(0);
    /// Placeholder kind for cells claimed by a generator; the real event
    /// lives in the generator table and the cell parameters carry the
    /// generator index.
    pub const GENERATOR: EventKind = EventKind(1);
    pub const LEVEL_START: EventKind = EventKind(2);
    pub const WARP_ORIGIN: EventKind = EventKind(3);
    pub const WARP_TARGET: EventKind = EventKind(4);
    pub const AREA_WEATHER: EventKind = EventKind(5);
    pub const MODIFIER_ONE_WAY: EventKind = EventKind(6);
    pub const MODIFIER_VINE: EventKind = EventKind(7);
    pub const MODIFIER_HOOK: EventKind = EventKind(8);
    pub const MODIFIER_HURT: EventKind = EventKind(9);
    pub const MODIFIER_H_POLE: EventKind = EventKind(10);
    pub const MODIFIER_V_POLE: EventKind = EventKind(11);
    pub const SCENERY_DESTRUCT: EventKind = EventKind(12);
    pub const SCENERY_DESTRUCT_BUTTSTOMP: EventKind = EventKind(13);
    pub const SCENERY_DESTRUCT_SPEED: EventKind = EventKind(14);
    pub const SCENERY_COLLAPSE: EventKind = EventKind(15);
    pub const TRIGGER_AREA: EventKind = EventKind(16);

    /// Kinds that describe tile behavior rather than a spawnable actor;
    /// they are stored in the grid and mirrored into the tile map.
    pub fn is_tile_modifier(self) -> bool {
        matches!(
            self,
            EventKind::MODIFIER_ONE_WAY
                | EventKind::MODIFIER_VINE
                | EventKind::MODIFIER_HOOK
                | EventKind::MODIFIER_H_POLE
                | EventKind::MODIFIER_V_POLE
                | EventKind::SCENERY_DESTRUCT
                | EventKind::SCENERY_DESTRUCT_BUTTSTOMP
                | EventKind::SCENERY_DESTRUCT_SPEED
                | EventKind::SCENERY_COLLAPSE
                | EventKind::TRIGGER_AREA
        )
    }
}

/// Cell flag: the spawned actor starts illuminated.
pub const CELL_ILLUMINATED: u8 = 0x04;

/// Direction bits for hurt-zone queries.
pub mod hurt {
    pub const LEFT: u8 = 1 << 0;
    pub const RIGHT: u8 = 1 << 1;
    pub const UP: u8 = 1 << 2;
    pub const DOWN: u8 = 1 << 3;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCell {
    pub kind: EventKind,
    pub flags: u8,
    /// Set while the cell's event is realized in the world (or, for
    /// generators and weather zones, while the cell is on-screen).
    pub active: bool,
    pub params: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct GeneratorEntry {
    pub kind: EventKind,
    pub params: [u8; 16],
    /// Respawn delay in seconds.
    pub delay: u8,
    /// Countdown in frames; the next spawn happens at or below zero.
    pub time_left: f32,
    /// Weak reference to the last spawned actor.
    pub spawned: Option<ActorId>,
    cell: usize,
}

/// Which player archetypes a spawn point accepts, one bit per archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerArchetype(pub u8);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPoint {
    pub archetype_mask: u8,
    pub pos: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpTarget {
    pub id: u16,
    pub pos: Vec2,
}

/// Event record outside the tile grid, kept from level data but never
/// spawned by zone activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffGridEvent {
    pub x: i32,
    pub y: i32,
    pub kind: EventKind,
    pub flags: u8,
    pub params: [u8; 16],
}

/// What happens to an actor that falls below the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PitType {
    #[default]
    FallForever,
    InstantDeathPit,
    StandOnPlatform,
}

impl PitType {
    pub fn from_raw(raw: u8) -> PitType {
        match raw {
            1 => PitType::InstantDeathPit,
            2 => PitType::StandOnPlatform,
            _ => PitType::FallForever,
        }
    }
}

/// Dense per-tile event storage plus the generator, spawn-point and
/// warp-target tables derived from level data.
#[derive(Debug, Clone)]
pub struct EventGrid {
    width: i32,
    height: i32,
    cells: Vec<EventCell>,
    generators: Vec<GeneratorEntry>,
    spawn_points: Vec<SpawnPoint>,
    warp_targets: Vec<WarpTarget>,
    off_grid_events: Vec<OffGridEvent>,
    checkpoint: Option<Vec<EventCell>>,
    pit_type: PitType,
}

pub fn tile_center(x: i32, y: i32) -> Vec2 {
    Vec2::new(
        (x * TILE_SIZE + TILE_SIZE / 2) as f32,
        (y * TILE_SIZE + TILE_SIZE / 2) as f32,
    )
}

impl EventGrid {
    pub fn new(width: i32, height: i32) -> Self {
        debug_assert!(width >= 0 && height >= 0);
        Self {
            width,
            height,
            cells: vec![EventCell::default(); (width.max(0) * height.max(0)) as usize],
            generators: Vec::new(),
            spawn_points: Vec::new(),
            warp_targets: Vec::new(),
            off_grid_events: Vec::new(),
            checkpoint: None,
            pit_type: PitType::default(),
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    fn index_of(&self, x: i32, y: i32) -> usize {
        (y * self.width + x) as usize
    }

    fn tile_of(&self, index: usize) -> (i32, i32) {
        let index = index as i32;
        (index % self.width, index / self.width)
    }

    pub fn cell(&self, x: i32, y: i32) -> Option<&EventCell> {
        if !self.contains(x, y) {
            return None;
        }
        Some(&self.cells[self.index_of(x, y)])
    }

    pub(crate) fn cells(&self) -> &[EventCell] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [EventCell] {
        &mut self.cells
    }

    pub(crate) fn checkpoint_cells(&self) -> Option<&[EventCell]> {
        self.checkpoint.as_deref()
    }

    pub fn event_at(&self, x: i32, y: i32) -> EventKind {
        self.cell(x, y).map(|c| c.kind).unwrap_or(EventKind::EMPTY)
    }

    pub fn has_event_at(&self, x: i32, y: i32) -> bool {
        self.event_at(x, y) != EventKind::EMPTY
    }

    pub fn event_params(&self, x: i32, y: i32) -> Option<&[u8; 16]> {
        self.cell(x, y).map(|c| &c.params)
    }

    /// Whether the cell hurts an actor entering from `direction`
    /// (a `hurt::*` bit).
    pub fn is_hurting(&self, x: i32, y: i32, direction: u8) -> bool {
        self.cell(x, y)
            .map(|c| c.kind == EventKind::MODIFIER_HURT && c.params[0] & direction != 0)
            .unwrap_or(false)
    }

    /// Writes an event into a cell. An already-active cell stays active only
    /// when the kind does not change, so overwriting with a different event
    /// forces reactivation.
    pub fn store_event(&mut self, x: i32, y: i32, kind: EventKind, flags: u8, params: [u8; 16]) {
        if !self.contains(x, y) {
            return;
        }
        let index = self.index_of(x, y);
        let cell = &mut self.cells[index];
        let keep_active = cell.active && cell.kind == kind;
        *cell = EventCell {
            kind,
            flags,
            active: keep_active,
            params,
        };
    }

    pub fn deactivate(&mut self, x: i32, y: i32) {
        if !self.contains(x, y) {
            return;
        }
        let index = self.index_of(x, y);
        self.cells[index].active = false;
    }

    /// Registers a generator for a cell; the cell itself holds the generator
    /// index so deactivation can find its way back to the entry.
    pub fn add_generator(
        &mut self,
        x: i32,
        y: i32,
        kind: EventKind,
        flags: u8,
        params: [u8; 16],
        delay: u8,
        start_charged: bool,
    ) {
        if !self.contains(x, y) {
            return;
        }
        let generator_index = self.generators.len() as u32;
        self.generators.push(GeneratorEntry {
            kind,
            params,
            delay,
            time_left: if start_charged { 0.0 } else { delay as f32 },
            spawned: None,
            cell: self.index_of(x, y),
        });
        let mut cell_params = [0u8; 16];
        cell_params[0..4].copy_from_slice(&generator_index.to_le_bytes());
        self.store_event(x, y, EventKind::GENERATOR, flags, cell_params);
    }

    pub fn generators(&self) -> &[GeneratorEntry] {
        &self.generators
    }

    pub fn add_spawn_position(&mut self, archetype_mask: u8, pos: Vec2) {
        if archetype_mask == 0 {
            return;
        }
        self.spawn_points.push(SpawnPoint {
            archetype_mask,
            pos,
        });
    }

    /// Picks a spawn position accepting `archetype` uniformly at random.
    pub fn spawn_position(
        &self,
        archetype: PlayerArchetype,
        rng: &mut impl Rng,
    ) -> Option<Vec2> {
        let mask = 1u8.checked_shl(archetype.0 as u32)?;
        let count = self
            .spawn_points
            .iter()
            .filter(|p| p.archetype_mask & mask != 0)
            .count();
        if count == 0 {
            return None;
        }
        let pick = rng.gen_range(0..count);
        self.spawn_points
            .iter()
            .filter(|p| p.archetype_mask & mask != 0)
            .nth(pick)
            .map(|p| p.pos)
    }

    pub fn add_warp_target(&mut self, id: u16, pos: Vec2) {
        self.warp_targets.push(WarpTarget { id, pos });
    }

    /// Warp id at a warp-origin cell.
    pub fn warp_at(&self, x: i32, y: i32) -> Option<u16> {
        let cell = self.cell(x, y)?;
        if cell.kind != EventKind::WARP_ORIGIN {
            return None;
        }
        Some(cell.params[0] as u16)
    }

    /// Picks a target for a warp id uniformly at random.
    pub fn warp_target(&self, id: u16, rng: &mut impl Rng) -> Option<Vec2> {
        let count = self.warp_targets.iter().filter(|t| t.id == id).count();
        if count == 0 {
            return None;
        }
        let pick = rng.gen_range(0..count);
        self.warp_targets
            .iter()
            .filter(|t| t.id == id)
            .nth(pick)
            .map(|t| t.pos)
    }

    pub(crate) fn push_off_grid_event(&mut self, event: OffGridEvent) {
        self.off_grid_events.push(event);
    }

    pub fn off_grid_events(&self) -> &[OffGridEvent] {
        &self.off_grid_events
    }

    pub fn pit_type(&self) -> PitType {
        self.pit_type
    }

    pub fn set_pit_type(&mut self, pit_type: PitType) {
        self.pit_type = pit_type;
    }

    /// Whether a tile row below the grid kills on contact.
    pub fn is_pit_lethal(&self, y: i32) -> bool {
        y >= self.height && self.pit_type == PitType::InstantDeathPit
    }

    /// Visits every cell of `kind`; the callback returns `false` to stop.
    pub fn for_each_event(
        &self,
        kind: EventKind,
        mut callback: impl FnMut(&EventCell, i32, i32) -> bool,
    ) {
        for y in 0..self.height {
            for x in 0..self.width {
                let cell = &self.cells[self.index_of(x, y)];
                if cell.kind == kind && !callback(cell, x, y) {
                    return;
                }
            }
        }
    }

    /// Distinct spawnable kinds referenced by the grid, for asset preloading.
    pub fn preload_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .cells
            .iter()
            .filter(|c| {
                c.kind != EventKind::EMPTY
                    && c.kind != EventKind::GENERATOR
                    && c.kind != EventKind::AREA_WEATHER
            })
            .map(|c| c.kind)
            .chain(self.generators.iter().map(|g| g.kind))
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Activates every inactive cell in the tile rectangle (inclusive,
    /// clamped to the grid). Spawnable events go to the host; weather zones
    /// apply immediately; generator cells only go on-screen. A failed spawn
    /// leaves the cell active.
    pub fn activate_region<H: LevelHost>(
        &mut self,
        ctx: &mut LevelContext<'_, H>,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        allow_async: bool,
    ) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let x1 = x1.clamp(0, self.width - 1);
        let x2 = x2.clamp(0, self.width - 1);
        let y1 = y1.clamp(0, self.height - 1);
        let y2 = y2.clamp(0, self.height - 1);
        for y in y1..=y2 {
            for x in x1..=x2 {
                let index = self.index_of(x, y);
                let cell = &mut self.cells[index];
                if cell.kind == EventKind::EMPTY || cell.active {
                    continue;
                }
                cell.active = true;
                let (kind, cell_flags, params) = (cell.kind, cell.flags, cell.params);
                if kind == EventKind::GENERATOR {
                    continue;
                }
                if kind == EventKind::AREA_WEATHER {
                    ctx.host.set_weather(Weather::from_raw(params[0]), params[1]);
                    continue;
                }
                let mut flags = ActorFlags::CREATED_FROM_EVENT_MAP;
                if cell_flags & CELL_ILLUMINATED != 0 {
                    flags |= ActorFlags::ILLUMINATED;
                }
                if allow_async {
                    flags |= ActorFlags::ASYNC;
                }
                let _ = ctx.spawn_event(&SpawnRequest {
                    kind,
                    pos: tile_center(x, y),
                    elevation: SPRITE_PLANE_Z,
                    flags,
                    params,
                    origin_tile: (x, y),
                });
            }
        }
    }

    /// Advances generator countdowns. On-screen generators with no live
    /// spawn respawn once charged; off-screen generators keep charging so
    /// they are ready when the player returns.
    pub fn tick_generators<H: LevelHost>(
        &mut self,
        ctx: &mut LevelContext<'_, H>,
        time_mult: f32,
    ) {
        for index in 0..self.generators.len() {
            let cell = self.generators[index].cell;
            if !self.cells[cell].active {
                self.generators[index].time_left -= time_mult;
                continue;
            }
            let alive = self.generators[index]
                .spawned
                .and_then(|id| ctx.arena.get(id))
                .map(|actor| actor.health > 0)
                .unwrap_or(false);
            if alive {
                continue;
            }
            if self.generators[index].time_left <= 0.0 {
                let (x, y) = self.tile_of(cell);
                let generator = &mut self.generators[index];
                generator.time_left = generator.delay as f32 * FRAMES_PER_SECOND;
                let request = SpawnRequest {
                    kind: generator.kind,
                    pos: tile_center(x, y),
                    elevation: SPRITE_PLANE_Z,
                    flags: ActorFlags::FROM_GENERATOR,
                    params: generator.params,
                    origin_tile: (x, y),
                };
                self.generators[index].spawned = ctx.spawn_event(&request);
            } else {
                let generator = &mut self.generators[index];
                generator.time_left -= time_mult;
                generator.spawned = None;
            }
        }
    }

    /// Rearms the generator owning the cell so it can respawn later; called
    /// when a generator-born actor is deactivated rather than destroyed.
    pub fn reset_generator(&mut self, x: i32, y: i32) {
        let Some(cell) = self.cell(x, y) else {
            return;
        };
        if cell.kind != EventKind::GENERATOR {
            return;
        }
        let index =
            u32::from_le_bytes([cell.params[0], cell.params[1], cell.params[2], cell.params[3]])
                as usize;
        let Some(generator) = self.generators.get_mut(index) else {
            warn!(x, y, index, "generator_index_out_of_range");
            return;
        };
        generator.time_left = 0.0;
        generator.spawned = None;
    }

    /// Snapshots cell state for a later rollback.
    pub fn create_checkpoint(&mut self) {
        self.checkpoint = Some(self.cells.clone());
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Restores the checkpoint snapshot. Cells that were realized at the
    /// checkpoint but are not any more respawn immediately; weather zones
    /// reapply their weather; every generator is rearmed.
    pub fn rollback_to_checkpoint<H: LevelHost>(&mut self, ctx: &mut LevelContext<'_, H>) {
        let Some(snapshot) = self.checkpoint.clone() else {
            return;
        };
        for index in 0..self.cells.len() {
            let prev = snapshot[index];
            let respawn = prev.active && !self.cells[index].active;
            self.cells[index] = prev;
            if !respawn || prev.kind == EventKind::GENERATOR {
                continue;
            }
            let (x, y) = self.tile_of(index);
            if prev.kind == EventKind::AREA_WEATHER {
                ctx.host
                    .set_weather(Weather::from_raw(prev.params[0]), prev.params[1]);
                continue;
            }
            let mut flags = ActorFlags::CREATED_FROM_EVENT_MAP;
            if prev.flags & CELL_ILLUMINATED != 0 {
                flags |= ActorFlags::ILLUMINATED;
            }
            let _ = ctx.spawn_event(&SpawnRequest {
                kind: prev.kind,
                pos: tile_center(x, y),
                elevation: MAIN_PLANE_Z,
                flags,
                params: prev.params,
                origin_tile: (x, y),
            });
        }
        for generator in &mut self.generators {
            generator.time_left = 0.0;
            generator.spawned = None;
        }
    }
}
