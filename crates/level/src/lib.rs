pub mod controller;
pub mod events;
pub mod format;
pub mod weather;

/// Fixed simulation rate; `time_mult` of 1.0 is one tick at this rate.
pub const FRAMES_PER_SECOND: f32 = 60.0;

/// Tile edge length in world pixels.
pub const TILE_SIZE: i32 = 32;

/// Half-extent, in tiles, of the activation zone around each player.
pub const ACTIVATE_TILE_RANGE: i32 = 26;

/// Extra tiles added to the activation zone before an actor is deactivated,
/// so actors on the edge do not flicker in and out.
pub const ACTIVATE_TILE_MARGIN: i32 = 4;

/// Depth assigned to actors respawned during a rollback.
pub const MAIN_PLANE_Z: f32 = 500.0;

/// Depth assigned to actors spawned by zone activation.
pub const SPRITE_PLANE_Z: f32 = 550.0;

pub use controller::{LevelContext, LevelController, LevelHost, SpawnRequest};
pub use events::{
    EventCell, EventGrid, EventKind, PitType, PlayerArchetype, SpawnPoint, WarpTarget,
};
pub use format::{
    deserialize_resumable, read_events, serialize_resumable, write_save_atomic, Difficulty,
    LevelLoadError,
};
pub use weather::{Weather, WeatherKind};
