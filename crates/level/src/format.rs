use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sim::Vec2;
use thiserror::Error;
use tracing::debug;

use crate::events::{tile_center, EventGrid, EventKind, OffGridEvent, CELL_ILLUMINATED};
use crate::TILE_SIZE;

/// Wire flag: the record carries no parameter block.
const FLAG_NO_PARAMS: u8 = 0x01;
/// Wire flag: the record carries generator bytes.
const FLAG_GENERATOR: u8 = 0x02;
/// Wire flag: the event only exists in multiplayer sessions.
const FLAG_MULTIPLAYER_ONLY: u8 = 0x80;
/// Generator byte: start the countdown at the full delay instead of armed.
const GENERATOR_START_DELAYED: u8 = 0x01;

#[derive(Debug, Error)]
pub enum LevelLoadError {
    #[error("level stream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid level stream: {0}")]
    InvalidFormat(&'static str),
    #[error("resumable layout has {found} cells, grid expects {expected}")]
    LayoutMismatch { expected: u32, found: u32 },
}

fn invalid_format(message: &'static str) -> LevelLoadError {
    LevelLoadError::InvalidFormat(message)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

impl Difficulty {
    /// Which wire-flag bit gates events into this difficulty.
    fn bit(self) -> u8 {
        match self {
            Difficulty::Easy => 4,
            Difficulty::Normal => 5,
            Difficulty::Hard => 6,
        }
    }
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_params<R: Read>(reader: &mut R) -> io::Result<[u8; 16]> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// LEB128 unsigned 32-bit varint.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u32, LevelLoadError> {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let byte = read_u8(reader)?;
        if shift == 28 && byte > 0x0f {
            return Err(invalid_format("varint out of 32-bit range"));
        }
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn write_varint<W: Write>(writer: &mut W, mut value: u32) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return writer.write_all(&[byte]);
        }
        writer.write_all(&[byte | 0x80])?;
    }
}

/// Reads the per-tile event records of a level into a fresh grid.
///
/// Each record is a `u16` kind plus a flag byte; flagged records carry two
/// generator bytes and most carry a 16-byte parameter block. Events gated
/// to another difficulty or to multiplayer are dropped. Spawn points, warp
/// targets and generators land in their side tables; tile-modifier events
/// are also reported to `on_tile_modifier` so the tile map can mirror them.
/// A trailing list of off-grid records is retained verbatim.
pub fn read_events<R: Read>(
    reader: &mut R,
    width: i32,
    height: i32,
    difficulty: Difficulty,
    mut on_tile_modifier: impl FnMut(i32, i32, EventKind, &[u8; 16]),
) -> Result<EventGrid, LevelLoadError> {
    let mut grid = EventGrid::new(width, height);
    let difficulty_bit = difficulty.bit();

    for y in 0..height {
        for x in 0..width {
            let kind = EventKind(read_u16(reader)?);
            let mut flags = read_u8(reader)?;

            let (generator_flags, generator_delay) = if flags & FLAG_GENERATOR != 0 {
                (read_u8(reader)?, read_u8(reader)?)
            } else {
                (0, 0)
            };

            let params = if flags & FLAG_NO_PARAMS == 0 {
                flags ^= FLAG_NO_PARAMS;
                read_params(reader)?
            } else {
                [0u8; 16]
            };

            let cell_flags = flags & CELL_ILLUMINATED;
            let difficulty_match =
                flags & (1 << difficulty_bit) != 0 && flags & FLAG_MULTIPLAYER_ONLY == 0;

            if flags & FLAG_GENERATOR != 0 {
                if kind != EventKind::EMPTY && difficulty_match {
                    grid.add_generator(
                        x,
                        y,
                        kind,
                        cell_flags,
                        params,
                        generator_delay,
                        generator_flags & GENERATOR_START_DELAYED == 0,
                    );
                }
                continue;
            }

            if flags != 0 && !difficulty_match {
                continue;
            }
            match kind {
                EventKind::EMPTY => {}
                EventKind::LEVEL_START => {
                    grid.add_spawn_position(
                        params[0],
                        Vec2::new((x * TILE_SIZE) as f32, (y * TILE_SIZE) as f32 - 8.0),
                    );
                }
                EventKind::WARP_TARGET => {
                    grid.add_warp_target(params[0] as u16, tile_center(x, y));
                }
                kind if kind.is_tile_modifier() => {
                    grid.store_event(x, y, kind, cell_flags, params);
                    on_tile_modifier(x, y, kind, &params);
                }
                kind => {
                    grid.store_event(x, y, kind, cell_flags, params);
                }
            }
        }
    }

    let off_grid_count = read_varint(reader)?;
    for _ in 0..off_grid_count {
        let x = read_varint(reader)? as i32;
        let y = read_varint(reader)? as i32;
        let kind = EventKind(read_u16(reader)?);
        let flags = read_u8(reader)?;
        if flags & FLAG_GENERATOR != 0 {
            let _ = read_u8(reader)?;
            let _ = read_u8(reader)?;
        }
        let params = if flags & FLAG_NO_PARAMS == 0 {
            read_params(reader)?
        } else {
            [0u8; 16]
        };
        grid.push_off_grid_event(OffGridEvent {
            x,
            y,
            kind,
            flags,
            params,
        });
    }

    debug!(
        width,
        height,
        generators = grid.generators().len(),
        off_grid = grid.off_grid_events().len(),
        "events_loaded"
    );
    Ok(grid)
}

/// Writes the grid in its resumable form: cell count, then kind, flags and
/// parameters per cell as varint-prefixed records. With `from_checkpoint`
/// set the checkpoint snapshot is written instead of live state, so a saved
/// game resumes from the last checkpoint rather than mid-room.
pub fn serialize_resumable<W: Write>(
    writer: &mut W,
    grid: &EventGrid,
    from_checkpoint: bool,
) -> io::Result<()> {
    let cells = match grid.checkpoint_cells() {
        Some(snapshot) if from_checkpoint => snapshot,
        _ => grid.cells(),
    };
    write_varint(writer, cells.len() as u32)?;
    for cell in cells {
        write_varint(writer, cell.kind.0 as u32)?;
        write_varint(writer, cell.flags as u32)?;
        writer.write_all(&cell.params)?;
    }
    Ok(())
}

/// Overwrites the grid's cells from a resumable stream. Activation state is
/// not part of the stream; every cell comes back inactive and is realized
/// again by zone activation.
pub fn deserialize_resumable<R: Read>(
    reader: &mut R,
    grid: &mut EventGrid,
) -> Result<(), LevelLoadError> {
    let expected = grid.cells().len() as u32;
    let found = read_varint(reader)?;
    if found != expected {
        return Err(LevelLoadError::LayoutMismatch { expected, found });
    }
    for index in 0..expected as usize {
        let kind = read_varint(reader)?;
        let kind = u16::try_from(kind).map_err(|_| invalid_format("event kind out of range"))?;
        let flags = read_varint(reader)?;
        let flags = u8::try_from(flags).map_err(|_| invalid_format("cell flags out of range"))?;
        let params = read_params(reader)?;
        let cell = &mut grid.cells_mut()[index];
        cell.kind = EventKind(kind);
        cell.flags = flags;
        cell.active = false;
        cell.params = params;
    }
    Ok(())
}

/// Writes a save file through a temporary sibling so a crash mid-write
/// never leaves a truncated save behind.
pub fn write_save_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, bytes)?;
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("save.tmp");
    let tmp_name = format!("{file_name}.tmp");
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}
