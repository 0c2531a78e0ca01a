//! Player-state, game-state, and scoreboard snapshot blocks.
//!
//! Each block is a flat struct with a mask-based delta codec against the
//! corresponding block of the reference snapshot, or against the zero
//! block when the snapshot has no parent.

use crate::msg::{MessageReader, MessageWriter, MsgError};
use crate::protocol::MAX_CLIENTS;

/// Fixed stat slots per player.
pub const MAX_STATS: usize = 16;

// PlayerState field-mask bits.
const PM_ORIGIN0: u16 = 1 << 0;
const PM_ORIGIN1: u16 = 1 << 1;
const PM_ORIGIN2: u16 = 1 << 2;
const PM_VELOCITY0: u16 = 1 << 3;
const PM_VELOCITY1: u16 = 1 << 4;
const PM_VELOCITY2: u16 = 1 << 5;
const PM_ANGLE0: u16 = 1 << 6;
const PM_ANGLE1: u16 = 1 << 7;
const PM_ANGLE2: u16 = 1 << 8;
const PM_MOVE_TYPE: u16 = 1 << 9;
const PM_VIEW_HEIGHT: u16 = 1 << 10;
const PM_STATS: u16 = 1 << 11;

// GameStateBlock field-mask bits.
const GM_PHASE: u8 = 1 << 0;
const GM_PHASE_START: u8 = 1 << 1;
const GM_PHASE_DURATION: u8 = 1 << 2;
const GM_FLAGS: u8 = 1 << 3;

/// Authoritative movement state of one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerState {
    /// Quantized world position.
    pub origin: [i32; 3],
    /// Quantized velocity.
    pub velocity: [i32; 3],
    /// View angles as fixed-point shorts.
    pub view_angles: [i16; 3],
    /// Movement type (normal, spectator, frozen, ...).
    pub move_type: u8,
    /// Eye height above the origin.
    pub view_height: i8,
    /// Gameplay stat slots (health, ammo, hud indices).
    pub stats: [i16; MAX_STATS],
}

impl PlayerState {
    /// The zero block used as the delta parent when no reference exists.
    pub const ZERO: PlayerState = PlayerState {
        origin: [0; 3],
        velocity: [0; 3],
        view_angles: [0; 3],
        move_type: 0,
        view_height: 0,
        stats: [0; MAX_STATS],
    };

    /// Delta-encode against `from`: a 16-bit field mask, the changed
    /// fields, and when `PM_STATS` is set a 16-bit stat mask followed by
    /// the changed stat slots.
    pub fn write_delta(&self, from: &PlayerState, w: &mut MessageWriter) {
        let mut mask = 0u16;
        for i in 0..3 {
            if self.origin[i] != from.origin[i] {
                mask |= PM_ORIGIN0 << i;
            }
            if self.velocity[i] != from.velocity[i] {
                mask |= PM_VELOCITY0 << i;
            }
            if self.view_angles[i] != from.view_angles[i] {
                mask |= PM_ANGLE0 << i;
            }
        }
        if self.move_type != from.move_type {
            mask |= PM_MOVE_TYPE;
        }
        if self.view_height != from.view_height {
            mask |= PM_VIEW_HEIGHT;
        }
        let mut stat_mask = 0u16;
        for i in 0..MAX_STATS {
            if self.stats[i] != from.stats[i] {
                stat_mask |= 1 << i;
            }
        }
        if stat_mask != 0 {
            mask |= PM_STATS;
        }

        w.write_u16(mask);
        for i in 0..3 {
            if mask & (PM_ORIGIN0 << i) != 0 {
                w.write_i32(self.origin[i]);
            }
        }
        for i in 0..3 {
            if mask & (PM_VELOCITY0 << i) != 0 {
                w.write_i32(self.velocity[i]);
            }
        }
        for i in 0..3 {
            if mask & (PM_ANGLE0 << i) != 0 {
                w.write_i16(self.view_angles[i]);
            }
        }
        if mask & PM_MOVE_TYPE != 0 {
            w.write_u8(self.move_type);
        }
        if mask & PM_VIEW_HEIGHT != 0 {
            w.write_i8(self.view_height);
        }
        if mask & PM_STATS != 0 {
            w.write_u16(stat_mask);
            for i in 0..MAX_STATS {
                if stat_mask & (1 << i) != 0 {
                    w.write_i16(self.stats[i]);
                }
            }
        }
    }

    /// Decode a state delta-encoded against `from`.
    pub fn read_delta(from: &PlayerState, r: &mut MessageReader) -> Result<Self, MsgError> {
        let mut state = *from;
        let mask = r.read_u16()?;
        for i in 0..3 {
            if mask & (PM_ORIGIN0 << i) != 0 {
                state.origin[i] = r.read_i32()?;
            }
        }
        for i in 0..3 {
            if mask & (PM_VELOCITY0 << i) != 0 {
                state.velocity[i] = r.read_i32()?;
            }
        }
        for i in 0..3 {
            if mask & (PM_ANGLE0 << i) != 0 {
                state.view_angles[i] = r.read_i16()?;
            }
        }
        if mask & PM_MOVE_TYPE != 0 {
            state.move_type = r.read_u8()?;
        }
        if mask & PM_VIEW_HEIGHT != 0 {
            state.view_height = r.read_i8()?;
        }
        if mask & PM_STATS != 0 {
            let stat_mask = r.read_u16()?;
            for i in 0..MAX_STATS {
                if stat_mask & (1 << i) != 0 {
                    state.stats[i] = r.read_i16()?;
                }
            }
        }
        Ok(state)
    }
}

/// Match-level state shared by every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameStateBlock {
    /// Match phase (warmup, countdown, playing, overtime, post-match).
    pub phase: u8,
    /// Server time the current phase started at.
    pub phase_start: i64,
    /// Phase length in milliseconds, 0 for unbounded.
    pub phase_duration: i64,
    /// Gametype flag bits.
    pub flags: u16,
}

impl GameStateBlock {
    /// The zero block used as the delta parent when no reference exists.
    pub const ZERO: GameStateBlock = GameStateBlock {
        phase: 0,
        phase_start: 0,
        phase_duration: 0,
        flags: 0,
    };

    /// Delta-encode against `from` with an 8-bit field mask.
    pub fn write_delta(&self, from: &GameStateBlock, w: &mut MessageWriter) {
        let mut mask = 0u8;
        if self.phase != from.phase {
            mask |= GM_PHASE;
        }
        if self.phase_start != from.phase_start {
            mask |= GM_PHASE_START;
        }
        if self.phase_duration != from.phase_duration {
            mask |= GM_PHASE_DURATION;
        }
        if self.flags != from.flags {
            mask |= GM_FLAGS;
        }

        w.write_u8(mask);
        if mask & GM_PHASE != 0 {
            w.write_u8(self.phase);
        }
        if mask & GM_PHASE_START != 0 {
            w.write_i64(self.phase_start);
        }
        if mask & GM_PHASE_DURATION != 0 {
            w.write_i64(self.phase_duration);
        }
        if mask & GM_FLAGS != 0 {
            w.write_u16(self.flags);
        }
    }

    /// Decode a state delta-encoded against `from`.
    pub fn read_delta(from: &GameStateBlock, r: &mut MessageReader) -> Result<Self, MsgError> {
        let mut state = *from;
        let mask = r.read_u8()?;
        if mask & GM_PHASE != 0 {
            state.phase = r.read_u8()?;
        }
        if mask & GM_PHASE_START != 0 {
            state.phase_start = r.read_i64()?;
        }
        if mask & GM_PHASE_DURATION != 0 {
            state.phase_duration = r.read_i64()?;
        }
        if mask & GM_FLAGS != 0 {
            state.flags = r.read_u16()?;
        }
        Ok(state)
    }
}

/// One scoreboard row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreEntry {
    /// Current score.
    pub score: i16,
    /// Round-trip time in milliseconds.
    pub ping: u16,
    /// Row flag bits (connected, ready, spectating).
    pub flags: u8,
}

/// Per-client score rows, delta-encoded row by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreboardBlock {
    /// One row per client slot.
    pub entries: [ScoreEntry; MAX_CLIENTS],
}

impl ScoreboardBlock {
    /// The zero block used as the delta parent when no reference exists.
    pub const ZERO: ScoreboardBlock = ScoreboardBlock {
        entries: [ScoreEntry {
            score: 0,
            ping: 0,
            flags: 0,
        }; MAX_CLIENTS],
    };

    /// Delta-encode against `from`: a 32-bit row mask, then every dirty
    /// row in full.
    pub fn write_delta(&self, from: &ScoreboardBlock, w: &mut MessageWriter) {
        let mut mask = 0u32;
        for i in 0..MAX_CLIENTS {
            if self.entries[i] != from.entries[i] {
                mask |= 1 << i;
            }
        }
        w.write_u32(mask);
        for i in 0..MAX_CLIENTS {
            if mask & (1 << i) != 0 {
                let entry = &self.entries[i];
                w.write_i16(entry.score);
                w.write_u16(entry.ping);
                w.write_u8(entry.flags);
            }
        }
    }

    /// Decode a scoreboard delta-encoded against `from`.
    pub fn read_delta(from: &ScoreboardBlock, r: &mut MessageReader) -> Result<Self, MsgError> {
        let mut state = *from;
        let mask = r.read_u32()?;
        for i in 0..MAX_CLIENTS {
            if mask & (1 << i) != 0 {
                state.entries[i] = ScoreEntry {
                    score: r.read_i16()?,
                    ping: r.read_u16()?,
                    flags: r.read_u8()?,
                };
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_player() -> PlayerState {
        let mut state = PlayerState {
            origin: [800, -160, 64],
            velocity: [10, 0, -32],
            view_angles: [100, -20_000, 0],
            move_type: 1,
            view_height: 26,
            ..PlayerState::ZERO
        };
        state.stats[0] = 100;
        state.stats[3] = 25;
        state.stats[15] = -1;
        state
    }

    #[test]
    fn test_player_state_roundtrip_from_zero() {
        let state = sample_player();
        let mut w = MessageWriter::new();
        state.write_delta(&PlayerState::ZERO, &mut w);
        let bytes = w.into_bytes();
        let decoded =
            PlayerState::read_delta(&PlayerState::ZERO, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_player_state_unchanged_is_two_bytes() {
        let state = sample_player();
        let mut w = MessageWriter::new();
        state.write_delta(&state, &mut w);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_player_state_stat_delta_touches_only_dirty_slots() {
        let old = sample_player();
        let mut new = old;
        new.stats[3] = 24;
        let mut w = MessageWriter::new();
        new.write_delta(&old, &mut w);
        let bytes = w.into_bytes();
        // field mask + stat mask + one stat
        assert_eq!(bytes.len(), 2 + 2 + 2);
        let decoded = PlayerState::read_delta(&old, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded.stats[3], 24);
        assert_eq!(decoded.stats[0], old.stats[0]);
    }

    #[test]
    fn test_game_state_roundtrip() {
        let state = GameStateBlock {
            phase: 2,
            phase_start: 60_000,
            phase_duration: 600_000,
            flags: 0x0003,
        };
        let mut w = MessageWriter::new();
        state.write_delta(&GameStateBlock::ZERO, &mut w);
        let bytes = w.into_bytes();
        let decoded =
            GameStateBlock::read_delta(&GameStateBlock::ZERO, &mut MessageReader::new(&bytes))
                .unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_scoreboard_delta_writes_only_dirty_rows() {
        let old = ScoreboardBlock::ZERO;
        let mut new = old;
        new.entries[4] = ScoreEntry {
            score: 7,
            ping: 45,
            flags: 1,
        };
        let mut w = MessageWriter::new();
        new.write_delta(&old, &mut w);
        let bytes = w.into_bytes();
        // row mask + one row
        assert_eq!(bytes.len(), 4 + 5);
        let decoded = ScoreboardBlock::read_delta(&old, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded, new);
    }
}
