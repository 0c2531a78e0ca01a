//! Delta-compressed snapshot decoding.
//!
//! Snapshots land in a fixed-depth ring indexed by frame number. A delta
//! snapshot is decoded against the referenced prior snapshot; when that
//! reference has been evicted or was itself invalid, the bytes are still
//! consumed (the stream must stay in sync) but the result is discarded and
//! the client keeps operating on its last good snapshot.

use tracing::{debug, warn};
use wiresync_core::{DropError, Ring};
use wiresync_net::blocks::{GameStateBlock, PlayerState, ScoreboardBlock};
use wiresync_net::entity::{read_entity_header, BaselineTable, EntityState};
use wiresync_net::protocol::{FrameFlags, FrameHeader, MAX_AREA_BYTES, UPDATE_BACKUP};
use wiresync_net::{MessageReader, MsgError};

// Optional-block presence bits.
const BLOCK_GAME_STATE: u8 = 1 << 0;
const BLOCK_SCOREBOARD: u8 = 1 << 1;

/// One decoded world-state snapshot.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Monotonic frame number; 0 only in never-written ring slots.
    pub frame: u64,
    /// Server time this snapshot represents.
    pub server_time: i64,
    /// Frame this snapshot was decoded against.
    pub delta_frame: Option<u64>,
    /// Frame flags.
    pub flags: FrameFlags,
    /// False when the delta reference was unavailable; an invalid
    /// snapshot occupies its ring slot but is never applied.
    pub valid: bool,
    /// Dense entity list in ascending slot order.
    pub entities: Vec<EntityState>,
    /// Player states, one per point of view.
    pub players: Vec<PlayerState>,
    /// Match-level state, when the server has sent it.
    pub game_state: Option<GameStateBlock>,
    /// Scoreboard, when the server has sent it.
    pub scoreboard: Option<ScoreboardBlock>,
    /// Area-visibility bitset.
    pub area_bits: Vec<u8>,
}

/// Summary of one parsed frame, returned whether or not it was valid.
#[derive(Debug, Clone, Copy)]
pub struct ParsedFrame {
    /// Frame number.
    pub frame: u64,
    /// Server time carried by the frame.
    pub server_time: i64,
    /// Commands the server had executed when it built the frame.
    pub ucmd_executed: u64,
    /// Whether the snapshot was applied.
    pub valid: bool,
}

/// Ring of recent snapshots plus the entity baselines they decode against.
pub struct SnapshotTracker {
    ring: Ring<Snapshot, UPDATE_BACKUP>,
    baselines: BaselineTable,
    latest: Option<u64>,
}

impl SnapshotTracker {
    /// An empty tracker with zero baselines.
    pub fn new() -> Self {
        Self {
            ring: Ring::new(),
            baselines: BaselineTable::new(),
            latest: None,
        }
    }

    /// Install one baseline entity state.
    pub fn set_baseline(&mut self, state: EntityState) {
        self.baselines.set(state);
    }

    /// The most recent valid snapshot.
    pub fn latest(&self) -> Option<&Snapshot> {
        let frame = self.latest?;
        let snap = self.ring.get(frame);
        (snap.valid && snap.frame == frame).then_some(snap)
    }

    /// A specific snapshot, if still in the ring and valid.
    pub fn get(&self, frame: u64) -> Option<&Snapshot> {
        let snap = self.ring.get(frame);
        (snap.valid && snap.frame == frame).then_some(snap)
    }

    /// Parse one `frame` payload into the ring.
    ///
    /// The reference snapshot is cloned out of the ring first because the
    /// decoded snapshot may land in the same slot. A snapshot whose
    /// reference is gone decodes against baselines, is stored invalid, and
    /// never becomes `latest`.
    pub fn parse_frame(&mut self, r: &mut MessageReader) -> Result<ParsedFrame, DropError> {
        let header = FrameHeader::read(r)?;

        let reference: Option<Snapshot> = match header.delta_frame {
            Some(delta) => {
                let old = self.ring.get(delta);
                if old.valid && old.frame == delta {
                    Some(old.clone())
                } else {
                    None
                }
            }
            None => None,
        };
        // A delta snapshot without its reference is decoded for stream
        // sync but discarded.
        let valid = header.delta_frame.is_none() || reference.is_some();
        if !valid {
            warn!(
                frame = header.frame,
                delta = ?header.delta_frame,
                "delta reference evicted, discarding snapshot"
            );
        }

        let area_len = r.read_u8()? as usize;
        if area_len > MAX_AREA_BYTES {
            return Err(DropError::IllegalMessage(format!(
                "area bitset of {area_len} bytes"
            )));
        }
        let area_bits = r.read_data(area_len)?.to_vec();

        let players = Self::parse_players(reference.as_ref(), r)?;
        let (game_state, scoreboard) = Self::parse_blocks(reference.as_ref(), r)?;
        let entities = self.parse_entities(reference.as_ref(), r)?;

        let snapshot = Snapshot {
            frame: header.frame,
            server_time: header.server_time,
            delta_frame: header.delta_frame,
            flags: header.flags,
            valid,
            entities,
            players,
            game_state,
            scoreboard,
            area_bits,
        };
        *self.ring.get_mut(header.frame) = snapshot;
        if valid {
            debug!(frame = header.frame, "snapshot applied");
            self.latest = Some(header.frame);
        }

        Ok(ParsedFrame {
            frame: header.frame,
            server_time: header.server_time,
            ucmd_executed: header.ucmd_executed,
            valid,
        })
    }

    fn parse_players(
        reference: Option<&Snapshot>,
        r: &mut MessageReader,
    ) -> Result<Vec<PlayerState>, MsgError> {
        let count = r.read_u8()? as usize;
        let mut players = Vec::with_capacity(count);
        for i in 0..count {
            let from = reference
                .and_then(|s| s.players.get(i))
                .copied()
                .unwrap_or(PlayerState::ZERO);
            players.push(PlayerState::read_delta(&from, r)?);
        }
        Ok(players)
    }

    fn parse_blocks(
        reference: Option<&Snapshot>,
        r: &mut MessageReader,
    ) -> Result<(Option<GameStateBlock>, Option<ScoreboardBlock>), MsgError> {
        let present = r.read_u8()?;

        let game_state = if present & BLOCK_GAME_STATE != 0 {
            let from = reference
                .and_then(|s| s.game_state)
                .unwrap_or(GameStateBlock::ZERO);
            Some(GameStateBlock::read_delta(&from, r)?)
        } else {
            // Absent on the wire: the reference's block carries forward.
            reference.and_then(|s| s.game_state)
        };

        let scoreboard = if present & BLOCK_SCOREBOARD != 0 {
            let from = reference
                .and_then(|s| s.scoreboard)
                .unwrap_or(ScoreboardBlock::ZERO);
            Some(ScoreboardBlock::read_delta(&from, r)?)
        } else {
            reference.and_then(|s| s.scoreboard)
        };

        Ok((game_state, scoreboard))
    }

    /// Dual-walk of the reference entity list and the wire stream, both in
    /// ascending slot order, producing the new dense list.
    fn parse_entities(
        &self,
        reference: Option<&Snapshot>,
        r: &mut MessageReader,
    ) -> Result<Vec<EntityState>, DropError> {
        let old: &[EntityState] = match reference {
            Some(snapshot) => &snapshot.entities,
            None => &[],
        };
        let mut old_idx = 0;
        let mut entities: Vec<EntityState> = Vec::with_capacity(old.len());

        while let Some(record) = read_entity_header(r)? {
            let number = record.number;

            // Entities below the wire slot persisted unchanged.
            while old_idx < old.len() && old[old_idx].number < number {
                entities.push(old[old_idx]);
                old_idx += 1;
            }

            if old_idx < old.len() && old[old_idx].number == number {
                // Update or removal of a known entity.
                if record.remove {
                    old_idx += 1;
                    continue;
                }
                let mut state = EntityState::read_delta(&old[old_idx], r)?;
                state.number = number;
                entities.push(state);
                old_idx += 1;
            } else {
                // Newly appeared: delta against the baseline for its slot.
                if record.remove {
                    continue;
                }
                let base = self.baselines.get(number);
                let mut state = EntityState::read_delta(&base, r)?;
                state.number = number;
                entities.push(state);
            }
        }

        // Both lists ascend by slot, so everything the stream never
        // visited persisted off its end.
        entities.extend_from_slice(&old[old_idx..]);
        Ok(entities)
    }

    /// Drop all snapshots and baselines; used on disconnect.
    pub fn reset(&mut self) {
        self.ring.reset();
        self.baselines.reset();
        self.latest = None;
    }
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self::new()
    }
}
