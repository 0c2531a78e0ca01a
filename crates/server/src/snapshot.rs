//! Snapshot building: the encode half of the frame protocol.
//!
//! The builder keeps a ring of the frames it has produced. Each new frame
//! is delta-encoded against the one the client last confirmed receiving,
//! or against baselines when that frame has already left the ring.

use tracing::debug;
use wiresync_core::Ring;
use wiresync_net::blocks::{GameStateBlock, PlayerState, ScoreboardBlock};
use wiresync_net::entity::{write_entity_header, write_entity_stream_end, BaselineTable, EntityState};
use wiresync_net::protocol::{FrameFlags, FrameHeader, UPDATE_BACKUP};
use wiresync_net::MessageWriter;

// Optional-block presence bits, shared with the decoder's layout.
const BLOCK_GAME_STATE: u8 = 1 << 0;
const BLOCK_SCOREBOARD: u8 = 1 << 1;

/// Authoritative world contents from the builder's point of view.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    /// Entities in ascending slot order.
    pub entities: Vec<EntityState>,
    /// One player state per point of view.
    pub players: Vec<PlayerState>,
    /// Match-level state.
    pub game_state: Option<GameStateBlock>,
    /// Scoreboard rows.
    pub scoreboard: Option<ScoreboardBlock>,
    /// Area-visibility bitset.
    pub area_bits: Vec<u8>,
}

impl WorldState {
    /// Insert or replace an entity, keeping the list sorted by slot.
    pub fn set_entity(&mut self, state: EntityState) {
        match self
            .entities
            .binary_search_by_key(&state.number, |e| e.number)
        {
            Ok(i) => self.entities[i] = state,
            Err(i) => self.entities.insert(i, state),
        }
    }

    /// Remove an entity by slot.
    pub fn remove_entity(&mut self, number: u16) {
        if let Ok(i) = self
            .entities
            .binary_search_by_key(&number, |e| e.number)
        {
            self.entities.remove(i);
        }
    }

    /// Look up an entity by slot.
    pub fn entity(&self, number: u16) -> Option<&EntityState> {
        self.entities
            .binary_search_by_key(&number, |e| e.number)
            .ok()
            .map(|i| &self.entities[i])
    }
}

#[derive(Debug, Clone, Default)]
struct HistoryFrame {
    frame: u64,
    world: WorldState,
}

/// Per-client frame encoder.
pub struct SnapshotBuilder {
    history: Ring<HistoryFrame, UPDATE_BACKUP>,
    baselines: BaselineTable,
    frame: u64,
}

impl SnapshotBuilder {
    /// A builder that has produced no frames.
    pub fn new() -> Self {
        Self {
            history: Ring::new(),
            baselines: BaselineTable::new(),
            frame: 0,
        }
    }

    /// Freeze the current world as the baseline set; the same states must
    /// go to the client as `spawnbaseline` records.
    pub fn set_baselines(&mut self, world: &WorldState) {
        self.baselines.reset();
        for entity in &world.entities {
            self.baselines.set(*entity);
        }
    }

    /// Last frame number produced.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Encode the next frame against `acked` (the newest frame the client
    /// confirmed), falling back to a baseline frame when that reference
    /// is gone. Returns the new frame number.
    pub fn build(
        &mut self,
        world: &WorldState,
        server_time: i64,
        ucmd_executed: u64,
        acked: Option<u64>,
        w: &mut MessageWriter,
    ) -> u64 {
        let frame = self.frame + 1;

        let reference: Option<&HistoryFrame> = acked.and_then(|a| {
            let old = self.history.get(a);
            (a != 0 && old.frame == a).then_some(old)
        });
        let delta_frame = reference.map(|r| r.frame);
        if delta_frame.is_none() && acked.is_some() {
            debug!(frame, ?acked, "reference frame evicted, sending baseline");
        }

        FrameHeader {
            server_time,
            frame,
            delta_frame,
            ucmd_executed,
            flags: FrameFlags::empty(),
        }
        .write(w);

        w.write_u8(world.area_bits.len() as u8);
        w.write_data(&world.area_bits);

        let ref_world = reference.map(|r| &r.world);
        Self::write_players(world, ref_world, w);
        Self::write_blocks(world, ref_world, w);
        self.write_entities(world, ref_world, w);

        *self.history.get_mut(frame) = HistoryFrame {
            frame,
            world: world.clone(),
        };
        self.frame = frame;
        frame
    }

    fn write_players(world: &WorldState, reference: Option<&WorldState>, w: &mut MessageWriter) {
        w.write_u8(world.players.len() as u8);
        for (i, player) in world.players.iter().enumerate() {
            let from = reference
                .and_then(|r| r.players.get(i))
                .copied()
                .unwrap_or(PlayerState::ZERO);
            player.write_delta(&from, w);
        }
    }

    fn write_blocks(world: &WorldState, reference: Option<&WorldState>, w: &mut MessageWriter) {
        let ref_game = reference.and_then(|r| r.game_state);
        let ref_scores = reference.and_then(|r| r.scoreboard);

        let mut present = 0u8;
        if let Some(game) = world.game_state {
            if ref_game != Some(game) {
                present |= BLOCK_GAME_STATE;
            }
        }
        if let Some(scores) = world.scoreboard {
            if ref_scores != Some(scores) {
                present |= BLOCK_SCOREBOARD;
            }
        }

        w.write_u8(present);
        if present & BLOCK_GAME_STATE != 0 {
            let game = world.game_state.unwrap_or(GameStateBlock::ZERO);
            game.write_delta(&ref_game.unwrap_or(GameStateBlock::ZERO), w);
        }
        if present & BLOCK_SCOREBOARD != 0 {
            let scores = world.scoreboard.unwrap_or(ScoreboardBlock::ZERO);
            scores.write_delta(&ref_scores.unwrap_or(ScoreboardBlock::ZERO), w);
        }
    }

    /// Two-pointer diff of the reference entity list against the current
    /// one, both ascending by slot. Unchanged entities are omitted; the
    /// decoder's carry-forward rules reconstruct them.
    fn write_entities(
        &self,
        world: &WorldState,
        reference: Option<&WorldState>,
        w: &mut MessageWriter,
    ) {
        let old: &[EntityState] = match reference {
            Some(r) => &r.entities,
            None => &[],
        };
        let new = &world.entities;
        let (mut i, mut j) = (0, 0);

        while i < old.len() || j < new.len() {
            match (old.get(i), new.get(j)) {
                (Some(o), Some(n)) if o.number == n.number => {
                    if o != n {
                        write_entity_header(w, n.number, false);
                        n.write_delta(o, w);
                    }
                    i += 1;
                    j += 1;
                }
                (Some(o), Some(n)) if o.number < n.number => {
                    write_entity_header(w, o.number, true);
                    i += 1;
                }
                (Some(_), Some(n)) => {
                    write_entity_header(w, n.number, false);
                    n.write_delta(&self.baselines.get(n.number), w);
                    j += 1;
                }
                (Some(o), None) => {
                    write_entity_header(w, o.number, true);
                    i += 1;
                }
                (None, Some(n)) => {
                    write_entity_header(w, n.number, false);
                    n.write_delta(&self.baselines.get(n.number), w);
                    j += 1;
                }
                (None, None) => unreachable!("loop condition"),
            }
        }
        write_entity_stream_end(w);
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}
