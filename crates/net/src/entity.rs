//! Entity state wire format and the static baseline table.
//!
//! Per-snapshot entity records are keyed by slot number in ascending order;
//! slot 0 is reserved and terminates the stream. Each record deltas against
//! either the matching entity of the reference snapshot or, for an entity
//! with no history, the baseline table entry for its slot.

use crate::msg::{MessageReader, MessageWriter, MsgError};
use crate::protocol::MAX_ENTITIES;

/// Slot number that terminates a per-snapshot entity stream.
pub const ENTITY_STREAM_END: u16 = 0;

// Record header flags.
const EF_REMOVE: u8 = 1 << 0;

// Delta field-mask bits.
const FM_ORIGIN0: u32 = 1 << 0;
const FM_ORIGIN1: u32 = 1 << 1;
const FM_ORIGIN2: u32 = 1 << 2;
const FM_ANGLE0: u32 = 1 << 3;
const FM_ANGLE1: u32 = 1 << 4;
const FM_ANGLE2: u32 = 1 << 5;
const FM_MODEL: u32 = 1 << 6;
const FM_SOUND: u32 = 1 << 7;
const FM_EFFECTS: u32 = 1 << 8;
const FM_OWNER: u32 = 1 << 9;
const FM_FRAME: u32 = 1 << 10;
const FM_EVENT: u32 = 1 << 11;

/// Networked state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityState {
    /// Logical entity slot; exclusive to the snapshot decoder to write.
    pub number: u16,
    /// Quantized world position.
    pub origin: [i32; 3],
    /// Orientation as fixed-point shorts.
    pub angles: [i16; 3],
    /// Model index into the config registry.
    pub model_index: u16,
    /// Looping sound index.
    pub sound_index: u16,
    /// Effect flag bits.
    pub effects: u32,
    /// Owning entity slot, 0 for none.
    pub owner: u16,
    /// Animation frame.
    pub frame: u16,
    /// One-shot event code.
    pub event: u8,
}

impl EntityState {
    /// Delta-encode `self` against `from`: a 32-bit field mask followed by
    /// only the changed fields. An unchanged entity costs four bytes.
    pub fn write_delta(&self, from: &EntityState, w: &mut MessageWriter) {
        let mut mask = 0u32;
        for i in 0..3 {
            if self.origin[i] != from.origin[i] {
                mask |= FM_ORIGIN0 << i;
            }
            if self.angles[i] != from.angles[i] {
                mask |= FM_ANGLE0 << i;
            }
        }
        if self.model_index != from.model_index {
            mask |= FM_MODEL;
        }
        if self.sound_index != from.sound_index {
            mask |= FM_SOUND;
        }
        if self.effects != from.effects {
            mask |= FM_EFFECTS;
        }
        if self.owner != from.owner {
            mask |= FM_OWNER;
        }
        if self.frame != from.frame {
            mask |= FM_FRAME;
        }
        if self.event != from.event {
            mask |= FM_EVENT;
        }

        w.write_u32(mask);
        for i in 0..3 {
            if mask & (FM_ORIGIN0 << i) != 0 {
                w.write_i32(self.origin[i]);
            }
        }
        for i in 0..3 {
            if mask & (FM_ANGLE0 << i) != 0 {
                w.write_i16(self.angles[i]);
            }
        }
        if mask & FM_MODEL != 0 {
            w.write_u16(self.model_index);
        }
        if mask & FM_SOUND != 0 {
            w.write_u16(self.sound_index);
        }
        if mask & FM_EFFECTS != 0 {
            w.write_u32(self.effects);
        }
        if mask & FM_OWNER != 0 {
            w.write_u16(self.owner);
        }
        if mask & FM_FRAME != 0 {
            w.write_u16(self.frame);
        }
        if mask & FM_EVENT != 0 {
            w.write_u8(self.event);
        }
    }

    /// Decode a state delta-encoded against `from`. The decoded entity
    /// keeps `from`'s value for every unmasked field; the slot number is
    /// assigned by the caller from the record header.
    pub fn read_delta(from: &EntityState, r: &mut MessageReader) -> Result<Self, MsgError> {
        let mut state = *from;
        let mask = r.read_u32()?;
        for i in 0..3 {
            if mask & (FM_ORIGIN0 << i) != 0 {
                state.origin[i] = r.read_i32()?;
            }
        }
        for i in 0..3 {
            if mask & (FM_ANGLE0 << i) != 0 {
                state.angles[i] = r.read_i16()?;
            }
        }
        if mask & FM_MODEL != 0 {
            state.model_index = r.read_u16()?;
        }
        if mask & FM_SOUND != 0 {
            state.sound_index = r.read_u16()?;
        }
        if mask & FM_EFFECTS != 0 {
            state.effects = r.read_u32()?;
        }
        if mask & FM_OWNER != 0 {
            state.owner = r.read_u16()?;
        }
        if mask & FM_FRAME != 0 {
            state.frame = r.read_u16()?;
        }
        if mask & FM_EVENT != 0 {
            state.event = r.read_u8()?;
        }
        Ok(state)
    }
}

/// Header of one per-snapshot entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecordHeader {
    /// Entity slot this record addresses.
    pub number: u16,
    /// The entity left the snapshot; no delta body follows.
    pub remove: bool,
}

/// Write one record header.
pub fn write_entity_header(w: &mut MessageWriter, number: u16, remove: bool) {
    w.write_u16(number);
    w.write_u8(if remove { EF_REMOVE } else { 0 });
}

/// Write the stream terminator.
pub fn write_entity_stream_end(w: &mut MessageWriter) {
    w.write_u16(ENTITY_STREAM_END);
}

/// Read the next record header; `None` means the stream ended.
pub fn read_entity_header(
    r: &mut MessageReader,
) -> Result<Option<EntityRecordHeader>, MsgError> {
    let number = r.read_u16()?;
    if number == ENTITY_STREAM_END {
        return Ok(None);
    }
    let flags = r.read_u8()?;
    Ok(Some(EntityRecordHeader {
        number,
        remove: flags & EF_REMOVE != 0,
    }))
}

/// Zero-history reference states, one per entity slot.
///
/// Brand-new entities and uncompressed snapshots delta against these
/// instead of a prior snapshot.
pub struct BaselineTable {
    states: Vec<EntityState>,
}

impl BaselineTable {
    /// Table of all-zero baselines.
    pub fn new() -> Self {
        Self {
            states: vec![EntityState::default(); MAX_ENTITIES],
        }
    }

    /// Baseline for a slot. Out-of-range slots fall back to a zero state
    /// so a hostile slot number degrades, never panics.
    pub fn get(&self, number: u16) -> EntityState {
        let mut state = self
            .states
            .get(number as usize)
            .copied()
            .unwrap_or_default();
        state.number = number;
        state
    }

    /// Install a baseline, ignoring out-of-range slots.
    pub fn set(&mut self, state: EntityState) {
        if let Some(slot) = self.states.get_mut(state.number as usize) {
            *slot = state;
        }
    }

    /// Reset every baseline to zero; used on disconnect.
    pub fn reset(&mut self) {
        self.states.fill(EntityState::default());
    }
}

impl Default for BaselineTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(number: u16) -> EntityState {
        EntityState {
            number,
            origin: [1600, -320, 24],
            angles: [0, 16384, 0],
            model_index: 7,
            sound_index: 2,
            effects: 0x0000_0110,
            owner: 1,
            frame: 12,
            event: 3,
        }
    }

    #[test]
    fn test_delta_roundtrip_reproduces_every_field() {
        let baseline = EntityState {
            number: 5,
            ..Default::default()
        };
        let state = sample(5);
        let mut w = MessageWriter::new();
        state.write_delta(&baseline, &mut w);
        let bytes = w.into_bytes();
        let decoded =
            EntityState::read_delta(&baseline, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_unchanged_entity_is_four_bytes() {
        let state = sample(9);
        let mut w = MessageWriter::new();
        state.write_delta(&state, &mut w);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_partial_delta_keeps_reference_fields() {
        let old = sample(5);
        let mut new = old;
        new.origin = [1700, -320, 24];
        let mut w = MessageWriter::new();
        new.write_delta(&old, &mut w);
        let bytes = w.into_bytes();
        let decoded = EntityState::read_delta(&old, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded.origin, [1700, -320, 24]);
        assert_eq!(decoded.angles, old.angles);
        assert_eq!(decoded.effects, old.effects);
    }

    #[test]
    fn test_record_header_roundtrip() {
        let mut w = MessageWriter::new();
        write_entity_header(&mut w, 42, false);
        write_entity_header(&mut w, 43, true);
        write_entity_stream_end(&mut w);
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        assert_eq!(
            read_entity_header(&mut r).unwrap(),
            Some(EntityRecordHeader {
                number: 42,
                remove: false
            })
        );
        assert_eq!(
            read_entity_header(&mut r).unwrap(),
            Some(EntityRecordHeader {
                number: 43,
                remove: true
            })
        );
        assert_eq!(read_entity_header(&mut r).unwrap(), None);
    }

    #[test]
    fn test_baseline_table_out_of_range_is_zero() {
        let table = BaselineTable::new();
        let state = table.get(u16::MAX);
        assert_eq!(state.number, u16::MAX);
        assert_eq!(state.origin, [0; 3]);
    }

    #[test]
    fn test_baseline_table_set_get() {
        let mut table = BaselineTable::new();
        table.set(sample(100));
        assert_eq!(table.get(100), sample(100));
        table.reset();
        assert_eq!(table.get(100).model_index, 0);
    }
}
