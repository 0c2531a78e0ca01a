//! User command wire format: a timestamped sample of player input,
//! delta-encoded against its predecessor in the transmission window.

use crate::msg::{MessageReader, MessageWriter, MsgError};

bitflags::bitflags! {
    /// Button bitmask sampled from input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        /// Primary fire.
        const ATTACK = 1 << 0;
        /// Secondary/alt fire.
        const SPECIAL = 1 << 1;
        /// Use/interact.
        const USE = 1 << 2;
        /// Walk modifier.
        const WALK = 1 << 3;
        /// Zoom view.
        const ZOOM = 1 << 4;
        /// Any button pressed at all; lets the server detect activity
        /// without caring which button it was.
        const ANY = 1 << 15;
    }
}

// Delta change-mask bits.
const CM_ANGLE0: u8 = 1 << 0;
const CM_ANGLE1: u8 = 1 << 1;
const CM_ANGLE2: u8 = 1 << 2;
const CM_FORWARD: u8 = 1 << 3;
const CM_SIDE: u8 = 1 << 4;
const CM_UP: u8 = 1 << 5;
const CM_BUTTONS: u8 = 1 << 6;
const CM_MSEC: u8 = 1 << 7;

/// One sampled user command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserCommand {
    /// Reconciled server time this command was finalized at.
    pub server_time: i64,
    /// Milliseconds covered by this command, clamped to at least 1.
    pub msec: u8,
    /// Pressed buttons.
    pub buttons: Buttons,
    /// View angles as fixed-point shorts.
    pub angles: [i16; 3],
    /// Forward movement axis.
    pub forward: i8,
    /// Sideways movement axis.
    pub side: i8,
    /// Vertical movement axis.
    pub up: i8,
}

impl UserCommand {
    /// The all-zero command: the delta reference for the first command in
    /// any transmission window.
    pub const ZERO: UserCommand = UserCommand {
        server_time: 0,
        msec: 0,
        buttons: Buttons::empty(),
        angles: [0; 3],
        forward: 0,
        side: 0,
        up: 0,
    };

    /// Delta-encode `self` against `from`. The server time is written in
    /// full every time; everything else only when changed.
    pub fn write_delta(&self, from: &UserCommand, w: &mut MessageWriter) {
        w.write_i64(self.server_time);

        let mut mask = 0u8;
        for i in 0..3 {
            if self.angles[i] != from.angles[i] {
                mask |= CM_ANGLE0 << i;
            }
        }
        if self.forward != from.forward {
            mask |= CM_FORWARD;
        }
        if self.side != from.side {
            mask |= CM_SIDE;
        }
        if self.up != from.up {
            mask |= CM_UP;
        }
        if self.buttons != from.buttons {
            mask |= CM_BUTTONS;
        }
        if self.msec != from.msec {
            mask |= CM_MSEC;
        }

        w.write_u8(mask);
        for i in 0..3 {
            if mask & (CM_ANGLE0 << i) != 0 {
                w.write_i16(self.angles[i]);
            }
        }
        if mask & CM_FORWARD != 0 {
            w.write_i8(self.forward);
        }
        if mask & CM_SIDE != 0 {
            w.write_i8(self.side);
        }
        if mask & CM_UP != 0 {
            w.write_i8(self.up);
        }
        if mask & CM_BUTTONS != 0 {
            w.write_u16(self.buttons.bits());
        }
        if mask & CM_MSEC != 0 {
            w.write_u8(self.msec);
        }
    }

    /// Decode a command delta-encoded against `from`.
    pub fn read_delta(from: &UserCommand, r: &mut MessageReader) -> Result<Self, MsgError> {
        let mut cmd = *from;
        cmd.server_time = r.read_i64()?;

        let mask = r.read_u8()?;
        for i in 0..3 {
            if mask & (CM_ANGLE0 << i) != 0 {
                cmd.angles[i] = r.read_i16()?;
            }
        }
        if mask & CM_FORWARD != 0 {
            cmd.forward = r.read_i8()?;
        }
        if mask & CM_SIDE != 0 {
            cmd.side = r.read_i8()?;
        }
        if mask & CM_UP != 0 {
            cmd.up = r.read_i8()?;
        }
        if mask & CM_BUTTONS != 0 {
            cmd.buttons = Buttons::from_bits_truncate(r.read_u16()?);
        }
        if mask & CM_MSEC != 0 {
            cmd.msec = r.read_u8()?;
        }
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UserCommand {
        UserCommand {
            server_time: 10_250,
            msec: 16,
            buttons: Buttons::ATTACK | Buttons::ANY,
            angles: [100, -2000, 0],
            forward: 127,
            side: -64,
            up: 0,
        }
    }

    #[test]
    fn test_delta_against_zero_roundtrips() {
        let cmd = sample();
        let mut w = MessageWriter::new();
        cmd.write_delta(&UserCommand::ZERO, &mut w);
        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        let decoded = UserCommand::read_delta(&UserCommand::ZERO, &mut r).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_unchanged_command_encodes_only_time_and_mask() {
        let cmd = sample();
        let mut w = MessageWriter::new();
        cmd.write_delta(&cmd, &mut w);
        // 8 bytes of server time + 1 mask byte, nothing else.
        assert_eq!(w.len(), 9);
        let bytes = w.into_bytes();
        let decoded =
            UserCommand::read_delta(&cmd, &mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_chained_deltas_decode_sequentially() {
        let a = sample();
        let mut b = a;
        b.server_time += 16;
        b.forward = 0;
        let mut c = b;
        c.server_time += 16;
        c.buttons = Buttons::empty();
        c.angles[1] = -1990;

        let mut w = MessageWriter::new();
        a.write_delta(&UserCommand::ZERO, &mut w);
        b.write_delta(&a, &mut w);
        c.write_delta(&b, &mut w);

        let bytes = w.into_bytes();
        let mut r = MessageReader::new(&bytes);
        let da = UserCommand::read_delta(&UserCommand::ZERO, &mut r).unwrap();
        let db = UserCommand::read_delta(&da, &mut r).unwrap();
        let dc = UserCommand::read_delta(&db, &mut r).unwrap();
        assert_eq!((da, db, dc), (a, b, c));
    }
}
