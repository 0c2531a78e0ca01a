//! User command sampling, buffering, and transmission windows.

use tracing::warn;
use wiresync_core::{DropError, Millis, Ring};
use wiresync_net::protocol::COMMAND_BACKUP;
use wiresync_net::usercmd::Buttons;
use wiresync_net::{MessageWriter, UserCommand};

/// One tick's worth of raw player input, merged into the open command.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputSample {
    /// Forward axis, -128..=127.
    pub forward: i8,
    /// Strafe axis.
    pub side: i8,
    /// Vertical axis.
    pub up: i8,
    /// Buttons held this tick.
    pub buttons: Buttons,
    /// Latest view angles.
    pub angles: [i16; 3],
}

/// Ring of finalized user commands plus the one still-open command.
///
/// Counters are monotonic counts of finalized commands: `acknowledged`
/// commands the server has executed, `sent` commands put on the wire,
/// `head` commands finalized. `acknowledged <= sent <= head` always holds.
#[derive(Debug)]
pub struct InputPipeline {
    ring: Ring<UserCommand, COMMAND_BACKUP>,
    head: u64,
    sent: u64,
    acknowledged: u64,
    open: UserCommand,
    last_stamp: Option<Millis>,
    accumulated_ms: f64,
    interval_ms: f64,
    resend: u64,
}

impl InputPipeline {
    /// Pipeline targeting `interval_ms` between commands, duplicating up
    /// to `resend` already-sent commands into each move packet.
    pub fn new(interval_ms: f64, resend: u32) -> Self {
        Self {
            ring: Ring::new(),
            head: 0,
            sent: 0,
            acknowledged: 0,
            open: UserCommand::ZERO,
            last_stamp: None,
            accumulated_ms: 0.0,
            interval_ms,
            resend: u64::from(resend),
        }
    }

    /// Merge raw input into the open command. Buttons accumulate so a
    /// press shorter than one command interval still registers; axes and
    /// angles take the latest value.
    pub fn sample(&mut self, sample: &InputSample) {
        self.open.forward = sample.forward;
        self.open.side = sample.side;
        self.open.up = sample.up;
        self.open.buttons |= sample.buttons;
        self.open.angles = sample.angles;
    }

    /// Accumulate elapsed real time and finalize commands at the target
    /// rate, carrying the fractional remainder so the long-run rate does
    /// not drift. Returns how many commands were finalized.
    pub fn advance(&mut self, elapsed_ms: f64, server_time: Millis) -> u32 {
        self.accumulated_ms += elapsed_ms;
        let mut finalized = 0;
        while self.accumulated_ms >= self.interval_ms {
            self.accumulated_ms -= self.interval_ms;
            self.finalize(server_time);
            finalized += 1;
        }
        finalized
    }

    fn finalize(&mut self, server_time: Millis) {
        let msec = match self.last_stamp {
            Some(prev) => (server_time - prev).clamp(1, 255) as u8,
            None => 1,
        };
        self.last_stamp = Some(server_time);
        self.open.server_time = server_time;
        self.open.msec = msec;
        *self.ring.get_mut(self.head) = self.open;
        self.head += 1;
        // Next command opens seeded with the current view angles.
        self.open = UserCommand {
            angles: self.open.angles,
            ..UserCommand::ZERO
        };
    }

    /// Write the transmission window: the head counter (so the receiver
    /// can tell resends from new commands), a count byte, then the
    /// commands delta-chained from the zero command. The window reaches
    /// back over unacknowledged commands plus a bounded resend margin,
    /// which drops to zero once the backlog spans half the ring (severe
    /// lag).
    pub fn write_window(&mut self, w: &mut MessageWriter) -> u32 {
        let backup = COMMAND_BACKUP as u64;
        let unacked = self.head - self.acknowledged;
        let mut resend = self.resend;
        if unacked + resend > backup / 2 {
            warn!(unacked, "command backlog high, suppressing resend margin");
            resend = 0;
        }
        let base = self.acknowledged.max(self.head.saturating_sub(backup));
        let start = base.saturating_sub(resend);
        let count = self.head - start;

        w.write_u64(self.head);
        w.write_u8(count as u8);
        let mut reference = UserCommand::ZERO;
        for seq in start..self.head {
            let cmd = *self.ring.get(seq);
            cmd.write_delta(&reference, w);
            reference = cmd;
        }
        self.sent = self.head;
        count as u32
    }

    /// Apply the server's executed-command count from a frame header.
    pub fn acknowledge(&mut self, executed: u64) -> Result<(), DropError> {
        if executed > self.sent {
            return Err(DropError::IllegalMessage(format!(
                "server executed command {executed} beyond sent {}",
                self.sent
            )));
        }
        self.acknowledged = self.acknowledged.max(executed);
        Ok(())
    }

    /// `(acknowledged, sent, head)` counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (self.acknowledged, self.sent, self.head)
    }

    /// Latest finalized command, if any.
    pub fn latest(&self) -> Option<&UserCommand> {
        self.head.checked_sub(1).map(|seq| self.ring.get(seq))
    }

    /// Forget all commands; used on disconnect.
    pub fn reset(&mut self) {
        self.ring.reset();
        self.head = 0;
        self.sent = 0;
        self.acknowledged = 0;
        self.open = UserCommand::ZERO;
        self.last_stamp = None;
        self.accumulated_ms = 0.0;
    }
}
