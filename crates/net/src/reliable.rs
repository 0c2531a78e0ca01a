//! Reliable text-command stream layered over the unreliable netchannel.
//!
//! The sender keeps every unacknowledged command in a fixed ring and writes
//! all of them into every outgoing message; the receiver de-duplicates by
//! sequence number. Execution is gap-free and monotonic by construction:
//! the last-executed counter only ever advances to the immediate successor.

use crate::msg::{MessageReader, MessageWriter, MsgError};
use crate::protocol::MAX_RELIABLE_COMMANDS;
use tracing::trace;
use wiresync_core::{DropError, Ring};

/// Sending half: ordered, at-least-once delivery of short text commands.
#[derive(Debug, Default)]
pub struct ReliableStream {
    ring: Ring<String, MAX_RELIABLE_COMMANDS>,
    sequence: u64,
    acknowledged: u64,
}

impl ReliableStream {
    /// Empty stream with sequence counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the most recently added command.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Sequence of the most recently acknowledged command.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Commands added but not yet acknowledged.
    pub fn backlog(&self) -> u64 {
        self.sequence - self.acknowledged
    }

    /// Append a command, assigning the next sequence number.
    ///
    /// Fails hard when the unacknowledged backlog would exceed the window:
    /// silently dropping would create a gap the receiver can never close.
    pub fn add(&mut self, text: &str) -> Result<u64, DropError> {
        if self.backlog() >= MAX_RELIABLE_COMMANDS as u64 {
            return Err(DropError::ReliableOverflow {
                backlog: self.backlog(),
                window: MAX_RELIABLE_COMMANDS as u64,
            });
        }
        self.sequence += 1;
        *self.ring.get_mut(self.sequence) = text.to_owned();
        trace!(seq = self.sequence, command = text, "queued reliable command");
        Ok(self.sequence)
    }

    /// Record the peer's acknowledgement. Only ever advances.
    pub fn acknowledge(&mut self, ack: u64) -> Result<(), DropError> {
        if ack > self.sequence {
            return Err(DropError::IllegalMessage(format!(
                "peer acknowledged reliable command {ack}, newest is {}",
                self.sequence
            )));
        }
        if ack > self.acknowledged {
            self.acknowledged = ack;
        }
        Ok(())
    }

    /// Serialize every unacknowledged command.
    ///
    /// `op` is the op-code byte framing each command. On an unreliable
    /// transport each command carries its own sequence number so the
    /// receiver can de-duplicate resends; a reliable transport delivers
    /// in order exactly once, so sequence numbers stay implicit.
    pub fn write_pending(&self, w: &mut MessageWriter, op: u8, reliable_transport: bool) {
        for seq in self.acknowledged + 1..=self.sequence {
            w.write_u8(op);
            if !reliable_transport {
                w.write_u64(seq);
            }
            w.write_string(self.ring.get(seq));
        }
    }

    /// Forget everything; used on disconnect.
    pub fn reset(&mut self) {
        self.ring.reset();
        self.sequence = 0;
        self.acknowledged = 0;
    }
}

/// Receiving half: de-duplicates and enforces gap-free execution order.
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    last_executed: u64,
}

impl ReliableReceiver {
    /// Receiver with nothing executed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the last executed command; doubles as the value to
    /// acknowledge back to the sender.
    pub fn last_executed(&self) -> u64 {
        self.last_executed
    }

    /// Accept one command off the wire.
    ///
    /// Returns `Ok(None)` for a duplicate (already executed — the caller
    /// has consumed the bytes, which keeps the cursor in sync). A sequence
    /// beyond the immediate successor means the peer stopped resending a
    /// command we never executed, which is unrecoverable.
    pub fn receive(&mut self, seq: u64, text: String) -> Result<Option<String>, DropError> {
        if seq <= self.last_executed {
            trace!(seq, "duplicate reliable command ignored");
            return Ok(None);
        }
        if seq != self.last_executed + 1 {
            return Err(DropError::IllegalMessage(format!(
                "reliable command gap: got {seq}, expected {}",
                self.last_executed + 1
            )));
        }
        self.last_executed = seq;
        Ok(Some(text))
    }

    /// Accept the next command from a reliable transport, where sequence
    /// numbers are implicit.
    pub fn receive_implicit(&mut self, text: String) -> String {
        self.last_executed += 1;
        text
    }

    /// Forget everything; used on disconnect.
    pub fn reset(&mut self) {
        self.last_executed = 0;
    }
}

/// Parse one explicit-sequence command body (the bytes following the
/// command op-code on an unreliable transport).
pub fn read_command(r: &mut MessageReader) -> Result<(u64, String), MsgError> {
    let seq = r.read_u64()?;
    let text = r.read_string()?;
    Ok((seq, text))
}
