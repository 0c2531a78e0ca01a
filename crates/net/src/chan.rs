//! Sequenced netchannel over an unreliable datagram transport.
//!
//! Every sequenced packet carries a 32-bit sequence number and the last
//! remote sequence seen. Duplicates and reorders are dropped at this layer;
//! reliability for commands is layered above via [`crate::reliable`].
//! Oversized messages are fragmented; payloads may be zstd-compressed when
//! that actually shrinks them. Out-of-band packets bypass sequencing.

use crate::msg::{MessageReader, MessageWriter};
use crate::oob;
use crate::protocol::{FRAGMENT_SIZE, MAX_MSG_LEN};
use crate::transport::PacketTransport;
use std::io;
use thiserror::Error;
use tracing::{trace, warn};
use wiresync_core::DropError;

/// Only bother compressing payloads at least this large.
const COMPRESS_MIN_LEN: usize = 64;

/// zstd level used for packet payloads; latency matters more than ratio.
const COMPRESS_LEVEL: i32 = 1;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct PacketFlags: u8 {
        const COMPRESSED = 1 << 0;
        const FRAGMENT = 1 << 1;
        const FRAGMENT_LAST = 1 << 2;
    }
}

/// Netchannel failure: either a protocol violation that drops the
/// connection, or a transport I/O error.
#[derive(Debug, Error)]
pub enum NetError {
    /// Protocol violation; the connection must be dropped.
    #[error(transparent)]
    Drop(#[from] DropError),

    /// Transport-level I/O failure.
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// One classified incoming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Connectionless command text (handshake traffic).
    OutOfBand(String),
    /// A complete, reassembled, decompressed sequenced message.
    Message(Vec<u8>),
}

/// Sequenced packet channel bound to one transport.
pub struct NetChannel<T: PacketTransport> {
    transport: T,
    compress: bool,
    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_ack: u32,
    frag_sequence: u32,
    frag_buf: Vec<u8>,
    frag_compressed: bool,
}

impl<T: PacketTransport> NetChannel<T> {
    /// Wrap a transport. `compress` enables payload compression on send;
    /// receive always accepts both compressed and plain payloads.
    pub fn new(transport: T, compress: bool) -> Self {
        Self {
            transport,
            compress,
            outgoing_sequence: 0,
            incoming_sequence: 0,
            incoming_ack: 0,
            frag_sequence: 0,
            frag_buf: Vec::new(),
            frag_compressed: false,
        }
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sequence number of the last message sent.
    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    /// Sequence number of the last complete message received.
    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    /// Last of our sequence numbers the remote reported seeing.
    pub fn acknowledged(&self) -> u32 {
        self.incoming_ack
    }

    /// Forget all sequencing and fragment state, as for a fresh
    /// connection. Without this a reused channel rejects the new
    /// remote's restarted sequence numbers as stale.
    pub fn reset(&mut self) {
        self.outgoing_sequence = 0;
        self.incoming_sequence = 0;
        self.incoming_ack = 0;
        self.frag_sequence = 0;
        self.frag_buf.clear();
        self.frag_compressed = false;
    }

    /// Send an out-of-band command, bypassing sequencing.
    pub fn send_oob(&self, text: &str) -> Result<(), NetError> {
        self.transport.send(&oob::write_oob(text))?;
        Ok(())
    }

    /// Send one sequenced message, compressing and fragmenting as needed.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > MAX_MSG_LEN {
            return Err(DropError::IllegalMessage(format!(
                "outgoing message of {} bytes exceeds limit",
                payload.len()
            ))
            .into());
        }

        let mut flags = PacketFlags::empty();
        let mut data = std::borrow::Cow::Borrowed(payload);
        if self.compress && payload.len() >= COMPRESS_MIN_LEN {
            let packed = zstd::bulk::compress(payload, COMPRESS_LEVEL)?;
            if packed.len() < payload.len() {
                flags |= PacketFlags::COMPRESSED;
                data = std::borrow::Cow::Owned(packed);
            }
        }

        self.outgoing_sequence += 1;
        let sequence = self.outgoing_sequence;

        if data.len() <= FRAGMENT_SIZE {
            let mut w = MessageWriter::new();
            w.write_u32(sequence);
            w.write_u32(self.incoming_sequence);
            w.write_u8(flags.bits());
            w.write_data(&data);
            self.transport.send(w.as_bytes())?;
            return Ok(());
        }

        // Fragment train: one sequence number for the whole message, each
        // fragment addressed by its byte offset.
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + FRAGMENT_SIZE).min(data.len());
            let mut frag_flags = flags | PacketFlags::FRAGMENT;
            if end == data.len() {
                frag_flags |= PacketFlags::FRAGMENT_LAST;
            }
            let mut w = MessageWriter::new();
            w.write_u32(sequence);
            w.write_u32(self.incoming_sequence);
            w.write_u8(frag_flags.bits());
            w.write_u16(offset as u16);
            w.write_data(&data[offset..end]);
            self.transport.send(w.as_bytes())?;
            offset = end;
        }
        trace!(sequence, len = data.len(), "sent fragmented message");
        Ok(())
    }

    /// Poll the transport until a complete packet classifies or nothing is
    /// pending. Intended to be called in a loop once per client tick.
    pub fn poll(&mut self) -> Result<Option<Incoming>, NetError> {
        while let Some(data) = self.transport.recv()? {
            if let Some(incoming) = self.process(&data)? {
                return Ok(Some(incoming));
            }
        }
        Ok(None)
    }

    /// Classify one raw datagram. Returns `None` for duplicates, stale
    /// sequences, and incomplete fragment trains.
    pub fn process(&mut self, data: &[u8]) -> Result<Option<Incoming>, NetError> {
        if oob::is_oob(data) {
            return Ok(Some(Incoming::OutOfBand(oob::parse_oob(data)?)));
        }

        let mut r = MessageReader::new(data);
        let sequence = r.read_u32().map_err(DropError::from)?;
        let ack = r.read_u32().map_err(DropError::from)?;
        let flags =
            PacketFlags::from_bits_truncate(r.read_u8().map_err(DropError::from)?);

        if sequence <= self.incoming_sequence {
            trace!(
                sequence,
                current = self.incoming_sequence,
                "dropping stale or duplicate packet"
            );
            return Ok(None);
        }
        if ack > self.incoming_ack {
            self.incoming_ack = ack;
        }

        if flags.contains(PacketFlags::FRAGMENT) {
            let offset = r.read_u16().map_err(DropError::from)? as usize;
            let payload = r.read_data(r.remaining()).map_err(DropError::from)?;

            if sequence != self.frag_sequence {
                // New train; anything partial from an older one is lost.
                self.frag_sequence = sequence;
                self.frag_buf.clear();
                self.frag_compressed = flags.contains(PacketFlags::COMPRESSED);
            }
            if offset != self.frag_buf.len() {
                warn!(
                    sequence,
                    offset,
                    have = self.frag_buf.len(),
                    "fragment out of order, discarding train"
                );
                self.frag_buf.clear();
                self.frag_sequence = 0;
                return Ok(None);
            }
            if self.frag_buf.len() + payload.len() > MAX_MSG_LEN {
                return Err(DropError::IllegalMessage(
                    "fragment train exceeds message limit".into(),
                )
                .into());
            }
            self.frag_buf.extend_from_slice(payload);

            if !flags.contains(PacketFlags::FRAGMENT_LAST) {
                return Ok(None);
            }
            self.incoming_sequence = sequence;
            let assembled = std::mem::take(&mut self.frag_buf);
            self.frag_sequence = 0;
            let message = if self.frag_compressed {
                decompress(&assembled)?
            } else {
                assembled
            };
            return Ok(Some(Incoming::Message(message)));
        }

        self.incoming_sequence = sequence;
        let payload = r.read_data(r.remaining()).map_err(DropError::from)?;
        let message = if flags.contains(PacketFlags::COMPRESSED) {
            decompress(payload)?
        } else {
            payload.to_vec()
        };
        Ok(Some(Incoming::Message(message)))
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, NetError> {
    zstd::bulk::decompress(data, MAX_MSG_LEN)
        .map_err(|e| DropError::IllegalMessage(format!("bad compressed payload: {e}")).into())
}
