//! Typed binary cursors for outgoing and incoming byte buffers.
//!
//! All multi-byte values are little-endian. Every read is bounds-checked
//! against the buffer length; reading past the end is always an error,
//! never undefined behavior.

use thiserror::Error;
use wiresync_core::DropError;

/// Errors raised by [`MessageReader`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MsgError {
    /// A read asked for more bytes than remain.
    #[error("read past end of message: wanted {wanted} bytes, {remaining} remaining")]
    Overflow {
        /// Bytes requested.
        wanted: usize,
        /// Bytes left.
        remaining: usize,
    },

    /// A string field had no zero terminator before the buffer ended.
    #[error("unterminated string in message")]
    UnterminatedString,

    /// A string field was not valid UTF-8.
    #[error("malformed string in message")]
    BadString,
}

impl From<MsgError> for DropError {
    fn from(err: MsgError) -> Self {
        match err {
            MsgError::Overflow { wanted, remaining } => {
                DropError::MessageBounds { wanted, remaining }
            }
            other => DropError::IllegalMessage(other.to_string()),
        }
    }
}

/// Growable little-endian byte writer.
#[derive(Debug, Default, Clone)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer, yielding the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Discard everything written so far.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Write one unsigned byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write one signed byte.
    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    /// Write an unsigned 16-bit value.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a signed 16-bit value.
    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write an unsigned 32-bit value.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a signed 32-bit value.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write an unsigned 64-bit value.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a signed 64-bit value.
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a zero-terminated string. Interior NULs are not permitted and
    /// are replaced with `'.'` to keep the terminator unambiguous.
    pub fn write_string(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.buf.push(if b == 0 { b'.' } else { b });
        }
        self.buf.push(0);
    }

    /// Append raw bytes.
    pub fn write_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

/// Bounds-checked little-endian byte reader.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    /// Wrap a received buffer.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current cursor position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MsgError> {
        if self.remaining() < n {
            return Err(MsgError::Overflow {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), MsgError> {
        self.take(n).map(|_| ())
    }

    /// Read one unsigned byte.
    pub fn read_u8(&mut self) -> Result<u8, MsgError> {
        Ok(self.take(1)?[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8, MsgError> {
        Ok(self.take(1)?[0] as i8)
    }

    /// Read an unsigned 16-bit value.
    pub fn read_u16(&mut self) -> Result<u16, MsgError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a signed 16-bit value.
    pub fn read_i16(&mut self) -> Result<i16, MsgError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    /// Read an unsigned 32-bit value.
    pub fn read_u32(&mut self) -> Result<u32, MsgError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a signed 32-bit value.
    pub fn read_i32(&mut self) -> Result<i32, MsgError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an unsigned 64-bit value.
    pub fn read_u64(&mut self) -> Result<u64, MsgError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a signed 64-bit value.
    pub fn read_i64(&mut self) -> Result<i64, MsgError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a zero-terminated string.
    pub fn read_string(&mut self) -> Result<String, MsgError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(MsgError::UnterminatedString)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| MsgError::BadString)?;
        self.pos += nul + 1;
        Ok(s.to_owned())
    }

    /// Read `n` raw bytes.
    pub fn read_data(&mut self, n: usize) -> Result<&'a [u8], MsgError> {
        self.take(n)
    }
}
