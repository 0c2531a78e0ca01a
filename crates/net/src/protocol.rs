//! Protocol constants, op-codes, and shared payload types.

use crate::msg::{MessageReader, MessageWriter, MsgError};
use wiresync_core::DropError;

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: i32 = 23;

/// Reliable command window; exceeding it is a protocol violation.
pub const MAX_RELIABLE_COMMANDS: usize = 128;

/// Depth of the user-command ring.
pub const COMMAND_BACKUP: usize = 64;

/// Depth of the snapshot ring.
pub const UPDATE_BACKUP: usize = 32;

/// Highest addressable entity slot (slot 0 is reserved as the stream
/// terminator and never holds an entity).
pub const MAX_ENTITIES: usize = 1024;

/// Maximum connected clients, also the scoreboard row count.
pub const MAX_CLIENTS: usize = 32;

/// Largest reassembled message the netchannel will accept.
pub const MAX_MSG_LEN: usize = 32 * 1024;

/// Largest single datagram put on the wire.
pub const MAX_PACKET_LEN: usize = 1400;

/// Payload bytes carried per fragment.
pub const FRAGMENT_SIZE: usize = 1300;

/// Maximum area-visibility bitset size in bytes.
pub const MAX_AREA_BYTES: usize = 32;

/// Server-to-client message op-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    /// Padding, ignored.
    Nop = 0,
    /// One reliable text command with its sequence number.
    ServerCommand = 1,
    /// Session parameters after a successful handshake.
    ServerData = 2,
    /// One baseline entity state.
    SpawnBaseline = 3,
    /// One download chunk.
    Download = 4,
    /// Acknowledges executed user commands.
    CommandAck = 5,
    /// One delta-compressed snapshot.
    Frame = 6,
    /// Demo metadata, skipped outside demo playback.
    DemoInfo = 7,
    /// Length-prefixed extension block; unknown extensions are skipped.
    Extension = 8,
}

impl TryFrom<u8> for ServerOp {
    type Error = DropError;

    fn try_from(value: u8) -> Result<Self, DropError> {
        match value {
            0 => Ok(ServerOp::Nop),
            1 => Ok(ServerOp::ServerCommand),
            2 => Ok(ServerOp::ServerData),
            3 => Ok(ServerOp::SpawnBaseline),
            4 => Ok(ServerOp::Download),
            5 => Ok(ServerOp::CommandAck),
            6 => Ok(ServerOp::Frame),
            7 => Ok(ServerOp::DemoInfo),
            8 => Ok(ServerOp::Extension),
            other => Err(DropError::IllegalMessage(format!(
                "unknown server op {other}"
            ))),
        }
    }
}

/// Client-to-server message op-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    /// Padding, ignored.
    Nop = 0,
    /// A window of delta-encoded user commands.
    Move = 1,
    /// One reliable text command with its sequence number.
    Command = 2,
}

impl TryFrom<u8> for ClientOp {
    type Error = DropError;

    fn try_from(value: u8) -> Result<Self, DropError> {
        match value {
            0 => Ok(ClientOp::Nop),
            1 => Ok(ClientOp::Move),
            2 => Ok(ClientOp::Command),
            other => Err(DropError::IllegalMessage(format!(
                "unknown client op {other}"
            ))),
        }
    }
}

bitflags::bitflags! {
    /// Session flags carried in the `serverdata` payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerDataFlags: u8 {
        /// The transport guarantees ordered delivery; reliable commands
        /// omit their per-command sequence numbers.
        const RELIABLE = 1 << 0;
        /// Pure server: the client must match the pure file list.
        const PURE = 1 << 1;
        /// The server offers HTTP downloads.
        const HTTP = 1 << 2;
        /// The HTTP offer carries a full base URL rather than a port.
        const HTTP_BASEURL = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Flags carried in a `frame` header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// The snapshot deltas from a named predecessor frame.
        const DELTA = 1 << 0;
        /// The snapshot carries multiple points of view.
        const MULTI_POV = 1 << 1;
        /// The snapshot enumerates every entity, not just visible ones.
        const ALL_ENTITIES = 1 << 2;
    }
}

/// Where HTTP downloads should be fetched from, per `serverdata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpSource {
    /// Full base URL provided by the server.
    BaseUrl(String),
    /// Same host as the game server, on this port.
    Port(u16),
}

/// One entry of the pure file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PureFile {
    /// Package name relative to the game directory.
    pub name: String,
    /// CRC32 of the package contents.
    pub checksum: u32,
}

/// Parsed `serverdata` payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerData {
    /// Protocol version the server speaks.
    pub protocol: i32,
    /// Server spawn count, used to detect map restarts.
    pub server_count: i32,
    /// Milliseconds between server snapshots.
    pub snap_frame_time: i16,
    /// This client's player number.
    pub player_num: i16,
    /// Free-form server message shown at connect.
    pub message: String,
    /// Session flags.
    pub flags: ServerDataFlags,
    /// HTTP download source, when `flags` contains `HTTP`.
    pub http: Option<HttpSource>,
    /// Pure file list, when `flags` contains `PURE`.
    pub pure_files: Vec<PureFile>,
}

impl ServerData {
    /// Serialize per the wire layout in the `serverdata` contract.
    pub fn write(&self, w: &mut MessageWriter) {
        w.write_i32(self.protocol);
        w.write_i32(self.server_count);
        w.write_i16(self.snap_frame_time);
        w.write_i16(self.player_num);
        w.write_string(&self.message);
        w.write_u8(self.flags.bits());
        if self.flags.contains(ServerDataFlags::HTTP) {
            match &self.http {
                Some(HttpSource::BaseUrl(url)) => w.write_string(url),
                Some(HttpSource::Port(port)) => w.write_u16(*port),
                // Flag set but no source configured: empty base URL.
                None => w.write_string(""),
            }
        }
        if self.flags.contains(ServerDataFlags::PURE) {
            w.write_u16(self.pure_files.len() as u16);
            for file in &self.pure_files {
                w.write_string(&file.name);
                w.write_u32(file.checksum);
            }
        }
    }

    /// Parse a `serverdata` payload.
    pub fn read(r: &mut MessageReader) -> Result<Self, MsgError> {
        let protocol = r.read_i32()?;
        let server_count = r.read_i32()?;
        let snap_frame_time = r.read_i16()?;
        let player_num = r.read_i16()?;
        let message = r.read_string()?;
        let flags = ServerDataFlags::from_bits_truncate(r.read_u8()?);

        let http = if flags.contains(ServerDataFlags::HTTP) {
            if flags.contains(ServerDataFlags::HTTP_BASEURL) {
                Some(HttpSource::BaseUrl(r.read_string()?))
            } else {
                Some(HttpSource::Port(r.read_u16()?))
            }
        } else {
            None
        };

        let mut pure_files = Vec::new();
        if flags.contains(ServerDataFlags::PURE) {
            let count = r.read_u16()?;
            for _ in 0..count {
                pure_files.push(PureFile {
                    name: r.read_string()?,
                    checksum: r.read_u32()?,
                });
            }
        }

        Ok(Self {
            protocol,
            server_count,
            snap_frame_time,
            player_num,
            message,
            flags,
            http,
            pure_files,
        })
    }
}

/// Parsed `frame` message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Server time this snapshot represents.
    pub server_time: i64,
    /// Monotonic frame number.
    pub frame: u64,
    /// Frame this snapshot deltas from; `None` for a baseline snapshot.
    pub delta_frame: Option<u64>,
    /// Highest user command the server had executed for this client.
    pub ucmd_executed: u64,
    /// Frame flags.
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Serialize the header. A `None` delta frame goes on the wire as 0.
    pub fn write(&self, w: &mut MessageWriter) {
        w.write_i64(self.server_time);
        w.write_u64(self.frame);
        w.write_u64(self.delta_frame.unwrap_or(0));
        w.write_u64(self.ucmd_executed);
        let mut flags = self.flags;
        flags.set(FrameFlags::DELTA, self.delta_frame.is_some());
        w.write_u8(flags.bits());
    }

    /// Parse the header.
    pub fn read(r: &mut MessageReader) -> Result<Self, MsgError> {
        let server_time = r.read_i64()?;
        let frame = r.read_u64()?;
        let delta_raw = r.read_u64()?;
        let ucmd_executed = r.read_u64()?;
        let flags = FrameFlags::from_bits_truncate(r.read_u8()?);
        let delta_frame = if flags.contains(FrameFlags::DELTA) && delta_raw != 0 {
            Some(delta_raw)
        } else {
            None
        };
        Ok(Self {
            server_time,
            frame,
            delta_frame,
            ucmd_executed,
            flags,
        })
    }
}
