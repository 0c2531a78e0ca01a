#![warn(missing_docs)]
//! Wire format and transport shared by the client and the embedded server.
//!
//! Everything on the wire is hand-rolled little-endian: a typed byte cursor
//! ([`msg`]), the sequenced netchannel with fragmentation and optional
//! compression ([`chan`]), the reliable text-command stream ([`reliable`]),
//! delta codecs for user commands, entity states and the flat snapshot
//! blocks ([`usercmd`], [`entity`], [`blocks`]), and the connectionless
//! out-of-band handshake packets ([`oob`]).

pub mod blocks;
pub mod chan;
pub mod entity;
pub mod msg;
pub mod oob;
pub mod protocol;
pub mod reliable;
pub mod transport;
pub mod usercmd;

pub use blocks::{GameStateBlock, PlayerState, ScoreboardBlock};
pub use chan::{Incoming, NetChannel, NetError};
pub use entity::{BaselineTable, EntityState};
pub use msg::{MessageReader, MessageWriter, MsgError};
pub use reliable::{ReliableReceiver, ReliableStream};
pub use transport::{loopback_pair, LoopbackTransport, PacketTransport, UdpTransport};
pub use usercmd::UserCommand;
