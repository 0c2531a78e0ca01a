#![warn(missing_docs)]
//! Authoritative server: snapshot building, the server half of the
//! connection handshake, and the embedded hosting thread.

pub mod session;
pub mod snapshot;
pub mod thread;

pub use session::{ClientPhase, ServerEvent, ServerSession, ServerSettings};
pub use snapshot::{SnapshotBuilder, WorldState};
pub use thread::{ServerCommand, ServerThread};
