//! Error taxonomy for the synchronization core.
//!
//! Two fatal-to-the-connection kinds exist: a [`DropError`] tears down only
//! the current connection and returns the client to `Disconnected`, while a
//! `Fatal` [`SessionError`] additionally tears down the embedded server.

use thiserror::Error;

/// Protocol or session-local failure that forces a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropError {
    /// Server answered with a different protocol version.
    #[error("protocol version mismatch: server {server}, client {client}")]
    VersionMismatch {
        /// Version this client speaks.
        client: i32,
        /// Version the server reported.
        server: i32,
    },

    /// A message violated the wire format in a way that cannot be skipped.
    #[error("illegal server message: {0}")]
    IllegalMessage(String),

    /// More unacknowledged reliable commands than the window permits.
    ///
    /// Correctness depends on total ordering with no gaps, so this is a
    /// hard error rather than a silent drop.
    #[error("reliable command overflow: {backlog} unacknowledged, window {window}")]
    ReliableOverflow {
        /// Commands added but not yet acknowledged.
        backlog: u64,
        /// Fixed window capacity.
        window: u64,
    },

    /// A read ran past the declared end of a message.
    #[error("read past end of message: wanted {wanted} bytes, {remaining} remaining")]
    MessageBounds {
        /// Bytes the reader asked for.
        wanted: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// No packet arrived for too many consecutive timeout checks.
    #[error("connection timed out")]
    TimedOut,

    /// The server refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
}

/// Session-level error distinguishing drop from fatal failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Tear down the current connection only.
    #[error("connection dropped: {0}")]
    Drop(#[from] DropError),

    /// Tear down the embedded server and terminate.
    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}
