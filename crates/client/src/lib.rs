#![warn(missing_docs)]
//! Client-side synchronization: connection state machine, snapshot
//! decoding, input pipeline, time reconciliation, downloads, and demo
//! recording, all owned by an explicit [`ClientSession`].

pub mod demo;
pub mod download;
pub mod input;
mod parse;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod state;
pub mod time;

pub use download::{DownloadManager, DownloadPurpose, DownloadState, WebPoll, WebTransfer};
pub use input::{InputPipeline, InputSample};
pub use session::{ClientEvent, ClientSession};
pub use settings::ClientSettings;
pub use snapshot::{Snapshot, SnapshotTracker};
pub use state::{ConnectionState, ConnectionTracker, DisconnectReason};
pub use time::TimeReconciler;
