//! Client settings loaded from TOML, with safe defaults and range clamps.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

const DEFAULT_SETTINGS_PATH: &str = "config/client.toml";

/// Tunable client behavior. Every field has a default and is clamped to a
/// safe range on load so a hand-edited file cannot break the protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Target user commands per second.
    pub cmd_rate: u32,
    /// Seconds without a packet before a timeout strike.
    pub timeout_secs: u32,
    /// Extra already-sent commands duplicated into each move packet.
    pub cmd_resend: u32,
    /// Milliseconds between out-of-band challenge retransmits.
    pub challenge_interval_ms: u32,
    /// Challenge retransmits before giving up on a connect attempt.
    pub challenge_retries: u32,
    /// Download chunk retransmits before the download fails.
    pub download_retries: u32,
    /// Milliseconds to wait for a download chunk before re-requesting it.
    pub download_chunk_timeout_ms: u32,
    /// Compress outgoing channel payloads when it helps.
    pub compress: bool,
    /// Directory downloaded files land in.
    pub download_dir: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            cmd_rate: 62,
            timeout_secs: 30,
            cmd_resend: 2,
            challenge_interval_ms: 1500,
            challenge_retries: 8,
            download_retries: 5,
            download_chunk_timeout_ms: 2000,
            compress: true,
            download_dir: "downloads".into(),
        }
    }
}

impl ClientSettings {
    /// Load settings from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_SETTINGS_PATH))
    }

    /// Load settings from an explicit path, falling back to defaults on
    /// errors and clamping every field into range.
    pub fn load_from_path(path: &Path) -> Self {
        let loaded = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ClientSettings>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    ClientSettings::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                ClientSettings::default()
            }
        };
        loaded.clamped()
    }

    /// Clamp every field into its safe range.
    pub fn clamped(mut self) -> Self {
        self.cmd_rate = self.cmd_rate.clamp(10, 125);
        self.timeout_secs = self.timeout_secs.clamp(4, 300);
        self.cmd_resend = self.cmd_resend.min(8);
        self.challenge_interval_ms = self.challenge_interval_ms.clamp(200, 10_000);
        self.challenge_retries = self.challenge_retries.clamp(1, 30);
        self.download_retries = self.download_retries.clamp(1, 20);
        self.download_chunk_timeout_ms = self.download_chunk_timeout_ms.clamp(250, 30_000);
        self
    }

    /// Milliseconds between finalized user commands.
    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / f64::from(self.cmd_rate)
    }

    /// Timeout budget in milliseconds.
    pub fn timeout_ms(&self) -> i64 {
        i64::from(self.timeout_secs) * 1000
    }
}
