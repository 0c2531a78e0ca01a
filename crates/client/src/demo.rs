//! Demo recording and playback.
//!
//! A demo is a JSONL log of everything the server sent over the channel,
//! plus the connect metadata, which is enough to re-feed the message
//! parser deterministically. Playback is cursor-based; a jump replays
//! from the start up to the requested frame.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use wiresync_net::protocol::ServerData;

/// One demo log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DemoEntry {
    /// Connect metadata captured when recording started.
    Header {
        /// Server address the recording client was connected to.
        address: String,
        /// Protocol version in effect.
        protocol: i32,
        /// Client wall-clock milliseconds at the first message.
        start_ms: i64,
    },
    /// One server message, exactly as delivered by the channel.
    Message {
        /// Client wall-clock milliseconds at receipt.
        at_ms: i64,
        /// Raw message payload.
        data: Vec<u8>,
    },
}

/// Writes received server messages to a JSONL demo file.
pub struct DemoRecorder {
    writer: BufWriter<File>,
    messages_written: u64,
}

impl DemoRecorder {
    /// Start a recording, writing the header entry immediately.
    pub fn create(
        path: impl AsRef<Path>,
        address: &str,
        server_data: &ServerData,
        start_ms: i64,
    ) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create demo file: {:?}", path.as_ref()))?;
        let mut recorder = Self {
            writer: BufWriter::new(file),
            messages_written: 0,
        };
        recorder.write_entry(&DemoEntry::Header {
            address: address.to_string(),
            protocol: server_data.protocol,
            start_ms,
        })?;
        Ok(recorder)
    }

    /// Record one server message.
    pub fn record(&mut self, at_ms: i64, data: &[u8]) -> Result<()> {
        self.write_entry(&DemoEntry::Message {
            at_ms,
            data: data.to_vec(),
        })?;
        self.messages_written += 1;
        Ok(())
    }

    fn write_entry(&mut self, entry: &DemoEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        writeln!(&mut self.writer)?;
        Ok(())
    }

    /// Flush buffered writes.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Messages recorded so far.
    pub fn messages_written(&self) -> u64 {
        self.messages_written
    }
}

/// Plays a demo file back through the message parser.
pub struct DemoPlayer {
    header: DemoEntry,
    messages: Vec<(i64, Vec<u8>)>,
    cursor: usize,
    paused: bool,
}

impl DemoPlayer {
    /// Load a demo from a JSONL file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open demo file: {:?}", path.as_ref()))?;
        let reader = BufReader::new(file);

        let mut header = None;
        let mut messages = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DemoEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse line {}", line_num + 1))?;
            match entry {
                DemoEntry::Header { .. } => header = Some(entry),
                DemoEntry::Message { at_ms, data } => messages.push((at_ms, data)),
            }
        }

        Ok(Self {
            header: header.context("demo file has no header entry")?,
            messages,
            cursor: 0,
            paused: false,
        })
    }

    /// The header entry.
    pub fn header(&self) -> &DemoEntry {
        &self.header
    }

    /// Next message due at or before `at_ms`, if playback is running.
    pub fn next_message(&mut self, at_ms: i64) -> Option<&[u8]> {
        if self.paused || self.cursor >= self.messages.len() {
            return None;
        }
        let index = self.cursor;
        if self.messages[index].0 > at_ms {
            return None;
        }
        self.cursor += 1;
        Some(&self.messages[index].1)
    }

    /// Pause or resume playback.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether playback is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Rewind to the start. A jump target is reached by re-feeding
    /// messages from here, since each one deltas against its predecessors.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Messages not yet played.
    pub fn remaining(&self) -> usize {
        self.messages.len() - self.cursor
    }

    /// Whether every message has been played.
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record_demo(path: &Path) {
        let server_data = ServerData {
            protocol: 23,
            ..Default::default()
        };
        let mut recorder = DemoRecorder::create(path, "server:44400", &server_data, 0).unwrap();
        recorder.record(50, &[1, 2, 3]).unwrap();
        recorder.record(100, &[4, 5]).unwrap();
        recorder.record(150, &[6]).unwrap();
        recorder.flush().unwrap();
    }

    #[test]
    fn test_roundtrip_preserves_messages_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("match.demo");
        record_demo(&path);

        let mut player = DemoPlayer::load(&path).unwrap();
        assert_eq!(player.remaining(), 3);
        assert_eq!(player.next_message(50).unwrap(), &[1, 2, 3]);
        assert_eq!(player.next_message(200).unwrap(), &[4, 5]);
        assert_eq!(player.next_message(200).unwrap(), &[6]);
        assert!(player.is_finished());
    }

    #[test]
    fn test_messages_wait_for_their_timestamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("match.demo");
        record_demo(&path);

        let mut player = DemoPlayer::load(&path).unwrap();
        assert!(player.next_message(10).is_none());
        assert!(player.next_message(50).is_some());
        assert!(player.next_message(60).is_none());
    }

    #[test]
    fn test_pause_holds_playback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("match.demo");
        record_demo(&path);

        let mut player = DemoPlayer::load(&path).unwrap();
        player.set_paused(true);
        assert!(player.next_message(1000).is_none());
        player.set_paused(false);
        assert!(player.next_message(1000).is_some());
    }

    #[test]
    fn test_rewind_replays_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("match.demo");
        record_demo(&path);

        let mut player = DemoPlayer::load(&path).unwrap();
        while player.next_message(i64::MAX).is_some() {}
        player.rewind();
        assert_eq!(player.next_message(i64::MAX).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_headerless_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.demo");
        std::fs::write(
            &path,
            "{\"type\":\"Message\",\"at_ms\":1,\"data\":[1]}\n",
        )
        .unwrap();
        assert!(DemoPlayer::load(&path).is_err());
    }
}
