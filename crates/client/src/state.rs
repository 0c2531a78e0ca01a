//! Connection state machine.
//!
//! Tracks where the session stands between Disconnected and Active and
//! owns the connect-time bookkeeping: challenge retransmits, the sliding
//! timeout strike counter, and the reconnect fallback chain.

use tracing::{debug, info, warn};
use wiresync_core::{DropError, Millis};

/// Consecutive timeout strikes tolerated before dropping.
const TIMEOUT_STRIKES: u32 = 3;

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// Waiting on an external matchmaking ticket before connecting.
    GettingTicket,
    /// Out-of-band challenge/connect exchange in progress.
    Connecting,
    /// Server accepted; waiting for `serverdata`.
    Handshake,
    /// `serverdata` parsed; waiting for the first valid snapshot.
    Connected,
    /// In the game.
    Active,
}

/// Why the session fell back to Disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Locally requested.
    Requested,
    /// Protocol-level failure.
    Error(String),
    /// No packet for too long.
    TimedOut,
    /// The server refused the connect.
    Rejected(String),
}

/// Connection state plus handshake/timeout bookkeeping.
pub struct ConnectionTracker {
    state: ConnectionState,
    last_packet: Millis,
    strikes: u32,
    challenge_sent: Millis,
    challenge_tries: u32,
    reconnect_chain: Vec<String>,
}

impl ConnectionTracker {
    /// A tracker in Disconnected.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_packet: 0,
            strikes: 0,
            challenge_sent: 0,
            challenge_tries: 0,
            reconnect_chain: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Prime fallback servers tried in order after a disconnect.
    pub fn prime_reconnect(&mut self, chain: Vec<String>) {
        self.reconnect_chain = chain;
    }

    /// Start a connect attempt.
    pub fn begin_connect(&mut self, now: Millis) {
        self.state = ConnectionState::GettingTicket;
        self.last_packet = now;
        self.strikes = 0;
        self.challenge_sent = 0;
        self.challenge_tries = 0;
    }

    /// The external ticket step finished (or was not needed); out-of-band
    /// challenges may now go out.
    pub fn ticket_granted(&mut self) {
        if self.state == ConnectionState::GettingTicket {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Whether a challenge/connect request should go out now; tracks the
    /// retransmit interval and fails once the retry cap is spent.
    pub fn should_send_challenge(
        &mut self,
        now: Millis,
        interval_ms: u32,
        retry_cap: u32,
    ) -> Result<bool, DropError> {
        if self.state != ConnectionState::Connecting {
            return Ok(false);
        }
        if self.challenge_sent != 0 && now - self.challenge_sent < i64::from(interval_ms) {
            return Ok(false);
        }
        if self.challenge_tries >= retry_cap {
            return Err(DropError::TimedOut);
        }
        self.challenge_sent = now;
        self.challenge_tries += 1;
        Ok(true)
    }

    /// Server sent `client_connect`: the channel handshake begins.
    ///
    /// Acceptance packets are connectionless and can arrive duplicated or
    /// reordered; outside Connecting they are stale and ignored.
    pub fn on_accepted(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                info!("server accepted connect");
                self.state = ConnectionState::Handshake;
            }
            other => {
                debug!(state = ?other, "stale acceptance packet ignored");
            }
        }
    }

    /// `serverdata` parsed.
    pub fn on_server_data(&mut self) -> Result<(), DropError> {
        match self.state {
            ConnectionState::Handshake => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            other => Err(DropError::IllegalMessage(format!(
                "serverdata while {other:?}"
            ))),
        }
    }

    /// First valid snapshot applied.
    pub fn on_first_snapshot(&mut self) {
        if self.state == ConnectionState::Connected {
            info!("entering active state");
            self.state = ConnectionState::Active;
        }
    }

    /// A sequenced packet arrived; resets the timeout strikes.
    pub fn note_packet(&mut self, now: Millis) {
        self.last_packet = now;
        self.strikes = 0;
    }

    /// Periodic timeout check. One silent interval is a strike; only a
    /// run of consecutive strikes drops the connection, so a transient
    /// stall does not.
    pub fn check_timeout(&mut self, now: Millis, timeout_ms: i64) -> Result<(), DropError> {
        if !matches!(
            self.state,
            ConnectionState::Handshake | ConnectionState::Connected | ConnectionState::Active
        ) {
            return Ok(());
        }
        if now - self.last_packet < timeout_ms {
            return Ok(());
        }
        self.strikes += 1;
        warn!(strikes = self.strikes, "connection timeout strike");
        if self.strikes > TIMEOUT_STRIKES {
            return Err(DropError::TimedOut);
        }
        // Give the next check a full interval before striking again.
        self.last_packet = now;
        Ok(())
    }

    /// Drop to Disconnected. Returns the next fallback server when the
    /// reconnect chain has one to try.
    pub fn disconnect(&mut self, reason: &DisconnectReason) -> Option<String> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        info!(?reason, "disconnected");
        self.state = ConnectionState::Disconnected;
        self.strikes = 0;
        self.challenge_tries = 0;
        match reason {
            DisconnectReason::Requested => {
                self.reconnect_chain.clear();
                None
            }
            _ => {
                if self.reconnect_chain.is_empty() {
                    None
                } else {
                    Some(self.reconnect_chain.remove(0))
                }
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
