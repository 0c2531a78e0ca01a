//! Client session: one struct owning every per-connection subsystem.
//!
//! All connection state lives here and is reset on every disconnect, so a
//! reconnect starts from a clean slate. The session is driven by `tick`,
//! called once per client frame with the current clock reading.

use std::path::PathBuf;
use tracing::{info, warn};
use wiresync_core::{DropError, Millis, SessionError};
use wiresync_net::oob;
use wiresync_net::protocol::{ClientOp, ServerData, ServerDataFlags, PROTOCOL_VERSION};
use wiresync_net::{
    Incoming, MessageWriter, NetChannel, NetError, PacketTransport, ReliableReceiver,
    ReliableStream,
};

use crate::demo::DemoRecorder;
use crate::download::{DownloadManager, DownloadPurpose, WebTransfer};
use crate::input::{InputPipeline, InputSample};
use crate::parse;
use crate::settings::ClientSettings;
use crate::snapshot::SnapshotTracker;
use crate::state::{ConnectionState, ConnectionTracker, DisconnectReason};
use crate::time::TimeReconciler;

/// Something the session surfaced to its embedder this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A game-level reliable command arrived.
    Command(String),
    /// A print from the server.
    Print(String),
    /// A snapshot was applied.
    SnapshotApplied(u64),
    /// An in-flight download was abandoned. The connection stays up.
    DownloadFailed(String),
    /// The session fell back to Disconnected.
    Disconnected(DisconnectReason),
    /// The reconnect chain has a fallback server to try. The embedder
    /// dials it and hands the new transport to `rebind`.
    ReconnectTo(String),
}

/// One client's connection to one server.
pub struct ClientSession<T: PacketTransport> {
    pub(crate) settings: ClientSettings,
    pub(crate) address: String,
    pub(crate) state: ConnectionTracker,
    pub(crate) chan: NetChannel<T>,
    pub(crate) reliable_out: ReliableStream,
    pub(crate) reliable_in: ReliableReceiver,
    pub(crate) input: InputPipeline,
    pub(crate) snapshots: SnapshotTracker,
    pub(crate) time: TimeReconciler,
    pub(crate) download: DownloadManager,
    pub(crate) server_data: Option<ServerData>,
    pub(crate) recorder: Option<DemoRecorder>,
    pub(crate) web: Option<Box<dyn WebTransfer>>,
    pub(crate) challenge: Option<u32>,
    pub(crate) last_frame: u64,
    last_tick: Option<Millis>,
    disconnecting: bool,
}

impl<T: PacketTransport> ClientSession<T> {
    /// A session over `transport`, not yet connecting.
    pub fn new(transport: T, address: &str, settings: ClientSettings) -> Self {
        let compress = settings.compress;
        let download = DownloadManager::new(
            PathBuf::from(&settings.download_dir),
            settings.download_retries,
            settings.download_chunk_timeout_ms,
        );
        Self {
            settings,
            address: address.to_string(),
            state: ConnectionTracker::new(),
            chan: NetChannel::new(transport, compress),
            reliable_out: ReliableStream::new(),
            reliable_in: ReliableReceiver::new(),
            input: InputPipeline::new(0.0, 0),
            snapshots: SnapshotTracker::new(),
            time: TimeReconciler::new(),
            download,
            server_data: None,
            recorder: None,
            web: None,
            challenge: None,
            last_frame: 0,
            last_tick: None,
            disconnecting: false,
        }
        .with_fresh_input()
    }

    fn with_fresh_input(mut self) -> Self {
        self.input = InputPipeline::new(
            self.settings.frame_interval_ms(),
            self.settings.cmd_resend,
        );
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// The most recent applied snapshot tracker.
    pub fn snapshots(&self) -> &SnapshotTracker {
        &self.snapshots
    }

    /// Reconciled server time for a client clock reading.
    pub fn server_time(&self, now: Millis) -> Millis {
        self.time.server_time(now)
    }

    /// Download progress and results.
    pub fn downloads(&self) -> &DownloadManager {
        &self.download
    }

    /// Install the external web fetcher used for HTTP downloads.
    pub fn set_web_transfer(&mut self, web: Box<dyn WebTransfer>) {
        self.web = Some(web);
    }

    /// Prime fallback servers tried after an involuntary disconnect.
    pub fn prime_reconnect(&mut self, chain: Vec<String>) {
        self.state.prime_reconnect(chain);
    }

    /// Start connecting.
    pub fn connect(&mut self, now: Millis) {
        info!(address = %self.address, "connecting");
        self.reset_connection_state();
        self.state.begin_connect(now);
        // No external matchmaking wired in: the ticket step is immediate.
        self.state.ticket_granted();
    }

    /// Queue a reliable command to the server.
    pub fn add_command(&mut self, text: &str) -> Result<(), DropError> {
        self.reliable_out.add(text).map(|_| ())
    }

    /// Vet and request a download from the server.
    pub fn request_download(
        &mut self,
        name: &str,
        purpose: DownloadPurpose,
    ) -> Result<(), SessionError> {
        self.download
            .request(name, purpose)
            .map_err(|err| SessionError::Fatal(err.into()))?;
        self.add_command(&format!("download \"{name}\""))
            .map_err(SessionError::Drop)
    }

    /// Start recording received messages to a demo file.
    pub fn start_recording(&mut self, path: &std::path::Path, now: Millis) -> anyhow::Result<()> {
        let server_data = self
            .server_data
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        self.recorder = Some(DemoRecorder::create(path, &self.address, server_data, now)?);
        Ok(())
    }

    /// Stop and flush demo recording.
    pub fn stop_recording(&mut self) -> anyhow::Result<()> {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.flush()?;
        }
        Ok(())
    }

    /// Run one client frame: pump the network, advance input, transmit.
    ///
    /// Drop errors are absorbed here — they tear the connection down and
    /// surface as a `Disconnected` event; only fatal errors propagate.
    pub fn tick(
        &mut self,
        now: Millis,
        sample: Option<&InputSample>,
    ) -> Result<Vec<ClientEvent>, SessionError> {
        let elapsed = match self.last_tick.replace(now) {
            Some(prev) => (now - prev).max(0) as f64,
            None => 0.0,
        };

        let mut events = Vec::new();
        match self.tick_inner(now, elapsed, sample, &mut events) {
            Ok(()) => {}
            Err(SessionError::Drop(err)) => {
                warn!("connection dropped: {err}");
                self.drop_connection(DisconnectReason::Error(err.to_string()), &mut events);
            }
            Err(fatal) => return Err(fatal),
        }

        // A disconnect that arrived mid-download finishes now that the
        // transfer has wound down.
        if self.download.take_pending_disconnect() {
            self.drop_connection(DisconnectReason::Requested, &mut events);
        }

        Ok(events)
    }

    fn tick_inner(
        &mut self,
        now: Millis,
        elapsed: f64,
        sample: Option<&InputSample>,
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), SessionError> {
        self.send_handshake_requests(now)?;
        self.pump_network(now, events)?;

        if let Some(sample) = sample {
            self.input.sample(sample);
        }
        self.time.tick();
        if matches!(
            self.state.state(),
            ConnectionState::Connected | ConnectionState::Active
        ) {
            self.input.advance(elapsed, self.time.server_time(now));
        }

        self.transmit(now).map_err(net_to_session)?;

        self.state
            .check_timeout(now, self.settings.timeout_ms())
            .map_err(SessionError::Drop)?;
        // Download failures abandon the transfer, never the connection.
        match self.download.check_timeout(now) {
            Ok(true) => {
                let offset = self.download.next_offset();
                self.add_command(&format!("nextdl {offset}"))
                    .map_err(SessionError::Drop)?;
            }
            Ok(false) => {}
            Err(err) => {
                warn!("download abandoned: {err}");
                events.push(ClientEvent::DownloadFailed(err.to_string()));
            }
        }
        if let Some(web) = self.web.as_mut() {
            if let Err(err) = self.download.pump_web(web.as_mut()) {
                warn!("web download abandoned: {err}");
                self.download.cancel();
                events.push(ClientEvent::DownloadFailed(err.to_string()));
            }
        }
        Ok(())
    }

    /// Retransmit `getchallenge` (or `connect`, once challenged) while
    /// Connecting, on the configured interval with a bounded retry count.
    fn send_handshake_requests(&mut self, now: Millis) -> Result<(), SessionError> {
        let due = self
            .state
            .should_send_challenge(
                now,
                self.settings.challenge_interval_ms,
                self.settings.challenge_retries,
            )
            .map_err(SessionError::Drop)?;
        if !due {
            return Ok(());
        }
        let request = match self.challenge {
            None => "getchallenge".to_string(),
            Some(challenge) => format!("connect {PROTOCOL_VERSION} {challenge}"),
        };
        self.chan.send_oob(&request).map_err(net_to_session)?;
        Ok(())
    }

    fn pump_network(
        &mut self,
        now: Millis,
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), SessionError> {
        loop {
            let incoming = self.chan.poll().map_err(net_to_session)?;
            match incoming {
                None => return Ok(()),
                Some(Incoming::OutOfBand(text)) => {
                    self.handle_oob(&text, events).map_err(SessionError::Drop)?;
                }
                Some(Incoming::Message(data)) => {
                    self.state.note_packet(now);
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder
                            .record(now, &data)
                            .map_err(SessionError::Fatal)?;
                    }
                    parse::server_message(self, &data, now, events)?;
                }
            }
        }
    }

    fn handle_oob(&mut self, text: &str, events: &mut Vec<ClientEvent>) -> Result<(), DropError> {
        for command in oob::split_commands(text) {
            let tokens = oob::tokenize(&command);
            let Some(name) = tokens.first() else { continue };
            match name.as_str() {
                "challenge" => {
                    let value = tokens
                        .get(1)
                        .and_then(|t| t.parse::<u32>().ok())
                        .ok_or_else(|| {
                            DropError::IllegalMessage("malformed challenge".into())
                        })?;
                    if self.state.state() == ConnectionState::Connecting {
                        self.challenge = Some(value);
                        // Answer without waiting for the next interval.
                        let connect = format!("connect {PROTOCOL_VERSION} {value}");
                        if let Err(err) = self.chan.send_oob(&connect) {
                            warn!("connect send failed: {err}");
                        }
                    }
                }
                "client_connect" => {
                    let was = self.state.state();
                    self.state.on_accepted();
                    if was == ConnectionState::Connecting {
                        // First reliable command opens the channel handshake.
                        self.reliable_out.add("new")?;
                        events.push(ClientEvent::StateChanged(ConnectionState::Handshake));
                    }
                }
                "reject" => {
                    let reason = tokens.get(1).cloned().unwrap_or_default();
                    return Err(DropError::Rejected(reason));
                }
                "print" => {
                    if let Some(message) = tokens.get(1) {
                        events.push(ClientEvent::Print(message.clone()));
                    }
                }
                "echo" => {
                    if let Some(payload) = tokens.get(1) {
                        if let Err(err) = self.chan.send_oob(&format!("echo \"{payload}\"")) {
                            warn!("echo reply failed: {err}");
                        }
                    }
                }
                "ping" => {
                    if let Err(err) = self.chan.send_oob("ack") {
                        warn!("ack reply failed: {err}");
                    }
                }
                "ack" => {}
                other => {
                    warn!(command = other, "unknown out-of-band command ignored");
                }
            }
        }
        Ok(())
    }

    /// Send this tick's channel message: pending reliable commands, plus
    /// the move payload once connected.
    fn transmit(&mut self, _now: Millis) -> Result<(), NetError> {
        let state = self.state.state();
        if !matches!(
            state,
            ConnectionState::Handshake | ConnectionState::Connected | ConnectionState::Active
        ) {
            return Ok(());
        }

        let reliable_transport = self
            .server_data
            .as_ref()
            .map(|d| d.flags.contains(ServerDataFlags::RELIABLE))
            .unwrap_or(false);

        let mut w = MessageWriter::new();
        self.reliable_out
            .write_pending(&mut w, ClientOp::Command as u8, reliable_transport);

        if matches!(state, ConnectionState::Connected | ConnectionState::Active) {
            w.write_u8(ClientOp::Move as u8);
            w.write_u64(self.last_frame);
            w.write_u64(self.reliable_in.last_executed());
            self.input.write_window(&mut w);
        }

        if !w.is_empty() {
            self.chan.send_message(w.as_bytes())?;
        }
        Ok(())
    }

    /// Locally requested disconnect. Reentrancy-safe; while a download is
    /// in flight the teardown is deferred to the end of the next tick.
    pub fn disconnect(&mut self) -> Option<ClientEvent> {
        if self.download.in_flight() {
            self.download.defer_disconnect();
            self.download.cancel();
            return None;
        }
        let mut events = Vec::new();
        self.drop_connection(DisconnectReason::Requested, &mut events);
        events.pop()
    }

    fn drop_connection(&mut self, reason: DisconnectReason, events: &mut Vec<ClientEvent>) {
        if self.disconnecting {
            return;
        }
        self.disconnecting = true;

        let next = self.state.disconnect(&reason);
        self.reset_connection_state();
        events.push(ClientEvent::Disconnected(reason));

        // The transport is still dialed at the dead server, so the
        // session cannot restart on its own. The embedder dials the
        // fallback and hands the fresh transport to `rebind`.
        if let Some(address) = next {
            info!(address = %address, "fallback server available");
            events.push(ClientEvent::ReconnectTo(address));
        }
        self.disconnecting = false;
    }

    /// Replace the transport after a `ReconnectTo` event and start
    /// connecting to `address` over it.
    pub fn rebind(&mut self, transport: T, address: &str, now: Millis) {
        self.chan = NetChannel::new(transport, self.settings.compress);
        self.address = address.to_string();
        self.last_tick = Some(now);
        self.connect(now);
    }

    fn reset_connection_state(&mut self) {
        self.chan.reset();
        self.reliable_out.reset();
        self.reliable_in.reset();
        self.input.reset();
        self.snapshots.reset();
        self.time.reset();
        self.download.reset();
        self.server_data = None;
        self.challenge = None;
        self.last_frame = 0;
        if let Some(mut recorder) = self.recorder.take() {
            let _ = recorder.flush();
        }
    }
}

fn net_to_session(err: NetError) -> SessionError {
    match err {
        NetError::Drop(drop) => SessionError::Drop(drop),
        NetError::Io(io) => SessionError::Fatal(io.into()),
    }
}
