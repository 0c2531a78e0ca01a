//! Server session: the authoritative side of one client connection.
//!
//! Mirrors the client session shape: all per-connection state lives in
//! one struct, driven by `tick`. The handshake answers `getchallenge`
//! and `connect` out-of-band, then the reliable `new`/`enter` commands
//! walk the client through serverdata, baselines and frame streaming.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use wiresync_core::{DropError, Millis, SessionError};
use wiresync_net::oob;
use wiresync_net::protocol::{
    ClientOp, ServerData, ServerDataFlags, ServerOp, COMMAND_BACKUP, PROTOCOL_VERSION,
};
use wiresync_net::reliable;
use wiresync_net::{
    EntityState, Incoming, MessageReader, MessageWriter, NetChannel, NetError, PacketTransport,
    ReliableReceiver, ReliableStream, UserCommand,
};

use crate::snapshot::{SnapshotBuilder, WorldState};

/// Bytes of file data per download chunk.
const DOWNLOAD_CHUNK: usize = 1024;

/// Tunables for a hosting session.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Milliseconds between snapshots, reported in `serverdata`.
    pub snap_frame_time: i16,
    /// Greeting shown to connecting clients.
    pub message: String,
    /// Compress outgoing channel payloads.
    pub compress: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            snap_frame_time: 50,
            message: String::new(),
            compress: true,
        }
    }
}

/// How far the connected client has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// No client, or the handshake has not completed.
    Free,
    /// `connect` accepted; waiting for the reliable `new`.
    Primed,
    /// Serverdata sent; waiting for the reliable `enter`.
    Connected,
    /// Receiving frames.
    Active,
}

/// Something the session surfaced to its embedder this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The handshake completed and the channel opened.
    ClientConnected,
    /// The client entered the game and frames are flowing.
    ClientEntered,
    /// A game-level reliable command arrived from the client.
    Command(String),
    /// A new user command was executed.
    MoveExecuted(UserCommand),
    /// The client was dropped.
    ClientDropped(String),
}

struct OutgoingDownload {
    data: Vec<u8>,
    offset: u64,
}

/// The server half of one connection.
pub struct ServerSession<T: PacketTransport> {
    settings: ServerSettings,
    chan: NetChannel<T>,
    phase: ClientPhase,
    challenge: Option<u32>,
    server_count: i32,
    reliable_out: ReliableStream,
    reliable_in: ReliableReceiver,
    builder: SnapshotBuilder,
    world: WorldState,
    ucmd_head: u64,
    last_cmd: UserCommand,
    frame_ack: Option<u64>,
    files: HashMap<String, Vec<u8>>,
    download: Option<OutgoingDownload>,
    send_serverdata: bool,
    send_baselines: bool,
}

impl<T: PacketTransport> ServerSession<T> {
    /// A session over `transport` with no client yet.
    pub fn new(transport: T, settings: ServerSettings) -> Self {
        let compress = settings.compress;
        Self {
            settings,
            chan: NetChannel::new(transport, compress),
            phase: ClientPhase::Free,
            challenge: None,
            server_count: rand::random(),
            reliable_out: ReliableStream::new(),
            reliable_in: ReliableReceiver::new(),
            builder: SnapshotBuilder::new(),
            world: WorldState::default(),
            ucmd_head: 0,
            last_cmd: UserCommand::ZERO,
            frame_ack: None,
            files: HashMap::new(),
            download: None,
            send_serverdata: false,
            send_baselines: false,
        }
    }

    /// Current client phase.
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Mutable world contents, applied to the next frame.
    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.world
    }

    /// Read-only world contents.
    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// Last user command executed for this client.
    pub fn last_command(&self) -> &UserCommand {
        &self.last_cmd
    }

    /// Count of user commands executed so far.
    pub fn commands_executed(&self) -> u64 {
        self.ucmd_head
    }

    /// Queue a reliable command to the client.
    pub fn send_command(&mut self, text: &str) -> Result<(), DropError> {
        self.reliable_out.add(text).map(|_| ())
    }

    /// Register a file the client may download over the channel.
    pub fn offer_file(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }

    /// Run one server frame: pump the network, then stream a snapshot.
    ///
    /// Drop errors tear the client down and surface as a `ClientDropped`
    /// event; only fatal errors propagate.
    pub fn tick(&mut self, now: Millis) -> Result<Vec<ServerEvent>, SessionError> {
        let mut events = Vec::new();
        match self.tick_inner(now, &mut events) {
            Ok(()) => {}
            Err(SessionError::Drop(err)) => {
                warn!("client dropped: {err}");
                self.drop_client(&err.to_string(), &mut events);
            }
            Err(fatal) => return Err(fatal),
        }
        Ok(events)
    }

    fn tick_inner(
        &mut self,
        now: Millis,
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), SessionError> {
        loop {
            match self.chan.poll().map_err(net_to_session)? {
                None => break,
                Some(Incoming::OutOfBand(text)) => {
                    self.handle_oob(&text, events).map_err(net_to_session)?;
                }
                Some(Incoming::Message(data)) => {
                    self.handle_message(&data, events)
                        .map_err(SessionError::Drop)?;
                }
            }
        }
        self.transmit(now).map_err(net_to_session)?;
        Ok(())
    }

    fn handle_oob(&mut self, text: &str, events: &mut Vec<ServerEvent>) -> Result<(), NetError> {
        for command in oob::split_commands(text) {
            let tokens = oob::tokenize(&command);
            let Some(name) = tokens.first() else { continue };
            match name.as_str() {
                "getchallenge" => {
                    let value = rand::random::<u32>();
                    self.challenge = Some(value);
                    self.chan.send_oob(&format!("challenge {value}"))?;
                }
                "connect" => {
                    self.handle_connect(&tokens, events)?;
                }
                "ping" => {
                    self.chan.send_oob("ack")?;
                }
                "ack" => {}
                other => {
                    debug!(command = other, "unknown out-of-band command ignored");
                }
            }
        }
        Ok(())
    }

    fn handle_connect(
        &mut self,
        tokens: &[String],
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), NetError> {
        let protocol = tokens.get(1).and_then(|t| t.parse::<i32>().ok());
        if protocol != Some(PROTOCOL_VERSION) {
            self.chan
                .send_oob(&format!("reject \"wrong protocol, server runs {PROTOCOL_VERSION}\""))?;
            return Ok(());
        }
        let challenge = tokens.get(2).and_then(|t| t.parse::<u32>().ok());
        if challenge.is_none() || challenge != self.challenge {
            self.chan.send_oob("reject \"bad challenge\"")?;
            return Ok(());
        }

        // A resent connect while the accept is in flight gets the same
        // answer; an established client is not torn down by it.
        if self.phase == ClientPhase::Free {
            self.reset_client();
            self.phase = ClientPhase::Primed;
            info!("client accepted");
            events.push(ServerEvent::ClientConnected);
        }
        self.chan.send_oob("client_connect")?;
        Ok(())
    }

    fn handle_message(
        &mut self,
        data: &[u8],
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), DropError> {
        if self.phase == ClientPhase::Free {
            debug!("sequenced packet without a connection ignored");
            return Ok(());
        }
        let mut r = MessageReader::new(data);
        while r.remaining() > 0 {
            let op = ClientOp::try_from(r.read_u8()?)?;
            match op {
                ClientOp::Nop => {}
                ClientOp::Command => {
                    let (seq, text) = reliable::read_command(&mut r)?;
                    if let Some(text) = self.reliable_in.receive(seq, text)? {
                        self.execute_command(&text, events)?;
                    }
                }
                ClientOp::Move => self.parse_move(&mut r, events)?,
            }
        }
        Ok(())
    }

    fn parse_move(
        &mut self,
        r: &mut MessageReader,
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), DropError> {
        let last_frame = r.read_u64()?;
        self.frame_ack = (last_frame != 0).then_some(last_frame);
        self.reliable_out.acknowledge(r.read_u64()?)?;

        let head = r.read_u64()?;
        let count = r.read_u8()? as u64;
        if count > head || count > COMMAND_BACKUP as u64 {
            return Err(DropError::IllegalMessage(format!(
                "bad move window: {count} commands up to {head}"
            )));
        }

        let mut from = UserCommand::ZERO;
        for i in 0..count {
            let cmd = UserCommand::read_delta(&from, r)?;
            let seq = head - count + i + 1;
            if seq > self.ucmd_head {
                self.ucmd_head = seq;
                self.last_cmd = cmd;
                events.push(ServerEvent::MoveExecuted(cmd));
            }
            from = cmd;
        }
        Ok(())
    }

    fn execute_command(
        &mut self,
        text: &str,
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), DropError> {
        let tokens = oob::tokenize(text);
        let Some(name) = tokens.first() else {
            return Ok(());
        };
        match name.as_str() {
            "new" => {
                // Resending serverdata for a duplicate `new` is harmless.
                if matches!(self.phase, ClientPhase::Primed | ClientPhase::Connected) {
                    self.send_serverdata = true;
                    self.phase = ClientPhase::Connected;
                }
            }
            "enter" => {
                if self.phase == ClientPhase::Connected {
                    self.builder.set_baselines(&self.world);
                    self.send_baselines = true;
                    self.phase = ClientPhase::Active;
                    info!("client entered the game");
                    events.push(ServerEvent::ClientEntered);
                }
            }
            "download" => {
                let name = tokens.get(1).cloned().unwrap_or_default();
                self.begin_download(&name)?;
            }
            "nextdl" => {
                let offset = tokens.get(1).and_then(|t| t.parse::<u64>().ok());
                match (offset, self.download.as_mut()) {
                    (Some(offset), Some(dl)) if offset <= dl.data.len() as u64 => {
                        debug!(offset, "download rewound");
                        dl.offset = offset;
                    }
                    _ => debug!("nextdl without a matching transfer ignored"),
                }
            }
            "disconnect" => {
                return Err(DropError::Rejected("client disconnected".into()));
            }
            _ => events.push(ServerEvent::Command(text.to_string())),
        }
        Ok(())
    }

    fn begin_download(&mut self, name: &str) -> Result<(), DropError> {
        match self.files.get(name) {
            Some(data) => {
                let size = data.len() as u64;
                let crc = crc32fast::hash(data);
                info!(name, size, "starting channel download");
                self.download = Some(OutgoingDownload {
                    data: data.clone(),
                    offset: 0,
                });
                self.reliable_out.add(&format!("dlstart {size} {crc}"))?;
            }
            None => {
                self.reliable_out
                    .add(&format!("print \"no such file: {name}\""))?;
            }
        }
        Ok(())
    }

    /// Assemble and send this tick's channel message.
    fn transmit(&mut self, now: Millis) -> Result<(), NetError> {
        if !matches!(self.phase, ClientPhase::Connected | ClientPhase::Active) {
            return Ok(());
        }

        let mut w = MessageWriter::new();
        self.reliable_out
            .write_pending(&mut w, ServerOp::ServerCommand as u8, false);

        if std::mem::take(&mut self.send_serverdata) {
            w.write_u8(ServerOp::ServerData as u8);
            self.server_data().write(&mut w);
        }
        if std::mem::take(&mut self.send_baselines) {
            for entity in &self.world.entities {
                w.write_u8(ServerOp::SpawnBaseline as u8);
                w.write_u16(entity.number);
                let from = EntityState {
                    number: entity.number,
                    ..Default::default()
                };
                entity.write_delta(&from, &mut w);
            }
        }

        w.write_u8(ServerOp::CommandAck as u8);
        w.write_u64(self.reliable_in.last_executed());

        self.write_download_chunk(&mut w);

        if self.phase == ClientPhase::Active {
            w.write_u8(ServerOp::Frame as u8);
            self.builder
                .build(&self.world, now, self.ucmd_head, self.frame_ack, &mut w);
        }

        self.chan.send_message(w.as_bytes())
    }

    fn write_download_chunk(&mut self, w: &mut MessageWriter) {
        let Some(dl) = self.download.as_mut() else {
            return;
        };
        let remaining = dl.data.len() - dl.offset as usize;
        let len = remaining.min(DOWNLOAD_CHUNK);
        w.write_u8(ServerOp::Download as u8);
        w.write_u64(dl.offset);
        w.write_u16(len as u16);
        w.write_data(&dl.data[dl.offset as usize..dl.offset as usize + len]);
        dl.offset += len as u64;
        if dl.offset as usize >= dl.data.len() {
            debug!("download fully sent");
            self.download = None;
        }
    }

    fn server_data(&self) -> ServerData {
        ServerData {
            protocol: PROTOCOL_VERSION,
            server_count: self.server_count,
            snap_frame_time: self.settings.snap_frame_time,
            player_num: 0,
            message: self.settings.message.clone(),
            flags: ServerDataFlags::empty(),
            http: None,
            pure_files: Vec::new(),
        }
    }

    /// Tear the client down; the slot becomes free for a new handshake.
    pub fn drop_client(&mut self, reason: &str, events: &mut Vec<ServerEvent>) {
        if self.phase == ClientPhase::Free {
            return;
        }
        info!(reason, "dropping client");
        if let Err(err) = self.chan.send_oob(&format!("print \"{reason}\"")) {
            debug!("drop notice not sent: {err}");
        }
        self.reset_client();
        self.phase = ClientPhase::Free;
        events.push(ServerEvent::ClientDropped(reason.to_string()));
    }

    fn reset_client(&mut self) {
        self.reliable_out.reset();
        self.reliable_in.reset();
        self.builder = SnapshotBuilder::new();
        self.ucmd_head = 0;
        self.last_cmd = UserCommand::ZERO;
        self.frame_ack = None;
        self.download = None;
        self.send_serverdata = false;
        self.send_baselines = false;
    }
}

fn net_to_session(err: NetError) -> SessionError {
    match err {
        NetError::Drop(drop) => SessionError::Drop(drop),
        NetError::Io(io) => SessionError::Fatal(io.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiresync_net::{loopback_pair, LoopbackTransport};

    fn harness() -> (ServerSession<LoopbackTransport>, NetChannel<LoopbackTransport>) {
        let (near, far) = loopback_pair();
        let server = ServerSession::new(near, ServerSettings::default());
        (server, NetChannel::new(far, false))
    }

    fn expect_oob(peer: &mut NetChannel<LoopbackTransport>) -> String {
        loop {
            match peer.poll().unwrap() {
                Some(Incoming::OutOfBand(text)) => return text,
                Some(Incoming::Message(_)) => continue,
                None => panic!("expected an out-of-band reply"),
            }
        }
    }

    fn do_handshake(
        server: &mut ServerSession<LoopbackTransport>,
        peer: &mut NetChannel<LoopbackTransport>,
    ) {
        peer.send_oob("getchallenge").unwrap();
        server.tick(0).unwrap();
        let reply = expect_oob(peer);
        let challenge: u32 = reply.strip_prefix("challenge ").unwrap().parse().unwrap();

        peer.send_oob(&format!("connect {PROTOCOL_VERSION} {challenge}"))
            .unwrap();
        let events = server.tick(0).unwrap();
        assert!(events.contains(&ServerEvent::ClientConnected));
        assert_eq!(expect_oob(peer), "client_connect");
    }

    fn send_reliable(peer: &mut NetChannel<LoopbackTransport>, seq: u64, text: &str) {
        let mut w = MessageWriter::new();
        w.write_u8(ClientOp::Command as u8);
        w.write_u64(seq);
        w.write_string(text);
        peer.send_message(w.as_bytes()).unwrap();
    }

    #[test]
    fn test_challenge_then_connect_accepts() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);
        assert_eq!(server.phase(), ClientPhase::Primed);
    }

    #[test]
    fn test_wrong_protocol_is_rejected() {
        let (mut server, mut peer) = harness();
        peer.send_oob("getchallenge").unwrap();
        server.tick(0).unwrap();
        let reply = expect_oob(&mut peer);
        let challenge: u32 = reply.strip_prefix("challenge ").unwrap().parse().unwrap();

        peer.send_oob(&format!("connect 9 {challenge}")).unwrap();
        server.tick(0).unwrap();
        assert!(expect_oob(&mut peer).starts_with("reject"));
        assert_eq!(server.phase(), ClientPhase::Free);
    }

    #[test]
    fn test_stale_challenge_is_rejected() {
        let (mut server, mut peer) = harness();
        peer.send_oob(&format!("connect {PROTOCOL_VERSION} 12345"))
            .unwrap();
        server.tick(0).unwrap();
        assert!(expect_oob(&mut peer).starts_with("reject"));
    }

    #[test]
    fn test_new_triggers_serverdata() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);

        send_reliable(&mut peer, 1, "new");
        server.tick(0).unwrap();
        assert_eq!(server.phase(), ClientPhase::Connected);

        let Some(Incoming::Message(data)) = peer.poll().unwrap() else {
            panic!("expected a channel message");
        };
        let mut r = MessageReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), ServerOp::ServerData as u8);
        let sd = ServerData::read(&mut r).unwrap();
        assert_eq!(sd.protocol, PROTOCOL_VERSION);
        // The `new` itself is acknowledged in the same message.
        assert_eq!(r.read_u8().unwrap(), ServerOp::CommandAck as u8);
        assert_eq!(r.read_u64().unwrap(), 1);
    }

    #[test]
    fn test_enter_streams_baselines_then_frames() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);
        server.world_mut().set_entity(EntityState {
            number: 4,
            model_index: 2,
            ..Default::default()
        });

        send_reliable(&mut peer, 1, "new");
        server.tick(0).unwrap();
        peer.poll().unwrap();
        send_reliable(&mut peer, 2, "enter");
        let events = server.tick(50).unwrap();
        assert!(events.contains(&ServerEvent::ClientEntered));

        let Some(Incoming::Message(data)) = peer.poll().unwrap() else {
            panic!("expected a channel message");
        };
        let mut r = MessageReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), ServerOp::SpawnBaseline as u8);
        assert_eq!(r.read_u16().unwrap(), 4);
    }

    #[test]
    fn test_move_window_executes_new_commands_once() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);
        send_reliable(&mut peer, 1, "new");
        server.tick(0).unwrap();

        let mut cmds = Vec::new();
        for i in 0..3i64 {
            let mut cmd = UserCommand::ZERO;
            cmd.server_time = 100 + i * 16;
            cmd.msec = 16;
            cmds.push(cmd);
        }
        let window = |w: &mut MessageWriter, head: u64, cmds: &[UserCommand]| {
            w.write_u8(ClientOp::Move as u8);
            w.write_u64(0);
            w.write_u64(0);
            w.write_u64(head);
            w.write_u8(cmds.len() as u8);
            let mut from = UserCommand::ZERO;
            for cmd in cmds {
                cmd.write_delta(&from, w);
                from = *cmd;
            }
        };

        let mut w = MessageWriter::new();
        window(&mut w, 2, &cmds[..2]);
        peer.send_message(w.as_bytes()).unwrap();
        let events = server.tick(0).unwrap();
        let executed = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::MoveExecuted(_)))
            .count();
        assert_eq!(executed, 2);
        assert_eq!(server.commands_executed(), 2);

        // Overlapping resend window: only the unseen command runs.
        let mut w = MessageWriter::new();
        window(&mut w, 3, &cmds);
        peer.send_message(w.as_bytes()).unwrap();
        let events = server.tick(0).unwrap();
        let executed = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::MoveExecuted(_)))
            .count();
        assert_eq!(executed, 1);
        assert_eq!(server.last_command().server_time, 132);
    }

    #[test]
    fn test_download_is_chunked_with_start_notice() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);
        let payload = vec![7u8; DOWNLOAD_CHUNK + 100];
        server.offer_file("pack.pak", payload.clone());
        send_reliable(&mut peer, 1, "new");
        server.tick(0).unwrap();
        peer.poll().unwrap();

        send_reliable(&mut peer, 2, "download \"pack.pak\"");
        server.tick(0).unwrap();
        let Some(Incoming::Message(data)) = peer.poll().unwrap() else {
            panic!("expected a channel message");
        };
        let mut r = MessageReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), ServerOp::ServerCommand as u8);
        let (_, text) = reliable::read_command(&mut r).unwrap();
        assert_eq!(
            text,
            format!("dlstart {} {}", payload.len(), crc32fast::hash(&payload))
        );
        assert_eq!(r.read_u8().unwrap(), ServerOp::CommandAck as u8);
        r.read_u64().unwrap();
        assert_eq!(r.read_u8().unwrap(), ServerOp::Download as u8);
        assert_eq!(r.read_u64().unwrap(), 0);
        assert_eq!(r.read_u16().unwrap() as usize, DOWNLOAD_CHUNK);

        // Second tick carries the tail chunk.
        server.tick(0).unwrap();
        let Some(Incoming::Message(data)) = peer.poll().unwrap() else {
            panic!("expected a channel message");
        };
        let mut r = MessageReader::new(&data);
        // dlstart resends until acknowledged.
        assert_eq!(r.read_u8().unwrap(), ServerOp::ServerCommand as u8);
        reliable::read_command(&mut r).unwrap();
        assert_eq!(r.read_u8().unwrap(), ServerOp::CommandAck as u8);
        r.read_u64().unwrap();
        assert_eq!(r.read_u8().unwrap(), ServerOp::Download as u8);
        assert_eq!(r.read_u64().unwrap() as usize, DOWNLOAD_CHUNK);
        assert_eq!(r.read_u16().unwrap(), 100);
    }

    #[test]
    fn test_reliable_gap_drops_client() {
        let (mut server, mut peer) = harness();
        do_handshake(&mut server, &mut peer);
        send_reliable(&mut peer, 5, "new");
        let events = server.tick(0).unwrap();
        assert!(matches!(events.last(), Some(ServerEvent::ClientDropped(_))));
        assert_eq!(server.phase(), ClientPhase::Free);
    }
}
