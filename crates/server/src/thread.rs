//! Embedded server thread.
//!
//! Local hosting runs the server session on its own thread, ticking on a
//! fixed interval. The client thread never touches the session directly;
//! every mutation crosses through the command pipe and executes at the
//! top of the next server tick.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use tracing::{error, info, warn};
use wiresync_core::{pipe, Clock, Pump, SessionError};
use wiresync_net::blocks::{GameStateBlock, PlayerState, ScoreboardBlock};
use wiresync_net::{EntityState, LoopbackTransport};

use crate::session::{ServerEvent, ServerSession, ServerSettings};

/// A mutation applied to the hosted world at the next server tick.
pub enum ServerCommand {
    /// Insert or replace an entity.
    SetEntity(EntityState),
    /// Remove an entity by slot.
    RemoveEntity(u16),
    /// Replace the player-state list.
    SetPlayers(Vec<PlayerState>),
    /// Replace the match-level state block.
    SetGameState(GameStateBlock),
    /// Replace the scoreboard block.
    SetScoreboard(ScoreboardBlock),
    /// Queue a reliable command to the client.
    Send(String),
    /// Register a downloadable file.
    OfferFile(String, Vec<u8>),
}

/// Handle to a running embedded server.
///
/// Two pipes, one per direction: commands go in through `sender`,
/// session events come back out through `pump_events`.
pub struct ServerThread {
    tx: pipe::PipeSender<ServerCommand>,
    events: pipe::PipeReceiver<ServerEvent>,
    handle: JoinHandle<()>,
}

impl ServerThread {
    /// Start a server over `transport`, ticking every `tick_ms`.
    pub fn spawn(
        transport: LoopbackTransport,
        settings: ServerSettings,
        tick_ms: u64,
    ) -> anyhow::Result<Self> {
        let (tx, mut rx) = pipe::channel();
        let (event_tx, events) = pipe::channel();
        let handle = thread::Builder::new()
            .name("server".into())
            .spawn(move || {
                let clock = Clock::new();
                let mut session = ServerSession::new(transport, settings);
                info!("server thread up");
                loop {
                    if rx.pump(|cmd| apply(&mut session, cmd)) == Pump::Terminated {
                        break;
                    }
                    match session.tick(clock.now()) {
                        Ok(tick_events) => {
                            for event in tick_events {
                                // A gone receiver just means nobody is
                                // listening any more.
                                event_tx.send(event);
                            }
                        }
                        Err(SessionError::Fatal(err)) => {
                            error!("server tick failed: {err:#}");
                            break;
                        }
                        // Drop errors are absorbed inside tick; this arm
                        // is unreachable but harmless to log.
                        Err(SessionError::Drop(err)) => warn!("client dropped: {err}"),
                    }
                    thread::sleep(Duration::from_millis(tick_ms));
                }
                info!("server thread down");
            })?;
        Ok(Self { tx, events, handle })
    }

    /// The pipe used to drive the hosted world.
    pub fn sender(&self) -> &pipe::PipeSender<ServerCommand> {
        &self.tx
    }

    /// Drain events the session surfaced since the last call.
    pub fn pump_events(&mut self, handler: impl FnMut(ServerEvent)) -> Pump {
        self.events.pump(handler)
    }

    /// Request shutdown and join the thread.
    pub fn shutdown(self) -> anyhow::Result<()> {
        self.tx.terminate();
        self.handle
            .join()
            .map_err(|_| anyhow!("server thread panicked"))
    }
}

fn apply(session: &mut ServerSession<LoopbackTransport>, cmd: ServerCommand) {
    match cmd {
        ServerCommand::SetEntity(state) => session.world_mut().set_entity(state),
        ServerCommand::RemoveEntity(number) => session.world_mut().remove_entity(number),
        ServerCommand::SetPlayers(players) => session.world_mut().players = players,
        ServerCommand::SetGameState(block) => session.world_mut().game_state = Some(block),
        ServerCommand::SetScoreboard(block) => session.world_mut().scoreboard = Some(block),
        ServerCommand::Send(text) => {
            if let Err(err) = session.send_command(&text) {
                warn!("queued command dropped: {err}");
            }
        }
        ServerCommand::OfferFile(name, data) => session.offer_file(&name, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiresync_net::oob;
    use wiresync_net::protocol::PROTOCOL_VERSION;
    use wiresync_net::{loopback_pair, Incoming, NetChannel};

    #[test]
    fn test_spawn_and_shutdown() {
        let (near, _far) = loopback_pair();
        let server = ServerThread::spawn(near, ServerSettings::default(), 1).expect("spawn");
        assert!(server.sender().send(ServerCommand::SetEntity(EntityState {
            number: 1,
            ..Default::default()
        })));
        server.shutdown().expect("clean shutdown");
    }

    #[test]
    fn test_session_events_cross_the_return_pipe() {
        let (near, far) = loopback_pair();
        let mut server = ServerThread::spawn(near, ServerSettings::default(), 1).expect("spawn");
        let mut chan = NetChannel::new(far, false);
        chan.send_oob("getchallenge").expect("send");

        let mut challenge = None;
        for _ in 0..500 {
            thread::sleep(Duration::from_millis(2));
            while let Some(incoming) = chan.poll().expect("poll") {
                let Incoming::OutOfBand(text) = incoming else {
                    continue;
                };
                for command in oob::split_commands(&text) {
                    let tokens = oob::tokenize(&command);
                    if tokens.first().map(String::as_str) == Some("challenge") {
                        challenge = tokens.get(1).and_then(|t| t.parse::<u32>().ok());
                    }
                }
            }
            if challenge.is_some() {
                break;
            }
        }
        let challenge = challenge.expect("challenge reply");
        chan.send_oob(&format!("connect {PROTOCOL_VERSION} {challenge}"))
            .expect("send");

        let mut connected = false;
        for _ in 0..500 {
            thread::sleep(Duration::from_millis(2));
            server.pump_events(|event| {
                if matches!(event, ServerEvent::ClientConnected) {
                    connected = true;
                }
            });
            if connected {
                break;
            }
        }
        assert!(connected, "acceptance never crossed the event pipe");
        server.shutdown().expect("clean shutdown");
    }

    #[test]
    fn test_shutdown_runs_earlier_commands_first() {
        let (near, _far) = loopback_pair();
        let server = ServerThread::spawn(near, ServerSettings::default(), 1).expect("spawn");
        for i in 1..=10u16 {
            server.sender().send(ServerCommand::RemoveEntity(i));
        }
        server.shutdown().expect("clean shutdown");
    }
}
