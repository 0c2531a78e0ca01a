//! Server message dispatch: the op-code loop over one channel message.

use tracing::warn;
use wiresync_core::{DropError, Millis, SessionError};
use wiresync_net::entity::EntityState;
use wiresync_net::protocol::{ServerData, ServerDataFlags, ServerOp, PROTOCOL_VERSION};
use wiresync_net::reliable::read_command;
use wiresync_net::{oob, MessageReader, PacketTransport};

use crate::download::DownloadError;
use crate::session::{ClientEvent, ClientSession};
use crate::state::ConnectionState;

/// Parse one received channel message, op by op, until it is exhausted.
pub(crate) fn server_message<T: PacketTransport>(
    session: &mut ClientSession<T>,
    data: &[u8],
    now: Millis,
    events: &mut Vec<ClientEvent>,
) -> Result<(), SessionError> {
    let mut r = MessageReader::new(data);
    while r.remaining() > 0 {
        let op = ServerOp::try_from(r.read_u8().map_err(DropError::from)?)
            .map_err(SessionError::Drop)?;
        match op {
            ServerOp::Nop => {}
            ServerOp::ServerCommand => {
                let reliable_transport = session
                    .server_data
                    .as_ref()
                    .map(|d| d.flags.contains(ServerDataFlags::RELIABLE))
                    .unwrap_or(false);
                let executed = if reliable_transport {
                    let text = r.read_string().map_err(DropError::from)?;
                    Some(session.reliable_in.receive_implicit(text))
                } else {
                    let (seq, text) = read_command(&mut r).map_err(DropError::from)?;
                    session
                        .reliable_in
                        .receive(seq, text)
                        .map_err(SessionError::Drop)?
                };
                if let Some(text) = executed {
                    server_command(session, &text, now, events)?;
                }
            }
            ServerOp::ServerData => {
                let data = ServerData::read(&mut r).map_err(DropError::from)?;
                if data.protocol != PROTOCOL_VERSION {
                    return Err(SessionError::Drop(DropError::VersionMismatch {
                        client: PROTOCOL_VERSION,
                        server: data.protocol,
                    }));
                }
                session.state.on_server_data().map_err(SessionError::Drop)?;
                session.server_data = Some(data);
                // Tell the server we are ready for baselines and frames.
                session
                    .reliable_out
                    .add("enter")
                    .map_err(SessionError::Drop)?;
                events.push(ClientEvent::StateChanged(ConnectionState::Connected));
            }
            ServerOp::SpawnBaseline => {
                let number = r.read_u16().map_err(DropError::from)?;
                let from = EntityState {
                    number,
                    ..Default::default()
                };
                let mut state =
                    EntityState::read_delta(&from, &mut r).map_err(DropError::from)?;
                state.number = number;
                session.snapshots.set_baseline(state);
            }
            ServerOp::Download => {
                let offset = r.read_u64().map_err(DropError::from)?;
                let len = r.read_u16().map_err(DropError::from)? as usize;
                let chunk = r.read_data(len).map_err(DropError::from)?;
                match session.download.chunk(offset, chunk, now) {
                    Ok(()) => {}
                    // Corrupt data is recoverable: the manager already
                    // discarded the temp file and went back to Idle.
                    Err(err @ DownloadError::ChecksumMismatch { .. })
                    | Err(err @ DownloadError::SizeMismatch { .. }) => {
                        warn!("download discarded: {err}");
                        events.push(ClientEvent::DownloadFailed(err.to_string()));
                    }
                    Err(err) => return Err(SessionError::Fatal(err.into())),
                }
            }
            ServerOp::CommandAck => {
                let ack = r.read_u64().map_err(DropError::from)?;
                session
                    .reliable_out
                    .acknowledge(ack)
                    .map_err(SessionError::Drop)?;
            }
            ServerOp::Frame => {
                let parsed = session
                    .snapshots
                    .parse_frame(&mut r)
                    .map_err(SessionError::Drop)?;
                session
                    .input
                    .acknowledge(parsed.ucmd_executed)
                    .map_err(SessionError::Drop)?;
                if parsed.valid {
                    session.last_frame = parsed.frame;
                    session.time.record(parsed.server_time, now);
                    let was = session.state.state();
                    session.state.on_first_snapshot();
                    if was == ConnectionState::Connected {
                        events.push(ClientEvent::StateChanged(ConnectionState::Active));
                    }
                    events.push(ClientEvent::SnapshotApplied(parsed.frame));
                }
            }
            ServerOp::DemoInfo | ServerOp::Extension => {
                let len = r.read_u16().map_err(DropError::from)? as usize;
                r.skip(len).map_err(DropError::from)?;
            }
        }
    }
    Ok(())
}

/// Execute one reliable server command.
fn server_command<T: PacketTransport>(
    session: &mut ClientSession<T>,
    text: &str,
    now: Millis,
    events: &mut Vec<ClientEvent>,
) -> Result<(), SessionError> {
    let tokens = oob::tokenize(text);
    let Some(name) = tokens.first() else {
        return Ok(());
    };
    match name.as_str() {
        "print" => {
            if let Some(message) = tokens.get(1) {
                events.push(ClientEvent::Print(message.clone()));
            }
        }
        "disconnect" => {
            return Err(SessionError::Drop(DropError::Rejected(
                "server disconnected".into(),
            )));
        }
        "dlstart" => {
            let (size, checksum) = parse_download_args(&tokens)?;
            session.download.accept_channel(size, checksum, now);
        }
        "dlweb" => {
            let (size, checksum) = parse_download_args(&tokens)?;
            let urls: Vec<String> = tokens[3..].to_vec();
            // The fetcher is taken out for the call so the manager can
            // borrow it alongside the session.
            let Some(mut web) = session.web.take() else {
                warn!("web download offered but no fetcher installed");
                session.download.cancel();
                return Ok(());
            };
            let result = session
                .download
                .accept_web(size, checksum, urls, web.as_mut());
            session.web = Some(web);
            if let Err(err) = result {
                warn!("web download failed: {err}");
            }
        }
        _ => events.push(ClientEvent::Command(text.to_string())),
    }
    Ok(())
}

fn parse_download_args(tokens: &[String]) -> Result<(u64, u32), SessionError> {
    let size = tokens
        .get(1)
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| {
            SessionError::Drop(DropError::IllegalMessage("malformed download size".into()))
        })?;
    let checksum = tokens
        .get(2)
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| {
            SessionError::Drop(DropError::IllegalMessage(
                "malformed download checksum".into(),
            ))
        })?;
    Ok((size, checksum))
}
