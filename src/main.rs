//! wiresync - snapshot synchronization client with an embeddable server
//!
//! Connects to a remote server over UDP, or hosts a local session on an
//! in-process transport and connects to it, printing session events.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use wiresync_client::{ClientEvent, ClientSession, ClientSettings};
use wiresync_core::Clock;
use wiresync_net::{loopback_pair, PacketTransport, UdpTransport};
use wiresync_server::{ServerSettings, ServerThread};

#[derive(Parser)]
#[command(name = "wiresync", version, about)]
struct Cli {
    /// Path to the client settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a server.
    Connect {
        /// Server address, host:port.
        address: String,
    },
    /// Host a local session and connect to it.
    Host {
        /// Milliseconds between server ticks.
        #[arg(long, default_value_t = 50)]
        tick_ms: u64,
        /// Greeting shown to the connecting client.
        #[arg(long, default_value = "local session")]
        message: String,
    },
}

fn main() -> Result<()> {
    // WARN by default; override via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    info!("starting wiresync v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => ClientSettings::load_from_path(path),
        None => ClientSettings::load(),
    };

    match cli.command {
        Command::Connect { address } => {
            let transport = dial_udp(&address)?;
            run_client(transport, &address, settings, Some(dial_udp), || {})
        }
        Command::Host { tick_ms, message } => {
            let (near, far) = loopback_pair();
            let server_settings = ServerSettings {
                message,
                ..ServerSettings::default()
            };
            let mut server = ServerThread::spawn(near, server_settings, tick_ms)
                .context("starting embedded server")?;
            let outcome = run_client(far, "loopback", settings, None, || {
                server.pump_events(|event| tracing::debug!(?event, "server event"));
            });
            server.shutdown().context("stopping embedded server")?;
            outcome
        }
    }
}

fn dial_udp(address: &str) -> Result<UdpTransport> {
    UdpTransport::connect(address).with_context(|| format!("resolving {address}"))
}

/// Drive a session until it disconnects for good. `redial` builds a
/// fresh transport when the session asks to try a fallback server.
fn run_client<T: PacketTransport>(
    transport: T,
    address: &str,
    settings: ClientSettings,
    redial: Option<fn(&str) -> Result<T>>,
    mut poll_host: impl FnMut(),
) -> Result<()> {
    let interval = Duration::from_millis(settings.frame_interval_ms().max(1.0) as u64);
    let clock = Clock::new();
    let mut session = ClientSession::new(transport, address, settings);
    session.connect(clock.now());

    loop {
        let events = session
            .tick(clock.now(), None)
            .context("client tick failed")?;
        let mut ended = None;
        let mut fallback = None;
        for event in events {
            match event {
                ClientEvent::StateChanged(state) => info!(?state, "connection state"),
                ClientEvent::Command(text) => println!("server: {text}"),
                ClientEvent::Print(text) => println!("{text}"),
                ClientEvent::SnapshotApplied(frame) => {
                    tracing::trace!(frame, "snapshot applied");
                }
                ClientEvent::DownloadFailed(reason) => println!("download failed: {reason}"),
                ClientEvent::Disconnected(reason) => ended = Some(reason),
                ClientEvent::ReconnectTo(next) => fallback = Some(next),
            }
        }

        let mut reconnected = false;
        if let Some(next) = fallback {
            match redial {
                Some(redial) => {
                    println!("retrying against {next}");
                    let transport = redial(&next)?;
                    session.rebind(transport, &next, clock.now());
                    reconnected = true;
                }
                None => println!("fallback server {next} is unreachable from here"),
            }
        }
        if !reconnected {
            if let Some(reason) = ended {
                println!("disconnected: {reason:?}");
                return Ok(());
            }
        }

        poll_host();
        thread::sleep(interval);
    }
}
