use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cove::call::CallEvent;
use cove::config::{generate_room_name, CallConfig};
use cove::telemetry::logging::{self, LogConfig, LogLevel};
use cove::join_call;

#[derive(Debug, Parser)]
#[command(name = "cove", about = "Join a multi-party call from the terminal")]
struct Cli {
    /// Signaling relay to connect through.
    #[arg(
        long,
        env = "COVE_SIGNALING_URL",
        default_value = "ws://127.0.0.1:8080"
    )]
    signaling_url: String,

    /// Room to join; a random name is generated when omitted.
    #[arg(long, env = "COVE_ROOM")]
    room: Option<String>,

    /// Display name announced to other participants.
    #[arg(long, env = "COVE_NAME")]
    name: Option<String>,

    #[arg(long, env = "COVE_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "COVE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let room = cli.room.unwrap_or_else(generate_room_name);
    println!("room: {room}");

    let mut config = CallConfig::new(cli.signaling_url, room);
    if let Some(name) = cli.name {
        config = config.with_display_name(name);
    }

    let (call, mut events) = join_call(config).await.context("failed to join call")?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(CallEvent::Joined { self_id }) => {
                        println!("joined as {self_id}");
                    }
                    Some(CallEvent::PeerDiscovered { peer_id, polite }) => {
                        info!(target = "cove", peer = %peer_id, polite, "peer discovered");
                    }
                    Some(CallEvent::PeerDisplayName { peer_id, name }) => {
                        println!("{peer_id} is {name}");
                    }
                    Some(CallEvent::ConnectionState { peer_id, state }) => {
                        info!(target = "cove", peer = %peer_id, ?state, "connection state");
                    }
                    Some(CallEvent::RemoteTrack { peer_id, track }) => {
                        info!(target = "cove", peer = %peer_id, track = %track.id, kind = ?track.kind, "remote track");
                    }
                    Some(CallEvent::PeerLeft { peer_id }) => {
                        println!("{peer_id} left");
                    }
                    Some(CallEvent::CandidateFailed { peer_id, error }) => {
                        info!(target = "cove", peer = %peer_id, %error, "candidate failed");
                    }
                    Some(CallEvent::Left) | None => {
                        println!("call ended");
                        break;
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                let _ = call.leave();
            }
        }
    }
    Ok(())
}
