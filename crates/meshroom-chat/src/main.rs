//! Terminal chat front-end.
//!
//! Hosts or joins a room, prints room events and sends stdin lines as chat.

mod commands;
mod events;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use meshroom_core::domain::identity::RoomCode;
use meshroom_core::RoomConfig;

use crate::commands::{announce, execute, Command, HELP};

#[derive(Parser, Debug)]
#[command(name = "meshroom-chat", version, about = "Peer-to-peer room chat")]
struct Cli {
    /// Signaling server address.
    #[arg(long, default_value = "127.0.0.1:4433")]
    signal: SocketAddr,

    /// TOML session config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name shown to other members.
    #[arg(long, default_value = "anonymous")]
    name: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Open a room; a code is generated unless one is given.
    Host {
        #[arg(long)]
        code: Option<String>,
    },
    /// Join the room with the given code.
    Join { code: RoomCode },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with chat on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = state::load_config(cli.config.as_deref())?;
    let room_config = match cli.mode {
        Mode::Host { code } => RoomConfig::host(state::host_code(code.as_deref())?, cli.name),
        Mode::Join { code } => RoomConfig::joiner(code, cli.name),
    };

    let mut room = state::build_room(cli.signal, config, room_config);
    println!("{HELP}");
    if room.join().await.is_ok() {
        announce(&room);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = room.step() => {
                if let Err(e) = result {
                    warn!("Session ended: {e}");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !execute(&mut room, Command::parse(&line)).await {
                    break;
                }
            }
        }
    }

    room.leave().await;
    Ok(())
}
