//! Standalone signaling server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshroom_core::adapters::quic::SignalingServer;

/// Identity registry for meshroom peers.
#[derive(Parser, Debug)]
#[command(name = "meshroom-signal", version)]
struct Cli {
    /// UDP address to listen on.
    #[arg(long, default_value = "0.0.0.0:4433")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(addr = %cli.bind, "Signaling server starting");
    let server = Arc::new(SignalingServer::bind(cli.bind)?);

    let runner = Arc::clone(&server);
    tokio::select! {
        result = runner.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!(registered = server.registered(), "Shutting down");
            server.shutdown();
            Ok(())
        }
    }
}
