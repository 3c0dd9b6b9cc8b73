//! Tandem - peer-to-peer file exchange
//!
//! Runs the signaling relay that pairs two peers in a room, and resolves
//! room identifiers.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tandem_net::{RoomId, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;

#[derive(Parser, Debug)]
#[command(name = "tandem", version, about = "Tandem peer-to-peer file exchange")]
struct Cli {
    /// Log level used when RUST_LOG is unset: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signaling relay until interrupted
    Relay {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Peers allowed in one room
        #[arg(long)]
        max_room_peers: Option<usize>,

        /// Config file (defaults to the per-user config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the room id for a hint, generating one if the hint is not usable
    Room {
        /// Six digits, optionally prefixed with '#'
        hint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    match cli.cmd {
        Commands::Relay {
            port,
            max_room_peers,
            config,
        } => {
            let mut config = settings::load(config.as_deref())?.relay;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(max_room_peers) = max_room_peers {
                config.max_room_peers = max_room_peers;
            }

            let server = Server::start(&config).await?;
            tracing::info!(addr = %server.addr(), "Relay listening, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Commands::Room { hint } => {
            let room = RoomId::from_hint(hint.as_deref());
            println!("{}", room);
        }
    }

    Ok(())
}
