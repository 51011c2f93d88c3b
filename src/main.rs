//! Peer Bridge CLI Application
//!
//! Runs a bridge, or talks to running bridges for one-off operations.

use clap::{Parser, Subcommand};
use peer_bridge::cli::{self, Overrides};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bridge")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer synchronization bridge for cooperating AI instances", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for the knowledge store
    #[arg(short, long, default_value = ".bridge_data")]
    data_dir: PathBuf,

    /// Instance id (overrides the config file)
    #[arg(long)]
    id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until Ctrl+C
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap peers (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Seconds between health checks
        #[arg(long)]
        health_interval: Option<u64>,
    },

    /// Send one message to a peer and print its ack
    Send {
        /// Peer address (host:port)
        #[arg(long)]
        peer: String,

        /// Message type, e.g. experience_share
        #[arg(short = 't', long = "type")]
        message_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Check the health of one or more peers
    Health {
        /// Peers to check (comma-separated host:port)
        #[arg(long)]
        peers: String,
    },

    /// Generate a new identity key
    Keygen,

    /// Print or write the default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen => return cli::cmd_keygen(),
        Commands::Config { output } => return cli::cmd_config(output.as_ref()),
        _ => {}
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let base = Overrides {
            instance_id: cli.id.clone(),
            ..Default::default()
        };

        match &cli.command {
            Commands::Start {
                port,
                peers,
                health_interval,
            } => {
                let config = cli::load_config(
                    cli.config.as_deref(),
                    Overrides {
                        port: *port,
                        peers: cli::parse_peers(peers.as_deref()),
                        health_interval: *health_interval,
                        ..base
                    },
                )?;
                cli::cmd_start(config, &cli.data_dir).await
            }
            Commands::Send {
                peer,
                message_type,
                payload,
            } => {
                let config = cli::load_config(cli.config.as_deref(), base)?;
                cli::cmd_send(config, peer, message_type, payload).await
            }
            Commands::Health { peers } => {
                let config = cli::load_config(cli.config.as_deref(), base)?;
                cli::cmd_health(config, &cli::parse_peers(Some(peers))).await
            }
            Commands::Keygen | Commands::Config { .. } => Ok(()),
        }
    })
}
