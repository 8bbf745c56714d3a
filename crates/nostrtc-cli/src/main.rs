//! nostrtc command line client
//!
//! Usage:
//!   nostrtc chat [--room <secret>] [--name <name>] [--relay <url>]... [--no-direct]
//!   nostrtc keygen
//!   nostrtc config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr_sdk::nips::nip19::ToBech32;
use nostr_sdk::Keys;
use nostrtc::{Coordinator, CoordinatorOptions, DirectTransportFactory, NostrBus};
use nostrtc_cli::{chat, load_config, load_identity, logging, room_keys};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser)]
#[command(name = "nostrtc")]
#[command(about = "Peer-to-peer rooms signaled over Nostr relays", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.nostrtc/config.toml)
    #[arg(long, global = true, env = "NOSTRTC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and chat with everyone in it
    Chat {
        /// Room secret (hex or nsec); overrides signaling.channel_key
        #[arg(long)]
        room: Option<String>,
        /// Name advertised to other peers
        #[arg(long)]
        name: Option<String>,
        /// Alias of the identity to use from the keys file
        #[arg(long)]
        key: Option<String>,
        /// Signaling relay; repeat to use several. Overrides the config.
        #[arg(long = "relay")]
        relays: Vec<String>,
        /// Never try direct connections
        #[arg(long)]
        no_direct: bool,
    },
    /// Generate a secret usable as an identity or a room key
    Keygen,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat {
            room,
            name,
            key,
            relays,
            no_direct,
        } => {
            logging::init(&config.log);

            let channel = room_keys(room.as_deref(), &config)?;
            let (keys, generated) = load_identity(key.as_deref())?;
            let local_id = keys.public_key().to_hex();
            let span = logging::root_span(&config.log, &local_id);
            if generated {
                info!(parent: &span, "Using a fresh identity for this session");
            }

            let mut options = CoordinatorOptions::from_config(&config);
            if !relays.is_empty() {
                options.signaling_relays = relays;
            }
            if let Some(name) = name {
                options.metadata.insert("name".to_string(), name);
            }
            options.direct = (!no_direct).then(|| {
                Arc::new(nostrtc::WebRtcTransportFactory::new()) as Arc<dyn DirectTransportFactory>
            });
            options.span = Some(span);

            let bus = Arc::new(NostrBus::new());
            let coordinator = Coordinator::new(bus.clone(), keys, channel, options);
            let result = chat::run(coordinator, BufReader::new(tokio::io::stdin())).await;
            bus.shutdown().await;
            result?;
        }
        Commands::Keygen => {
            let keys = Keys::generate();
            let nsec = keys
                .secret_key()
                .to_bech32()
                .context("Failed to encode nsec")?;
            let npub = keys
                .public_key()
                .to_bech32()
                .context("Failed to encode npub")?;
            println!("{}", nsec);
            println!("public key: {}", npub);
        }
        Commands::Config => {
            let path = cli
                .config
                .unwrap_or_else(nostrtc_config::get_config_path);
            println!("Config: {}", path.display());
            println!("Keys: {}", nostrtc_config::get_keys_path().display());
            println!("Relays: {}", config.signaling.relays.join(", "));
            println!(
                "Room key: {}",
                if config.signaling.channel_key.is_some() {
                    "configured"
                } else {
                    "not set"
                }
            );
            println!("STUN servers: {}", config.signaling.stun_servers.len());
            if !config.signaling.fallback_relays.is_empty() {
                println!(
                    "Fallback relays: {}",
                    config.signaling.fallback_relays.join(", ")
                );
            }
            println!("Event kind: {}", config.rtc.kind);
            println!("Chunk length: {}", config.turn.chunk_length);
        }
    }

    Ok(())
}
