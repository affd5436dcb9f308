//! PeerNet - Bitcoin P2P peer connection engine
//!
//! Opens a session with a single peer and reports what it says.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peernet::config::{self, Config};
use peernet::network::{resolve_peer, Connection, ConnectionError, Messages, TcpDialer};
use peernet::protocol::{
    commands, Inventory, Message, Network, NetworkProfile, VersionPayload, PROTOCOL_VERSION,
};

/// How long to wait for the peer's `version`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// PeerNet - Bitcoin P2P peer connection engine
#[derive(Parser)]
#[command(name = "peernet")]
#[command(author = "PeerNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Talk to a Bitcoin peer over the P2P wire protocol", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer, handshake, and log its messages
    Connect {
        /// Peer address (host or host:port)
        #[arg(short, long)]
        peer: Option<String>,

        /// Network to speak
        #[arg(short, long, value_enum)]
        network: Option<Network>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show network profile constants
    Info {
        /// Network to describe
        #[arg(short, long, value_enum)]
        network: Option<Network>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Connect { peer, network } => {
            run_connect(config, peer, network).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info { network } => {
            let network = network.unwrap_or(config.network.network);
            print_profile_info(&NetworkProfile::for_network(network));
        }
    }

    Ok(())
}

/// Open a session with one peer and log its traffic until Ctrl+C
async fn run_connect(
    mut config: Config,
    peer: Option<String>,
    network: Option<Network>,
) -> anyhow::Result<()> {
    if let Some(network) = network {
        config.network.network = network;
    }
    let profile = config.profile();

    let Some(peer) = peer.or_else(|| config.peer.address.clone()) else {
        anyhow::bail!("Please specify --peer address or set [peer] address in the config");
    };
    let addr = resolve_peer(&peer, profile.peers.port).await?;

    // The session ends when the peer does
    let conn = Connection::new(
        profile.clone(),
        config.connection_config().rejecting_waiters_on_end(),
    );

    println!("Connecting to {} on {}...", addr, profile.network);
    conn.connect(&TcpDialer::new(addr)).await?;

    // Subscribed before our version goes out, so no reply is missed
    let mut messages = conn.messages();
    handshake(&conn, &profile, &mut messages).await?;

    println!("\n========================================");
    println!("  PeerNet Session Open");
    println!("========================================");
    println!("  Peer: {}", addr);
    println!("  Network: {}", profile.network);
    println!("========================================");
    println!("\nLogging peer messages...");
    println!("Press Ctrl+C to disconnect.\n");

    loop {
        tokio::select! {
            next = messages.next() => {
                match next {
                    Some(Ok(message)) => log_message(&message),
                    Some(Err(ConnectionError::InvalidMessage { command })) => {
                        tracing::warn!("Dropped invalid {} message", command);
                    }
                    Some(Err(e)) => {
                        println!("Session ended: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if conn.is_active() {
        conn.disconnect().await?;
    }

    let stats = conn.stats();
    tracing::info!(
        "Session closed: {} messages received, {} sent, {} invalid",
        stats.messages_received,
        stats.messages_sent,
        stats.invalid_messages
    );

    Ok(())
}

/// Send our `version`, wait for theirs, then acknowledge it
async fn handshake(
    conn: &Connection,
    profile: &NetworkProfile,
    messages: &mut Messages,
) -> anyhow::Result<()> {
    let version = VersionPayload::new(profile.protocol_version, 0);
    conn.send(&Message::version(profile, &version)).await?;

    let theirs = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match messages.next().await {
                Some(Ok(message)) if message.is_command(commands::VERSION) => {
                    return Ok(message);
                }
                Some(Ok(message)) => {
                    tracing::debug!("Ignoring {} before handshake", message.command());
                }
                Some(Err(ConnectionError::InvalidMessage { command })) => {
                    tracing::warn!("Dropped invalid {} message", command);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(ConnectionError::Closed),
            }
        }
    })
    .await??;

    match VersionPayload::decode(theirs.payload()) {
        Ok(version) => tracing::info!(
            "Peer speaks version {} as {} at height {}",
            version.version,
            version.user_agent,
            version.start_height
        ),
        Err(e) => tracing::warn!("Could not decode peer version: {}", e),
    }
    conn.send(&Message::verack(profile)).await?;
    Ok(())
}

fn log_message(message: &Message) {
    match message.command() {
        commands::PING | commands::PONG => {
            tracing::debug!("{} nonce={:?}", message.command(), message.nonce());
        }
        commands::INV | commands::GETDATA | commands::NOTFOUND => {
            match Inventory::decode_list(message.payload()) {
                Ok(items) => {
                    let blocks = items.iter().filter(|i| i.is_block()).count();
                    let txs = items.iter().filter(|i| i.is_tx()).count();
                    tracing::info!(
                        "{}: {} items ({} blocks, {} transactions)",
                        message.command(),
                        items.len(),
                        blocks,
                        txs
                    );
                }
                Err(e) => tracing::warn!("Malformed {} payload: {}", message.command(), e),
            }
        }
        command => {
            tracing::info!("{} ({} bytes)", command, message.payload().len());
        }
    }
}

/// Print network profile constants
fn print_profile_info(profile: &NetworkProfile) {
    println!("PeerNet Network Profile");
    println!("=======================\n");

    println!("Network: {}", profile.network);
    println!("Magic: {:#010x}", profile.magic);
    println!("Default Port: {}", profile.peers.port);
    println!("Max Message Size: {} bytes", profile.max_message_size);
    println!(
        "Address Versions: p2pkh={:#04x} p2sh={:#04x}",
        profile.address.pub_key_hash, profile.address.script_hash
    );
    println!(
        "BIP32 Versions: pub={:#010x} priv={:#010x}",
        profile.bip32.pub_key, profile.bip32.priv_key
    );
    println!("Fee Per KB: {} sat", profile.fees.fee_per_kb);
    println!("Dust Threshold: {} sat", profile.fees.dust);
    println!(
        "Peers: {} to {} connections",
        profile.peers.min_connections, profile.peers.max_connections
    );

    println!("\nProtocol Version: {}", PROTOCOL_VERSION);
}
