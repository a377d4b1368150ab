//! Peerstore Node Daemon
//!
//! Runs a node that:
//! - Stores objects under a content-addressed layout on local disk
//! - Accepts peers over TCP and dials its bootstrap list
//! - Replicates stored objects to peers and serves fetch requests

use clap::Parser;
use peerstore_node::{FileServer, NodeConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerstore-node")]
#[command(about = "Peer-to-peer replicating file store node")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "peerstore.toml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap peer address, repeatable (overrides config file)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Store root directory (overrides config file)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Peerstore node starting...");

    // Priority: CLI args > environment > config file > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.listen, cli.bootstrap, cli.root);

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }

    info!(
        listen_addr = %config.network.listen_addr,
        root = ?config.storage.root,
        bootstrap = ?config.network.bootstrap_peers,
        encrypted = config.crypto.encryption_key.is_some(),
        "Configuration loaded"
    );

    let server = FileServer::new(config.to_server_options()?);

    let runner = server.clone();
    let mut handle = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            server.stop();
            handle.await??;
        }
        result = &mut handle => {
            result??;
        }
    }

    info!("Peerstore node stopped");
    Ok(())
}
