//! Entry point for a single distributed-file-store node.
//!
//! Loads configuration, sets up logging, starts a [`fileserver::FileServer`]
//! listening and dialing its bootstrap peers, then blocks until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

/// Run a distributed file store node.
#[derive(Parser, Debug)]
#[command(name = "dfs-node", about = "Distributed content-addressed file store node")]
struct Cli {
    /// Path to a TOML configuration file. Missing files fall back to
    /// defaults plus any `DFS_*` environment overrides.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen address from the config file.
    #[arg(long)]
    listen_addr: Option<String>,

    /// Override the bootstrap peer list from the config file (comma-separated).
    #[arg(long, value_delimiter = ',')]
    bootstrap: Option<Vec<String>>,
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "node panicked");
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::Config::load(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(listen_addr) = cli.listen_addr {
        config.node.listen_addr = listen_addr;
    }
    if let Some(bootstrap) = cli.bootstrap {
        config.node.bootstrap_nodes = bootstrap;
    }

    let log_opts = telemetry::LogOptions {
        level: config.log.level.clone(),
        json: config.log.json,
        directory: config.log.file.clone(),
        max_size_mb: config.log.max_size_mb,
        max_backups: config.log.max_backups,
        max_age_days: config.log.max_age_days,
    };
    let _log_guard = telemetry::init_logging(&log_opts).context("initializing logging")?;
    install_panic_hook();

    let enc_key = if config.node.enc_key.is_empty() {
        info!("no encryption key configured, generating an ephemeral one for this process");
        crypto::new_encryption_key()
    } else {
        config.enc_key_bytes().context("reading encryption key")?
    };
    let node_id = config.node.node_id.clone().unwrap_or_else(crypto::generate_id);
    let store = store::Store::new(&config.node.storage_root)
        .with_context(|| format!("opening store at {}", config.node.storage_root.display()))?;

    info!(%node_id, listen_addr = %config.node.listen_addr, bootstrap = ?config.node.bootstrap_nodes, "starting node");

    let server = fileserver::FileServer::new(fileserver::FileServerOpts {
        node_id,
        enc_key,
        store,
        listen_addr: config.node.listen_addr.clone(),
        bootstrap_nodes: config.node.bootstrap_nodes.clone(),
    });

    let local_addr = server.start().await.context("starting file server")?;
    info!(%local_addr, "node is listening");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping");
    server.stop();

    Ok(())
}
