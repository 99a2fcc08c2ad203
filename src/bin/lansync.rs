//! lansync daemon - peer-to-peer LAN directory synchronization.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lansync::{Config, Node};

/// Synchronize a directory with every peer on the local network.
#[derive(Parser)]
#[command(name = "lansync")]
#[command(version)]
#[command(about = "Peer-to-peer LAN directory synchronization")]
struct Cli {
    /// The directory to monitor and synchronize
    monitor_dir: PathBuf,

    /// The directory to persist file signatures in
    #[arg(short = 's', long, default_value = lansync::DEFAULT_SIGNATURE_DIR)]
    signature_dir: PathBuf,

    /// The UDP port for broadcasting presence
    #[arg(short = 'b', long, default_value_t = lansync::DEFAULT_BROADCAST_PORT)]
    broadcast_port: u16,

    /// The TCP port for synchronization sessions
    #[arg(short = 'l', long, default_value_t = lansync::DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> lansync::Result<()> {
    let mut config = Config::new(cli.monitor_dir);
    config.signature_dir = cli.signature_dir;
    config.broadcast_port = cli.broadcast_port;
    config.listen_port = cli.listen_port;

    let node = Node::start(config)?;
    info!(id = %node.local_id(), "lansync running");

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
