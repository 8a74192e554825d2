//! `swarmd` – the swarm worker.
//!
//! Serves the command and event sockets, steps the swarm and publishes the
//! liveness file until `sys/exit` or Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use swarm::runtime::storage::load_settings;
use swarm::{Runtime, SwarmConfig};

#[derive(Parser)]
#[command(name = "swarmd")]
#[command(about = "Virtual pointer swarm worker", long_about = None)]
struct Cli {
    /// Directory holding the state, config and liveness files
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Directory holding the sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// JSON settings file; flags override its values
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Number of command socket workers
    #[arg(long)]
    listeners: Option<usize>,

    /// Start with an empty swarm
    #[arg(long)]
    no_seed: bool,

    /// Executable used to run entity scripts
    #[arg(long)]
    script_host: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Result<SwarmConfig> {
        let mut config = match &self.settings {
            Some(path) => load_settings(path)
                .with_context(|| format!("Failed to load settings: {:?}", path))?,
            None => SwarmConfig::default(),
        };
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(dir) = self.socket_dir {
            config.socket_dir = dir;
        }
        if let Some(listeners) = self.listeners {
            config.listener_count = listeners.max(1);
        }
        if self.no_seed {
            config.seed_entities = false;
        }
        if let Some(host) = self.script_host {
            config.script_host = host;
        }
        config.debug |= self.debug;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    tracing::info!(
        version = swarm::VERSION,
        protocol = swarm::PROTOCOL_VERSION,
        root = %config.root.display(),
        "swarmd starting"
    );
    Runtime::new(config).run().await
}
