//! `swarm-watchdog` – keeps a swarm worker alive.
//!
//! Relaunches the worker when it exits and restarts it when its liveness
//! file goes stale. Create the stop file to end supervision.

use anyhow::{Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use swarm::watchdog::{ProcessLauncher, Watchdog, WatchdogConfig};

#[derive(Parser)]
#[command(name = "swarm-watchdog")]
#[command(about = "Restart the swarm worker on crash or stall", long_about = None)]
struct Cli {
    /// Worker executable
    #[arg(long, default_value = "swarmd")]
    exe: PathBuf,

    /// Liveness file written by the worker
    #[arg(long, default_value = "swarm_heartbeat.txt")]
    heartbeat: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval: u64,

    /// Liveness age in milliseconds that counts as stale
    #[arg(long, default_value = "5000")]
    stale_ms: u64,

    /// Consecutive stale polls before restarting
    #[arg(long, default_value = "2")]
    retries: u32,

    /// Supervision ends when this file exists
    #[arg(long, default_value = "swarm_watchdog.stop")]
    stop_file: PathBuf,

    /// Arguments passed to the worker
    #[arg(last = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.interval == 0 {
        bail!("--interval must be positive");
    }

    let mut config = WatchdogConfig::new(cli.exe, cli.heartbeat);
    config.args = cli.args;
    config.stop_file = cli.stop_file;
    config.poll_interval = Duration::from_millis(cli.interval);
    config.stale_threshold = Duration::from_millis(cli.stale_ms);
    config.stale_retries = cli.retries.max(1);

    println!("swarm-watchdog {}", swarm::VERSION);
    println!("  worker:    {} {}", config.exe.display(), config.args.join(" "));
    println!("  heartbeat: {}", config.heartbeat.display());
    println!(
        "  interval:  {} ms, stale after {} ms x {}",
        cli.interval, cli.stale_ms, config.stale_retries
    );
    println!("  stop file: {}", config.stop_file.display());

    let launcher = ProcessLauncher::new(&config);
    let mut watchdog = Watchdog::new(config, launcher);
    watchdog.run();

    tracing::info!(restarts = watchdog.restarts(), "watchdog stopped");
    Ok(())
}
