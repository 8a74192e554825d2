//! `swarm-cli` – talk to a running swarm worker.
//!
//! Sends command lines, prints the event stream and runs a quick end to end
//! check against a live worker.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::time::Duration;
use swarm::SwarmConfig;
use swarm::runtime::service_client::{ClientError, CommandClient, EventSubscriber, event_name};

#[derive(Parser)]
#[command(name = "swarm-cli")]
#[command(about = "Command-line client for the swarm worker", long_about = None)]
struct Cli {
    /// Directory holding the worker sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send raw command lines
    Send {
        /// One flat record per argument
        lines: Vec<String>,

        /// Wait for this event after sending
        #[arg(long)]
        wait: Option<String>,
    },

    /// Send one operation built from key=value pairs
    Op {
        /// Operation name, e.g. cursor/add
        op: String,

        /// Fields as key=value; numeric values are sent as numbers
        fields: Vec<String>,

        /// Wait for this event after sending
        #[arg(long)]
        wait: Option<String>,
    },

    /// Print events as they arrive
    Watch {
        /// Stop after this many events
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Add, list and remove an entity against a live worker
    Smoke,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SwarmConfig::default();
    if let Some(dir) = cli.socket_dir {
        config.socket_dir = dir;
    }

    match cli.command {
        Commands::Send { lines, wait } => {
            let mut events = subscribe_if(&config, wait.is_some())?;
            let mut client = CommandClient::connect(&config.command_socket())?;
            for line in &lines {
                client.send_line(line)?;
            }
            if let (Some(name), Some(events)) = (wait, events.as_mut()) {
                print_until(events, &name)?;
            }
        }

        Commands::Op { op, fields, wait } => {
            let fields = parse_fields(&fields)?;
            let mut events = subscribe_if(&config, wait.is_some())?;
            let mut client = CommandClient::connect(&config.command_socket())?;
            client.send_op(&op, Value::Object(fields))?;
            if let (Some(name), Some(events)) = (wait, events.as_mut()) {
                print_until(events, &name)?;
            }
        }

        Commands::Watch { count } => {
            let mut events = EventSubscriber::connect(&config.event_socket())?;
            let mut seen = 0;
            while count.is_none_or(|limit| seen < limit) {
                match events.next_event(Duration::from_secs(3600)) {
                    Ok(event) => {
                        println!("{event}");
                        seen += 1;
                    }
                    Err(ClientError::Timeout(_)) => continue,
                    Err(ClientError::Closed) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Commands::Smoke => smoke(&config)?,
    }

    Ok(())
}

fn subscribe_if(config: &SwarmConfig, wanted: bool) -> Result<Option<EventSubscriber>> {
    if !wanted {
        return Ok(None);
    }
    let events = EventSubscriber::connect(&config.event_socket())
        .with_context(|| format!("Failed to subscribe: {:?}", config.event_socket()))?;
    Ok(Some(events))
}

fn print_until(events: &mut EventSubscriber, name: &str) -> Result<()> {
    for event in events.collect_until(name, Duration::from_secs(5))? {
        println!("{event}");
    }
    Ok(())
}

fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected key=value, got {pair:?}");
        };
        let value = match value.parse::<f64>() {
            Ok(number) if number.is_finite() => json!(number),
            _ => Value::String(value.to_string()),
        };
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn smoke(config: &SwarmConfig) -> Result<()> {
    let timeout = Duration::from_secs(5);
    let mut events = EventSubscriber::connect(&config.event_socket())?;
    let mut client = CommandClient::connect(&config.command_socket())?;

    client.send_op("cursor/add", json!({"behavior": "orbit", "radius": 40}))?;
    let added = events.wait_for("added", timeout)?;
    let id = added
        .get("id")
        .and_then(Value::as_u64)
        .context("added event without id")?;
    println!("added entity {id}");

    client.send_op("cursor/list", Value::Null)?;
    let listed = events
        .collect_until("listDone", timeout)?
        .iter()
        .filter(|event| event_name(event) == Some("cursor"))
        .count();
    println!("listed {listed} entities");

    client.send_op("cursor/remove", json!({"id": id}))?;
    let removed = events.wait_for("removed", timeout)?;
    if removed.get("ok") != Some(&Value::Bool(true)) {
        bail!("remove failed: {removed}");
    }
    println!("removed entity {id}");
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_keep_numbers_numeric() {
        let fields = parse_fields(&["behavior=orbit".into(), "radius=40".into()]).unwrap();
        assert_eq!(fields["behavior"], json!("orbit"));
        assert_eq!(fields["radius"], json!(40.0));
        assert!(parse_fields(&["oops".into()]).is_err());
    }
}
