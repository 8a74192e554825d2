//! Worker runtime: settings, startup and the task set
//!
//! `Runtime` wires the shared [`Context`] to the sockets and background
//! tasks. `start` binds everything and returns a handle; `run` additionally
//! waits for `exit` or Ctrl-C and cleans up.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod behavior;
pub mod channel;
pub mod command;
pub mod entity;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod pointer;
pub mod record;
pub mod scheduler;
pub mod script;
pub mod service;
pub mod service_client;
pub mod storage;
pub mod store;

use channel::{InboundPool, bind_socket};
use entity::{Behavior, Color, Entity, Point};
use pointer::{PointerDriver, VirtualPointer};
use service::{Context, Service};

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Directory holding the state, config and heartbeat files
    pub root: PathBuf,

    /// Directory holding the command, event and script sockets
    pub socket_dir: PathBuf,

    /// Concurrent command socket workers
    pub listener_count: usize,

    /// Longest accepted command line in bytes
    pub max_line_len: usize,

    /// Longest accepted script line in bytes
    pub script_line_len: usize,

    /// Tick period
    pub tick_interval_ms: u64,

    /// Liveness file period
    pub heartbeat_interval_ms: u64,

    /// Config file poll period
    pub config_poll_interval_ms: u64,

    /// Executable that runs scripts
    pub script_host: String,

    /// How long a script gets to exit after SIGTERM
    pub script_grace_ms: u64,

    /// Entity limit
    pub max_entities: usize,

    /// Event subscriber queue length
    pub event_queue: usize,

    /// Start with a handful of demo entities
    pub seed_entities: bool,

    /// State file name, relative to `root`
    pub state_file: String,

    /// Config file name, relative to `root`
    pub config_file: String,

    /// Liveness file name, relative to `root`
    pub heartbeat_file: String,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            socket_dir: std::env::temp_dir().join("swarm"),
            listener_count: 8,
            max_line_len: 4096,
            script_line_len: 1024,
            tick_interval_ms: 16,
            heartbeat_interval_ms: 1000,
            config_poll_interval_ms: 750,
            script_host: String::from("sh"),
            script_grace_ms: 500,
            max_entities: 1024,
            event_queue: 1024,
            seed_entities: true,
            state_file: String::from("swarm_state.jsonl"),
            config_file: String::from("swarm_config.jsonl"),
            heartbeat_file: String::from("swarm_heartbeat.txt"),
            debug: false,
        }
    }
}

impl SwarmConfig {
    /// Settings with every path rooted under `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            socket_dir: dir.join("sockets"),
            root: dir,
            ..Self::default()
        }
    }

    /// Command socket path.
    pub fn command_socket(&self) -> PathBuf {
        self.socket_dir.join("command.sock")
    }

    /// Event socket path.
    pub fn event_socket(&self) -> PathBuf {
        self.socket_dir.join("events.sock")
    }
}

/// Demo entities: three mirrors, one orbit, one follower.
pub fn seed_entities() -> Vec<Entity> {
    let mut seeds: Vec<Entity> = (0..3u8)
        .map(|i| {
            Entity::new(Behavior::Mirror {
                offset_x: f64::from(i) * 18.0,
                offset_y: f64::from(i % 2) * 18.0,
            })
            .with_size(10 + 2 * u32::from(i))
            .with_color(Color::rgb(40 + i * 60, 200 - i * 40, 120 + i * 40))
        })
        .collect();
    seeds.push(
        Entity::new(Behavior::Orbit {
            radius: 90.0,
            speed: 1.0,
            angle: 0.0,
        })
        .with_size(14)
        .with_color(Color::rgb(255, 120, 30)),
    );
    seeds.push(
        Entity::new(Behavior::FollowLag {
            lag_ms: 300.0,
            initialized: false,
        })
        .with_color(Color::rgb(150, 150, 255)),
    );
    seeds
}

/// The worker orchestrator
pub struct Runtime {
    ctx: Arc<Context>,
    service: Service,
    removals: tokio::sync::mpsc::UnboundedReceiver<entity::EntityId>,
}

impl Runtime {
    /// Worker with a headless pointer.
    pub fn new(config: SwarmConfig) -> Self {
        Self::with_pointer(config, Arc::new(VirtualPointer::new(Point::default())))
    }

    /// Worker driven by `pointer`.
    pub fn with_pointer(config: SwarmConfig, pointer: Arc<dyn PointerDriver>) -> Self {
        let (ctx, removals) = Context::new(config, pointer);
        let ctx = Arc::new(ctx);
        Self {
            service: Service::new(ctx.clone()),
            ctx,
            removals,
        }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Command dispatcher.
    pub fn service(&self) -> Service {
        self.service.clone()
    }

    /// Bind the sockets, replay startup files and spawn every task.
    pub async fn start(self) -> Result<RunningRuntime> {
        let Runtime {
            ctx,
            service,
            removals,
        } = self;
        let config = &ctx.config;

        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("Failed to create root directory: {:?}", config.root))?;
        let command_path = config.command_socket();
        let event_path = config.event_socket();
        let commands = bind_socket(&command_path)
            .with_context(|| format!("Failed to bind command socket: {:?}", command_path))?;
        let events = bind_socket(&event_path)
            .with_context(|| format!("Failed to bind event socket: {:?}", event_path))?;

        if config.seed_entities {
            for entity in seed_entities() {
                ctx.store.add(entity)?;
            }
        }
        let replayed = service.poll_config(true).await;
        if ctx.state.exists() {
            let state = ctx.state.clone();
            match storage::offload(move || state.load()).await {
                Ok(lines) => {
                    let loaded = service.replay(&lines).await;
                    tracing::info!(loaded, "restored saved state");
                }
                Err(e) => tracing::warn!(error = %e, "failed to read saved state"),
            }
        }
        tracing::info!(
            entities = ctx.store.len(),
            config_commands = replayed,
            "startup complete"
        );

        let shutdown = ctx.subscribe_shutdown();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(scheduler::run_ticker(
            ctx.store.clone(),
            ctx.pointer.clone(),
            ctx.stats.clone(),
            Duration::from_millis(config.tick_interval_ms.max(1)),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(heartbeat::run_heartbeat(
            ctx.storage.heartbeat_path().to_path_buf(),
            ctx.store.clone(),
            ctx.stats.clone(),
            Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(watch_config(
            service.clone(),
            Duration::from_millis(config.config_poll_interval_ms.max(1)),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            service.clone().forward_removals(removals, shutdown.clone()),
        ));
        tasks.push(tokio::spawn(channel::run_event_server(
            events,
            ctx.events.clone(),
            shutdown.clone(),
        )));

        let pool = InboundPool::spawn(
            Arc::new(commands),
            config.listener_count,
            service.clone(),
            config.max_line_len,
            shutdown,
        );

        tracing::info!(
            commands = %command_path.display(),
            events = %event_path.display(),
            workers = pool.len(),
            "swarm listening"
        );

        Ok(RunningRuntime {
            ctx,
            service,
            pool,
            tasks,
        })
    }

    /// Start, then serve until `exit` or Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        let ctx = running.context().clone();
        let mut shutdown = ctx.subscribe_shutdown();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                ctx.request_shutdown();
            }
            _ = wait_for_shutdown(&mut shutdown) => {}
        }

        running.wait().await;
        Ok(())
    }
}

/// A started worker.
pub struct RunningRuntime {
    ctx: Arc<Context>,
    service: Service,
    pool: InboundPool,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningRuntime {
    /// Shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Command dispatcher.
    pub fn service(&self) -> Service {
        self.service.clone()
    }

    /// Request shutdown and wait for it.
    pub async fn shutdown(self) {
        self.ctx.request_shutdown();
        self.wait().await;
    }

    /// Wait for shutdown, join every task, stop every script and remove the
    /// sockets.
    pub async fn wait(self) {
        let mut shutdown = self.ctx.subscribe_shutdown();
        wait_for_shutdown(&mut shutdown).await;

        self.pool.join().await;
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "runtime task panicked");
            }
        }
        self.ctx.scripts.shutdown_all().await;

        for path in [
            self.ctx.config.command_socket(),
            self.ctx.config.event_socket(),
        ] {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove socket");
            }
        }
        tracing::info!("swarm stopped");
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel means the context is gone, which is shutdown too.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn watch_config(service: Service, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    // Startup already did the forced replay.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let count = service.poll_config(false).await;
                if count > 0 {
                    tracing::info!(count, "config file changed, replayed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
