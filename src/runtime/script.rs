//! Script subprocess supervision
//!
//! Each scripted entity gets a private socket at
//! `socket_dir/script-<id>.sock` and a subprocess started as
//! `<host> <script> <id> <socket path>`. A reader task relays the script's
//! line protocol into the store; a waiter task owns the child process.
//!
//! Teardown is ordered: stop input, end the process, release the socket.
//! It only returns once the reader and waiter have both finished, so no
//! handle outlives the entity.
//!
//! Launch, teardown and removal of one id are serialized on a per-id slot
//! lock. A channel is only registered while its entity is still in the
//! store; the check and the insert happen under the channel map lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as SlotLock, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::channel::{bind_socket, LineAssembler, ACCEPT_BACKOFF};
use super::entity::{Behavior, Color, EntityId, Point};
use super::error::ScriptError;
use super::event::{Event, EventBus};
use super::store::EntityStore;

/// One line of the script protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptMessage {
    /// `pos x y`
    Pos(Point),
    /// `color #RRGGBB`
    Color(Color),
    /// `remove`
    Remove,
    /// `log <text>`
    Log(String),
}

impl ScriptMessage {
    /// Parse one line. Unknown or malformed lines yield `None`.
    pub fn parse(line: &str) -> Option<ScriptMessage> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "pos" => {
                let mut parts = rest.split_whitespace();
                let x: f64 = parts.next()?.parse().ok()?;
                let y: f64 = parts.next()?.parse().ok()?;
                (x.is_finite() && y.is_finite()).then_some(ScriptMessage::Pos(Point::new(x, y)))
            }
            "color" => Color::parse(rest.trim()).map(ScriptMessage::Color),
            "remove" if rest.trim().is_empty() => Some(ScriptMessage::Remove),
            "log" => Some(ScriptMessage::Log(rest.to_string())),
            _ => None,
        }
    }
}

/// Removes the socket path when dropped.
#[derive(Debug)]
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.0.display(), error = %e, "failed to remove script socket");
        }
    }
}

struct ScriptProcess {
    pid: u32,
    terminate: oneshot::Sender<()>,
    waiter: JoinHandle<()>,
}

struct ScriptChannel {
    socket: SocketFile,
    stop_input: watch::Sender<bool>,
    reader: JoinHandle<()>,
    process: Option<ScriptProcess>,
}

impl ScriptChannel {
    async fn close(self, id: EntityId) {
        let _ = self.stop_input.send(true);
        if let Err(e) = self.reader.await {
            tracing::error!(id, error = %e, "script reader panicked");
        }
        if let Some(process) = self.process {
            let _ = process.terminate.send(());
            if let Err(e) = process.waiter.await {
                tracing::error!(id, pid = process.pid, error = %e, "script waiter panicked");
            }
        }
        drop(self.socket);
    }
}

/// Shared pieces each reader and waiter task needs.
#[derive(Clone)]
struct TaskContext {
    id: EntityId,
    store: Arc<EntityStore>,
    events: Arc<EventBus>,
    removals: mpsc::UnboundedSender<EntityId>,
}

/// Owner of every script channel and subprocess.
pub struct ScriptSupervisor {
    socket_dir: PathBuf,
    host: Mutex<String>,
    grace: Duration,
    line_limit: usize,
    store: Arc<EntityStore>,
    events: Arc<EventBus>,
    removals: mpsc::UnboundedSender<EntityId>,
    channels: Mutex<HashMap<EntityId, ScriptChannel>>,
    slots: Mutex<HashMap<EntityId, Arc<SlotLock<()>>>>,
}

impl ScriptSupervisor {
    /// Create a supervisor. The returned receiver yields ids whose scripts
    /// asked to be removed; the owner must route them through its normal
    /// remove path.
    pub fn new(
        socket_dir: impl Into<PathBuf>,
        host: impl Into<String>,
        grace: Duration,
        line_limit: usize,
        store: Arc<EntityStore>,
        events: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<EntityId>) {
        let (removals, removal_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            socket_dir: socket_dir.into(),
            host: Mutex::new(host.into()),
            grace,
            line_limit,
            store,
            events,
            removals,
            channels: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        };
        (supervisor, removal_rx)
    }

    /// Executable used to run scripts.
    pub fn host(&self) -> String {
        self.host.lock().clone()
    }

    /// Change the executable used for future launches.
    pub fn set_host(&self, host: impl Into<String>) {
        *self.host.lock() = host.into();
    }

    /// Private socket path for entity `id`.
    pub fn socket_path(&self, id: EntityId) -> PathBuf {
        self.socket_dir.join(format!("script-{id}.sock"))
    }

    /// Whether entity `id` has a live channel.
    pub fn is_active(&self, id: EntityId) -> bool {
        self.channels.lock().contains_key(&id)
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Pid of the subprocess for entity `id`, if one was started.
    pub fn pid(&self, id: EntityId) -> Option<u32> {
        self.channels
            .lock()
            .get(&id)
            .and_then(|c| c.process.as_ref().map(|p| p.pid))
    }

    async fn lock_slot(&self, id: EntityId) -> OwnedMutexGuard<()> {
        let slot = self.slots.lock().entry(id).or_default().clone();
        slot.lock_owned().await
    }

    /// Drop the slot of `id` unless another task is waiting on it.
    fn release_slot(&self, id: EntityId, guard: OwnedMutexGuard<()>) {
        let mut slots = self.slots.lock();
        let idle = slots
            .get(&id)
            .is_some_and(|slot| Arc::strong_count(slot) == 2);
        drop(guard);
        if idle {
            slots.remove(&id);
        }
    }

    /// Start the script of entity `id`, replacing any running one.
    ///
    /// Emits `scriptLaunched` on success and `scriptError` on failure. A
    /// failed launch leaves the entity in the store, undriven.
    pub async fn launch(&self, id: EntityId) -> Result<u32, ScriptError> {
        let guard = self.lock_slot(id).await;
        self.close_channel(id).await;

        let result = self.start(id).await;
        self.release_slot(id, guard);
        match &result {
            Ok(pid) => {
                tracing::info!(id, pid, "script launched");
                self.events.emit(Event::ScriptLaunched { id, pid: *pid });
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "script launch failed");
                self.events.emit(Event::ScriptError {
                    id,
                    code: e.code().to_string(),
                });
            }
        }
        result
    }

    async fn start(&self, id: EntityId) -> Result<u32, ScriptError> {
        let script = self
            .store
            .get(id)
            .and_then(|e| e.behavior.script().cloned())
            .ok_or(ScriptError::MissingScript(id))?;

        let path = self.socket_path(id);
        let listener =
            bind_socket(&path).map_err(|source| ScriptError::CreateChannel { id, source })?;
        let socket = SocketFile(path.clone());

        let ctx = TaskContext {
            id,
            store: self.store.clone(),
            events: self.events.clone(),
            removals: self.removals.clone(),
        };
        let (stop_input, stop_rx) = watch::channel(false);
        let reader = tokio::spawn(read_script(ctx.clone(), listener, stop_rx, self.line_limit));
        let mut channel = ScriptChannel {
            socket,
            stop_input,
            reader,
            process: None,
        };

        let child = match spawn_script(&self.host(), &script, id, &path) {
            Ok(child) => child,
            Err(source) => {
                channel.close(id).await;
                return Err(ScriptError::Launch { id, source });
            }
        };
        let pid = child.id().unwrap_or_default();

        self.store.update(id, |e| e.script_running = true);
        let (terminate, terminate_rx) = oneshot::channel();
        let waiter = tokio::spawn(wait_script(ctx, child, terminate_rx, self.grace));
        channel.process = Some(ScriptProcess {
            pid,
            terminate,
            waiter,
        });

        let registered = {
            let mut channels = self.channels.lock();
            if self.store.contains(id) {
                Ok(channels.insert(id, channel))
            } else {
                Err(channel)
            }
        };
        match registered {
            Ok(None) => Ok(pid),
            Ok(Some(displaced)) => {
                tracing::warn!(id, "replacing an unclosed script channel");
                displaced.close(id).await;
                Ok(pid)
            }
            Err(orphan) => {
                tracing::debug!(id, pid, "entity removed during launch");
                orphan.close(id).await;
                Err(ScriptError::MissingScript(id))
            }
        }
    }

    /// Tear down the channel and subprocess of entity `id`.
    ///
    /// Returns `false` if there was nothing to tear down.
    pub async fn teardown(&self, id: EntityId) -> bool {
        let guard = self.lock_slot(id).await;
        let closed = self.close_channel(id).await;
        self.release_slot(id, guard);
        closed
    }

    /// Tear down the script of `id`, then run `remove` before any launch of
    /// the same id can start. Returns what `remove` returned.
    pub async fn retire<R>(&self, id: EntityId, remove: impl FnOnce() -> R) -> R {
        let guard = self.lock_slot(id).await;
        self.close_channel(id).await;
        let removed = remove();
        self.release_slot(id, guard);
        removed
    }

    async fn close_channel(&self, id: EntityId) -> bool {
        let channel = self.channels.lock().remove(&id);
        let Some(channel) = channel else {
            return false;
        };
        channel.close(id).await;
        self.store.update(id, |e| e.script_running = false);
        tracing::debug!(id, "script torn down");
        true
    }

    /// Wait out in-flight launches, tear down every channel and run `clear`
    /// while no channel can be registered.
    pub async fn retire_all<R>(&self, clear: impl FnOnce() -> R) -> R {
        let mut slots: Vec<_> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        slots.sort_unstable_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            guards.push(slot.lock_owned().await);
        }

        let (channels, cleared) = {
            let mut channels = self.channels.lock();
            let drained: Vec<_> = channels.drain().collect();
            (drained, clear())
        };
        let count = channels.len();
        futures::future::join_all(
            channels
                .into_iter()
                .map(|(id, channel)| async move { channel.close(id).await }),
        )
        .await;
        drop(guards);
        self.slots.lock().retain(|_, slot| Arc::strong_count(slot) > 1);
        if count > 0 {
            tracing::info!(count, "scripts shut down");
        }
        cleared
    }

    /// Tear down every channel.
    pub async fn shutdown_all(&self) {
        self.retire_all(|| ()).await;
    }
}

fn spawn_script(host: &str, script: &Path, id: EntityId, socket: &Path) -> std::io::Result<Child> {
    Command::new(host)
        .arg(script)
        .arg(id.to_string())
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn read_script(
    ctx: TaskContext,
    listener: UnixListener,
    mut stop: watch::Receiver<bool>,
    line_limit: usize,
) {
    let id = ctx.id;
    let mut chunk = [0u8; 512];
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => return,
            accepted = listener.accept() => accepted,
        };
        let mut stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!(id, error = %e, "script connect failed");
                ctx.events.emit(Event::ScriptError {
                    id,
                    code: "connect".to_string(),
                });
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                }
            }
        };

        tracing::debug!(id, "script connected");
        ctx.events.emit(Event::ScriptPipeConnected { id });

        let mut assembler = LineAssembler::new(line_limit);
        loop {
            let read = tokio::select! {
                _ = stop.changed() => return,
                read = stream.read(&mut chunk) => read,
            };
            let (lines, eof) = match read {
                Ok(0) | Err(_) => (assembler.finish().into_iter().collect(), true),
                Ok(n) => (assembler.push(&chunk[..n]), false),
            };
            for line in &lines {
                if !relay(&ctx, line) {
                    let _ = ctx.removals.send(id);
                    return;
                }
            }
            if eof {
                break;
            }
        }
        tracing::debug!(id, "script disconnected");
    }
}

/// Apply one script line. Returns `false` when the script asked to be
/// removed.
fn relay(ctx: &TaskContext, line: &str) -> bool {
    match ScriptMessage::parse(line) {
        Some(ScriptMessage::Pos(point)) => {
            ctx.store.update(ctx.id, |entity| {
                entity.position = point;
                if let Behavior::Scripted { target, .. } | Behavior::Static { target } =
                    &mut entity.behavior
                {
                    *target = point;
                }
            });
        }
        Some(ScriptMessage::Color(color)) => {
            ctx.store.update(ctx.id, |entity| entity.color = color);
        }
        Some(ScriptMessage::Log(msg)) => {
            ctx.events.emit(Event::ScriptLog { id: ctx.id, msg });
        }
        Some(ScriptMessage::Remove) => return false,
        None => tracing::trace!(id = ctx.id, line, "ignoring script line"),
    }
    true
}

async fn wait_script(
    ctx: TaskContext,
    mut child: Child,
    terminate: oneshot::Receiver<()>,
    grace: Duration,
) {
    let id = ctx.id;
    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(id, error = %e, "script wait failed");
                    -1
                }
            };
            tracing::info!(id, code, "script exited");
            ctx.store.update(id, |e| e.script_running = false);
            ctx.events.emit(Event::ScriptExit { id, code });
        }
        _ = terminate => {
            terminate_child(id, &mut child, grace).await;
        }
    }
}

/// SIGTERM, wait up to `grace`, then kill.
async fn terminate_child(id: EntityId, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: the child is owned and not yet reaped, so the pid is ours.
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        tracing::debug!(id, pid, "sent SIGTERM to script");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => tracing::debug!(id, "script terminated"),
        Err(_) => {
            tracing::warn!(id, grace_ms = grace.as_millis() as u64, "script ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(id, error = %e, "script kill failed");
            }
        }
    }
}
