//! Command dispatcher for the swarm worker.
//!
//! Every command line from every client ends up in [`Service::execute_line`].
//! The service is cheap to clone; all state lives in the shared [`Context`].
//! Failures never escape: protocol, store and storage errors become `error`
//! events and the connection carries on.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::SwarmConfig;
use super::command::{Action, Command, MODERN_OPS};
use super::entity::{Behavior, BehaviorKind, Entity, EntityId};
use super::error::{ProtocolError, StorageError, StoreError};
use super::event::{Event, EventBus};
use super::pointer::{Button, PointerDriver};
use super::scheduler::FrameStats;
use super::script::ScriptSupervisor;
use super::storage::{ConfigSource, StateFile, Storage, offload};
use super::store::EntityStore;

/// Pause between press and the second move of a drag.
pub const DRAG_PAUSE: Duration = Duration::from_millis(5);

/// Display toggles read by an external renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayFlags {
    /// Opaque debug background instead of a transparent overlay
    pub solid: bool,
    /// Keep the overlay above other windows
    pub topmost: bool,
    /// Framed window instead of a full-screen overlay
    pub windowed: bool,
    /// Capture keyboard input
    pub capture_keys: bool,
    /// Capture clicks instead of passing them through
    pub capture_clicks: bool,
    /// Capture pointer motion
    pub capture_mouse: bool,
}

impl Default for DisplayFlags {
    fn default() -> Self {
        Self {
            solid: false,
            topmost: true,
            windowed: false,
            capture_keys: false,
            capture_clicks: false,
            capture_mouse: false,
        }
    }
}

impl DisplayFlags {
    /// Apply a `debug` mode name.
    pub fn apply(&mut self, mode: &str) -> Result<(), ProtocolError> {
        match mode {
            "solidOn" => self.solid = true,
            "solidOff" => self.solid = false,
            "topOn" => self.topmost = true,
            "topOff" => self.topmost = false,
            "windowed" => self.windowed = true,
            "overlay" => self.windowed = false,
            "keysOn" => self.capture_keys = true,
            "keysOff" => self.capture_keys = false,
            "clickOn" => self.capture_clicks = true,
            "clickOff" => self.capture_clicks = false,
            "mouseOn" => self.capture_mouse = true,
            "mouseOff" => self.capture_mouse = false,
            other => return Err(ProtocolError::UnknownMode(other.to_string())),
        }
        Ok(())
    }
}

/// Everything a running worker shares between its tasks.
pub struct Context {
    /// Worker settings
    pub config: SwarmConfig,
    /// Resolved file locations
    pub storage: Storage,
    /// Live entities
    pub store: Arc<EntityStore>,
    /// Outbound events
    pub events: Arc<EventBus>,
    /// Script channels and subprocesses
    pub scripts: ScriptSupervisor,
    /// Reference point source and pointer action sink
    pub pointer: Arc<dyn PointerDriver>,
    /// Frame time statistics
    pub stats: Arc<FrameStats>,
    /// Entity state file
    pub state: StateFile,
    /// Hot-reloaded command file
    pub config_source: Arc<ConfigSource>,
    /// Renderer toggles
    pub display: Mutex<DisplayFlags>,
    api_count: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Context {
    /// Build a context from settings. The receiver yields script removal
    /// requests and must be handed to [`Service::forward_removals`].
    pub fn new(
        config: SwarmConfig,
        pointer: Arc<dyn PointerDriver>,
    ) -> (Self, mpsc::UnboundedReceiver<EntityId>) {
        let storage = Storage::new(&config);
        let store = Arc::new(EntityStore::new(config.max_entities));
        let events = Arc::new(EventBus::new(config.event_queue));
        let (scripts, removals) = ScriptSupervisor::new(
            &config.socket_dir,
            config.script_host.clone(),
            Duration::from_millis(config.script_grace_ms),
            config.script_line_len,
            store.clone(),
            events.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        let context = Self {
            state: StateFile::new(storage.state_path()),
            config_source: Arc::new(ConfigSource::new(storage.config_path())),
            storage,
            store,
            events,
            scripts,
            pointer,
            stats: Arc::new(FrameStats::new()),
            display: Mutex::new(DisplayFlags::default()),
            api_count: AtomicU64::new(0),
            shutdown,
            config,
        };
        (context, removals)
    }

    /// Commands handled since start.
    pub fn api_count(&self) -> u64 {
        self.api_count.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every task to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Command dispatcher.
#[derive(Clone)]
pub struct Service {
    ctx: Arc<Context>,
}

impl Service {
    /// Create a dispatcher over `ctx`.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Parse and run one command line. Lines naming no operation are
    /// ignored; unknown operations produce one `error` event.
    pub async fn execute_line(&self, line: &str) {
        match Command::parse(line) {
            Ok(Some(command)) => self.execute(command).await,
            Ok(None) => tracing::trace!(line, "ignoring line without an operation"),
            Err(e) => {
                self.ctx.api_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(line, error = %e, "rejected command");
                self.ctx.events.emit(Event::error(e));
            }
        }
    }

    /// Run one command.
    ///
    /// Boxed because `load` and `reload` replay files through this same
    /// path.
    pub fn execute(&self, command: Command) -> BoxFuture<'_, ()> {
        async move {
            self.ctx.api_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(action = ?command.action, "command");
            if let Err(e) = self.dispatch(&command).await {
                tracing::debug!(action = ?command.action, error = %e, "command failed");
                self.ctx.events.emit(Event::error(e));
            }
        }
        .boxed()
    }

    async fn dispatch(&self, command: &Command) -> Result<(), ServiceError> {
        match command.action {
            Action::Add => self.cmd_add(command).await,
            Action::Remove => self.cmd_remove(command).await,
            Action::Set => self.cmd_set(command).await,
            Action::Tweak => self.cmd_tweak(command),
            Action::Clear => self.cmd_clear().await,
            Action::List => self.cmd_list(),
            Action::Perf => self.cmd_perf(),
            Action::Save => self.cmd_save().await,
            Action::Load => self.cmd_load().await,
            Action::Reload => self.cmd_reload().await,
            Action::Exit => self.cmd_exit(),
            Action::Click | Action::Down | Action::Up | Action::Drag => {
                self.cmd_pointer(command).await
            }
            Action::SetScriptHost => self.cmd_set_script_host(command),
            Action::Debug => self.cmd_debug(command),
            Action::Help => self.cmd_help(),
        }
    }

    async fn cmd_add(&self, command: &Command) -> Result<(), ServiceError> {
        let kind = command.behavior()?.unwrap_or(BehaviorKind::Mirror);
        let fields = command.entity_fields()?;

        let mut entity = Entity::new(Behavior::default_for(kind));
        fields.apply(&mut entity);
        entity.id = command.requested_id().unwrap_or(0);

        let outcome = self.ctx.store.add(entity)?;
        if let Some(requested) = outcome.renumbered_from {
            tracing::info!(requested, id = outcome.id, "explicit id taken, renumbered");
        }
        self.ctx.events.emit(Event::Added {
            id: outcome.id,
            behavior: kind.code(),
            requested_id: outcome.renumbered_from,
        });

        if kind == BehaviorKind::Scripted {
            // Failures are reported as `scriptError`; the entity stays.
            let _ = self.ctx.scripts.launch(outcome.id).await;
        }
        Ok(())
    }

    /// Tear down any script of `id`, then remove it. Emits `removed`.
    pub async fn remove(&self, id: EntityId) -> bool {
        let store = &self.ctx.store;
        let ok = self
            .ctx
            .scripts
            .retire(id, || store.remove(id).is_some())
            .await;
        self.ctx.events.emit(Event::Removed { id, ok });
        ok
    }

    async fn cmd_remove(&self, command: &Command) -> Result<(), ServiceError> {
        let id = command.target_id()?;
        self.remove(id).await;
        Ok(())
    }

    async fn cmd_set(&self, command: &Command) -> Result<(), ServiceError> {
        let id = command.target_id()?;
        let kind = command.behavior()?;
        let fields = command.entity_fields()?;

        let current = self
            .ctx
            .store
            .get(id)
            .ok_or(ProtocolError::UnknownEntity(id))?;
        let switching = kind.is_some_and(|k| k != current.kind());
        if switching && current.kind() == BehaviorKind::Scripted {
            self.ctx.scripts.teardown(id).await;
        }

        let updated = self
            .ctx
            .store
            .update(id, |entity| {
                if let Some(kind) = kind
                    && kind != entity.kind()
                {
                    entity.behavior = Behavior::default_for(kind);
                }
                fields.apply(entity);
                entity.kind()
            })
            .ok_or(ProtocolError::UnknownEntity(id))?;

        self.ctx.events.emit(Event::Updated {
            id,
            behavior: updated.code(),
        });

        if updated == BehaviorKind::Scripted && fields.script.is_some() {
            let _ = self.ctx.scripts.launch(id).await;
        }
        Ok(())
    }

    fn cmd_tweak(&self, command: &Command) -> Result<(), ServiceError> {
        let id = command.target_id()?;
        let fields = command.tweak_fields()?;
        self.ctx
            .store
            .update(id, |entity| fields.apply(entity))
            .ok_or(ProtocolError::UnknownEntity(id))?;
        self.ctx.events.emit(Event::Tweaked { id });
        Ok(())
    }

    async fn cmd_clear(&self) -> Result<(), ServiceError> {
        let store = &self.ctx.store;
        let count = self.ctx.scripts.retire_all(|| store.clear().len()).await;
        tracing::info!(count, "cleared entities");
        self.ctx.events.emit(Event::Cleared { count });
        Ok(())
    }

    fn cmd_list(&self) -> Result<(), ServiceError> {
        for entity in self.ctx.store.snapshot() {
            self.ctx.events.emit(Event::Cursor {
                id: entity.id,
                behavior: entity.kind().code(),
                x: entity.position.x.round() as i64,
                y: entity.position.y.round() as i64,
            });
        }
        self.ctx.events.emit(Event::ListDone);
        Ok(())
    }

    fn cmd_perf(&self) -> Result<(), ServiceError> {
        self.ctx.events.emit(Event::Perf {
            fps: self.ctx.stats.fps(),
            avg_frame_ms: self.ctx.stats.avg_frame_ms(),
            cursor_count: self.ctx.store.len(),
            api_count: self.ctx.api_count(),
        });
        Ok(())
    }

    async fn cmd_save(&self) -> Result<(), ServiceError> {
        let entities = self.ctx.store.snapshot();
        let state = self.ctx.state.clone();
        let count = offload(move || state.save(&entities)).await?;
        let path = self.ctx.state.path().display().to_string();
        tracing::info!(count, path = %path, "state saved");
        self.ctx.events.emit(Event::Saved { count, path });
        Ok(())
    }

    async fn cmd_load(&self) -> Result<(), ServiceError> {
        let state = self.ctx.state.clone();
        let lines = offload(move || state.load()).await?;
        let count = self.replay(&lines).await;
        tracing::info!(count, "state loaded");
        self.ctx.events.emit(Event::Loaded { count });
        Ok(())
    }

    async fn cmd_reload(&self) -> Result<(), ServiceError> {
        match self.poll_config_file(true).await? {
            Some(lines) => {
                let count = self.replay(&lines).await;
                tracing::info!(count, "config reloaded");
                Ok(())
            }
            None => Err(StorageError::PathNotFound(self.ctx.config_source.path().to_path_buf()).into()),
        }
    }

    /// Run stored command lines. `load` and `reload` records are skipped so
    /// a file cannot replay itself. Returns the number of commands run.
    pub async fn replay(&self, lines: &[String]) -> usize {
        let mut count = 0;
        for line in lines {
            match Command::parse(line) {
                Ok(Some(command)) if matches!(command.action, Action::Load | Action::Reload) => {
                    tracing::warn!(line, "skipping nested replay");
                }
                Ok(Some(command)) => {
                    self.execute(command).await;
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(line, error = %e, "skipping bad stored command");
                    self.ctx.events.emit(Event::error(e));
                }
            }
        }
        count
    }

    /// Replay the config file if it changed since the last poll.
    pub async fn poll_config(&self, force: bool) -> usize {
        match self.poll_config_file(force).await {
            Ok(Some(lines)) => self.replay(&lines).await,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "config poll failed");
                0
            }
        }
    }

    async fn poll_config_file(&self, force: bool) -> Result<Option<Vec<String>>, StorageError> {
        let source = self.ctx.config_source.clone();
        offload(move || source.poll(force)).await
    }

    fn cmd_exit(&self) -> Result<(), ServiceError> {
        tracing::info!("exit requested");
        self.ctx.events.emit(Event::Exiting);
        self.ctx.request_shutdown();
        Ok(())
    }

    async fn cmd_pointer(&self, command: &Command) -> Result<(), ServiceError> {
        let id = command.target_id()?;
        let button = Button::from_index(command.button()?);
        let start = self
            .ctx
            .store
            .position(id)
            .ok_or(ProtocolError::UnknownEntity(id))?;
        let pointer = &self.ctx.pointer;

        match command.action {
            Action::Click => {
                pointer.move_to(start);
                pointer.press(button);
                pointer.release(button);
            }
            Action::Down => {
                pointer.move_to(start);
                pointer.press(button);
            }
            Action::Up => {
                pointer.move_to(start);
                pointer.release(button);
            }
            Action::Drag => {
                let target = command.drag_target(start)?;
                pointer.move_to(start);
                pointer.press(button);
                tokio::time::sleep(DRAG_PAUSE).await;
                pointer.move_to(target);
                pointer.release(button);
            }
            _ => {}
        }
        Ok(())
    }

    fn cmd_set_script_host(&self, command: &Command) -> Result<(), ServiceError> {
        let path = command
            .text("path")
            .filter(|p| !p.trim().is_empty())
            .ok_or(ProtocolError::MissingField("path"))?;
        self.ctx.scripts.set_host(path);
        tracing::info!(path, "script host changed");
        self.ctx.events.emit(Event::AhkPath {
            path: path.to_string(),
        });
        Ok(())
    }

    fn cmd_debug(&self, command: &Command) -> Result<(), ServiceError> {
        let mode = command
            .text("mode")
            .ok_or(ProtocolError::MissingField("mode"))?;
        self.ctx.display.lock().apply(mode)?;
        tracing::info!(mode, "display mode changed");
        Ok(())
    }

    fn cmd_help(&self) -> Result<(), ServiceError> {
        for (op, _) in MODERN_OPS {
            self.ctx.events.emit(Event::Help {
                op: op.to_string(),
            });
        }
        self.ctx.events.emit(Event::HelpDone);
        Ok(())
    }

    /// Route script removal requests through [`Service::remove`] until
    /// shutdown.
    pub async fn forward_removals(
        self,
        mut removals: mpsc::UnboundedReceiver<EntityId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                id = removals.recv() => {
                    let Some(id) = id else { break };
                    tracing::info!(id, "script requested removal");
                    self.remove(id).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_modes() {
        let mut flags = DisplayFlags::default();
        flags.apply("solidOn").unwrap();
        flags.apply("topOff").unwrap();
        flags.apply("windowed").unwrap();
        flags.apply("clickOn").unwrap();
        assert!(flags.solid);
        assert!(!flags.topmost);
        assert!(flags.windowed);
        assert!(flags.capture_clicks);

        flags.apply("overlay").unwrap();
        assert!(!flags.windowed);
        assert_eq!(
            flags.apply("sparkles"),
            Err(ProtocolError::UnknownMode("sparkles".into()))
        );
    }
}
