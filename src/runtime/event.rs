//! Outbound events and the single-subscriber event bus
//!
//! Events are serialized to one JSON object per line with an `event` tag.
//! Delivery is best-effort: with no subscriber attached, or a subscriber that
//! cannot keep up, events are dropped and counted.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::entity::EntityId;

/// One outbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// First frame on every new subscription
    Connected,
    /// An entity was created
    Added {
        /// Assigned id
        id: EntityId,
        /// Behavior code
        behavior: u8,
        /// Explicit id that was taken, when the entity was renumbered
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_id: Option<EntityId>,
    },
    /// An entity was changed by `set`
    Updated {
        /// Entity id
        id: EntityId,
        /// Behavior code after the change
        behavior: u8,
    },
    /// Result of a `remove`
    Removed {
        /// Requested id
        id: EntityId,
        /// Whether an entity was removed
        ok: bool,
    },
    /// Result of a `clear`
    Cleared {
        /// Number of entities removed
        count: usize,
    },
    /// One entity during `list`
    Cursor {
        /// Entity id
        id: EntityId,
        /// Behavior code
        behavior: u8,
        /// Rounded horizontal position
        x: i64,
        /// Rounded vertical position
        y: i64,
    },
    /// End of a `list`
    ListDone,
    /// Frame statistics
    Perf {
        /// Frames per second derived from the average frame time
        fps: f64,
        /// Exponential moving average of frame time
        avg_frame_ms: f64,
        /// Live entities
        cursor_count: usize,
        /// Commands handled since start
        api_count: u64,
    },
    /// A command was rejected
    Error {
        /// Human-readable reason
        msg: String,
    },
    /// The worker is shutting down
    Exiting,
    /// A script subprocess started
    ScriptLaunched {
        /// Owning entity
        id: EntityId,
        /// Process id
        pid: u32,
    },
    /// A script could not be started or connected
    ScriptError {
        /// Owning entity
        id: EntityId,
        /// Failure code
        code: String,
    },
    /// A script connected to its private channel
    ScriptPipeConnected {
        /// Owning entity
        id: EntityId,
    },
    /// A script subprocess exited on its own
    ScriptExit {
        /// Owning entity
        id: EntityId,
        /// Exit code, -1 when terminated by a signal
        code: i32,
    },
    /// A script wrote a log line
    ScriptLog {
        /// Owning entity
        id: EntityId,
        /// Logged text
        msg: String,
    },
    /// An entity was changed by `tweak`
    Tweaked {
        /// Entity id
        id: EntityId,
    },
    /// One supported operation during `help`
    Help {
        /// Modern operation name
        op: String,
    },
    /// End of a `help`
    HelpDone,
    /// The script host changed
    AhkPath {
        /// New script host
        path: String,
    },
    /// The state file was written
    Saved {
        /// Entities written
        count: usize,
        /// State file path
        path: String,
    },
    /// The state file was replayed
    Loaded {
        /// Records replayed
        count: usize,
    },
}

impl Event {
    /// Shorthand for an error event.
    pub fn error(msg: impl ToString) -> Event {
        Event::Error {
            msg: msg.to_string(),
        }
    }

    /// Serialize to one line, without the trailing newline.
    pub fn to_line(&self) -> String {
        // Every field is a plain scalar, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"event":"error"}"#))
    }
}

/// Single-subscriber event fan-out.
#[derive(Debug)]
pub struct EventBus {
    subscriber: Mutex<Option<mpsc::Sender<String>>>,
    capacity: usize,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscriber queue holds `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriber: Mutex::new(None),
            capacity: capacity.max(1),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a subscriber, replacing any previous one. The returned queue
    /// always starts with a `connected` event.
    pub fn attach(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let _ = tx.try_send(Event::Connected.to_line());
        if self.subscriber.lock().replace(tx).is_some() {
            tracing::debug!("event subscriber replaced");
        }
        rx
    }

    /// Detach the current subscriber.
    pub fn detach(&self) {
        self.subscriber.lock().take();
    }

    /// Whether a subscriber is attached.
    pub fn is_attached(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    /// Deliver `event` to the subscriber, or drop it.
    pub fn emit(&self, event: Event) {
        let mut guard = self.subscriber.lock();
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(event.to_line()) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?event, "event queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                guard.take();
                tracing::debug!("event subscriber gone, detaching");
            }
        }
    }

    /// Events delivered to a subscriber queue.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events dropped for lack of a subscriber or queue space.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
