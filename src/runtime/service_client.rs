//! Synchronous client for the swarm sockets.
//!
//! [`CommandClient`] writes command lines to the command socket;
//! [`EventSubscriber`] reads event lines from the event socket. Both are
//! plain blocking std sockets so they can be used from a CLI, from tests or
//! from any frontend without a runtime.

use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors produced by the socket clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while talking to the worker.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// An event line was not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The worker closed the connection.
    #[error("connection closed by worker")]
    Closed,
    /// No matching event arrived in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// The worker sent something other than a tagged event.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Connect to `path`, retrying while the worker is still starting.
pub fn connect_with_retry(
    path: &Path,
    attempts: usize,
    delay: Duration,
) -> Result<UnixStream, ClientError> {
    let mut last_err = None;
    for _ in 0..attempts.max(1) {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
                thread::sleep(delay);
            }
        }
    }
    Err(ClientError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "socket not available")
    })))
}

/// Writer side of the command socket.
pub struct CommandClient {
    writer: BufWriter<UnixStream>,
}

impl CommandClient {
    /// Connect to the command socket at `path`.
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = connect_with_retry(path, 50, Duration::from_millis(20))?;
        Ok(Self {
            writer: BufWriter::new(stream),
        })
    }

    /// Send one raw line.
    pub fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.trim_end().as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Send a modern operation with extra fields.
    pub fn send_op(&mut self, op: &str, fields: Value) -> Result<(), ClientError> {
        let mut object = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ClientError::MalformedEvent(format!(
                    "fields must be an object, got {other}"
                )));
            }
        };
        object.insert("op".to_string(), Value::String(op.to_string()));
        self.send_line(&serde_json::to_string(&Value::Object(object))?)
    }
}

/// Reader side of the event socket.
pub struct EventSubscriber {
    reader: BufReader<UnixStream>,
}

impl EventSubscriber {
    /// Connect to the event socket at `path` and wait for the `connected`
    /// frame, so that every event emitted afterwards is delivered.
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = connect_with_retry(path, 50, Duration::from_millis(20))?;
        let mut subscriber = Self {
            reader: BufReader::new(stream),
        };
        subscriber.wait_for("connected", Duration::from_secs(5))?;
        Ok(subscriber)
    }

    /// Next event, blocking up to `timeout`.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Value, ClientError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut line = String::new();
        let read = match self.reader.read_line(&mut line) {
            Ok(read) => read,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ClientError::Timeout("next event".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if read == 0 {
            return Err(ClientError::Closed);
        }
        let value: Value = serde_json::from_str(line.trim())?;
        if value.get("event").and_then(Value::as_str).is_none() {
            return Err(ClientError::MalformedEvent(line));
        }
        Ok(value)
    }

    /// Skip events until one tagged `name` arrives.
    pub fn wait_for(&mut self, name: &str, timeout: Duration) -> Result<Value, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(name.to_string()));
            }
            match self.next_event(remaining) {
                Ok(event) if event_name(&event) == Some(name) => return Ok(event),
                Ok(_) => continue,
                Err(ClientError::Timeout(_)) => return Err(ClientError::Timeout(name.to_string())),
                Err(e) => return Err(e),
            }
        }
    }

    /// Every event up to and including the first one tagged `name`.
    pub fn collect_until(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<Value>, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(name.to_string()));
            }
            let event = self.next_event(remaining).map_err(|e| match e {
                ClientError::Timeout(_) => ClientError::Timeout(name.to_string()),
                other => other,
            })?;
            let done = event_name(&event) == Some(name);
            events.push(event);
            if done {
                return Ok(events);
            }
        }
    }
}

/// The `event` tag of an event.
pub fn event_name(event: &Value) -> Option<&str> {
    event.get("event").and_then(Value::as_str)
}
