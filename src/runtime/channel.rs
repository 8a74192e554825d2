//! Command and event sockets
//!
//! The command socket is served by a fixed pool of workers that share one
//! listener; each worker owns one client at a time and feeds its lines to
//! the [`Service`] in order. The event socket serves a single subscriber at
//! a time. Every accept and read races the shutdown signal.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::event::EventBus;
use super::service::Service;

/// Pause after a failed accept.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);

/// Bind a listening socket at `path`, replacing a stale socket file.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Splits a byte stream into lines.
///
/// Both `\n` and `\r` end a line and empty lines are skipped. A line longer
/// than the limit is cut at the limit; the rest up to the terminator is
/// discarded.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max: usize,
    overflow: bool,
}

impl LineAssembler {
    /// Assembler keeping at most `max` bytes per line.
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max: max.max(1),
            overflow: false,
        }
    }

    /// Feed `bytes`, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
                self.overflow = false;
            } else if self.buf.len() < self.max {
                self.buf.push(byte);
            } else if !self.overflow {
                self.overflow = true;
                tracing::debug!(limit = self.max, "line too long, truncating");
            }
        }
        lines
    }

    /// Unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.overflow = false;
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&bytes);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// Fixed pool of command socket workers.
pub struct InboundPool {
    workers: Vec<JoinHandle<()>>,
}

impl InboundPool {
    /// Start `count` workers on `listener`.
    pub fn spawn(
        listener: Arc<UnixListener>,
        count: usize,
        service: Service,
        max_line_len: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = (0..count.max(1))
            .map(|worker| {
                tokio::spawn(command_worker(
                    worker,
                    listener.clone(),
                    service.clone(),
                    max_line_len,
                    shutdown.clone(),
                ))
            })
            .collect();
        Self { workers }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "command worker panicked");
            }
        }
    }
}

fn stopping(changed: Result<(), watch::error::RecvError>, shutdown: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *shutdown.borrow()
}

async fn command_worker(
    worker: usize,
    listener: Arc<UnixListener>,
    service: Service,
    max_line_len: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker, "command worker started");
    while !*shutdown.borrow() {
        let accepted = tokio::select! {
            changed = shutdown.changed() => {
                if stopping(changed, &shutdown) {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => {
                tracing::debug!(worker, "command client connected");
                serve_commands(stream, &service, max_line_len, &mut shutdown).await;
                tracing::debug!(worker, "command client disconnected");
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "command accept failed");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    tracing::debug!(worker, "command worker stopped");
}

async fn serve_commands(
    mut stream: UnixStream,
    service: &Service,
    max_line_len: usize,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut assembler = LineAssembler::new(max_line_len);
    let mut chunk = [0u8; 1024];
    loop {
        let read = tokio::select! {
            changed = shutdown.changed() => {
                if stopping(changed, shutdown) {
                    return;
                }
                continue;
            }
            read = stream.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                for line in assembler.push(&chunk[..n]) {
                    service.execute_line(&line).await;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "command read failed");
                break;
            }
        }
    }
    if let Some(line) = assembler.finish() {
        service.execute_line(&line).await;
    }
}

/// Serve the event socket, one subscriber at a time, until shutdown.
pub async fn run_event_server(
    listener: UnixListener,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let accepted = tokio::select! {
            changed = shutdown.changed() => {
                if stopping(changed, &shutdown) {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => {
                tracing::info!("event subscriber attached");
                pump_events(stream, &events, &mut shutdown).await;
                events.detach();
                tracing::info!("event subscriber detached");
            }
            Err(e) => {
                tracing::warn!(error = %e, "event accept failed");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

async fn pump_events(stream: UnixStream, events: &EventBus, shutdown: &mut watch::Receiver<bool>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut queue = events.attach();
    let mut sink = [0u8; 256];

    loop {
        tokio::select! {
            line = queue.recv() => {
                let Some(mut line) = line else {
                    break;
                };
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::debug!(error = %e, "event write failed");
                    break;
                }
            }
            read = reader.read(&mut sink) => {
                // Subscribers never send anything meaningful; EOF means gone.
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if stopping(changed, shutdown) {
                    // Flush what is already queued, e.g. the `exiting` event.
                    while let Ok(mut line) = queue.try_recv() {
                        line.push('\n');
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_either_terminator() {
        let mut assembler = LineAssembler::new(64);
        assert_eq!(assembler.push(b"one\r\ntwo\n\nthr"), vec!["one", "two"]);
        assert_eq!(assembler.push(b"ee\rfour"), vec!["three"]);
        assert_eq!(assembler.finish(), Some("four".to_string()));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn truncates_long_lines_and_resyncs() {
        let mut assembler = LineAssembler::new(4);
        assert_eq!(assembler.push(b"abcdefgh\nxy\n"), vec!["abcd", "xy"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut assembler = LineAssembler::new(16);
        let lines = assembler.push(b"a\xffb\n");
        assert_eq!(lines, vec!["a\u{fffd}b"]);
    }

    #[tokio::test]
    async fn event_server_delivers_connected_and_detaches_on_disconnect() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("events.sock");
        let listener = bind_socket(&path).unwrap();
        let events = Arc::new(EventBus::new(16));
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(run_event_server(listener, events.clone(), rx));

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains(r#""event":"connected""#));
        assert!(events.is_attached());

        drop(lines);
        for _ in 0..100 {
            if !events.is_attached() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!events.is_attached());

        tx.send(true).unwrap();
        server.await.unwrap();
    }
}
