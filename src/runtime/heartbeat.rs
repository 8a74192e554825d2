//! Liveness file shared with the watchdog
//!
//! Three lines: epoch milliseconds, frames per second, entity count. Only
//! the first line matters to the watchdog; the others are for humans.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::scheduler::FrameStats;
use super::storage::{offload, write_atomic};
use super::store::EntityStore;

/// One liveness sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessRecord {
    /// Wall-clock time of the sample in epoch milliseconds
    pub timestamp_ms: i64,
    /// Frames per second at the time of the sample
    pub fps: f64,
    /// Live entities at the time of the sample
    pub entity_count: usize,
}

impl LivenessRecord {
    /// Sample taken now.
    pub fn now(fps: f64, entity_count: usize) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            fps,
            entity_count,
        }
    }

    /// File contents for this record.
    pub fn to_text(&self) -> String {
        format!(
            "{}\n{:.1}\n{}\n",
            self.timestamp_ms, self.fps, self.entity_count
        )
    }

    /// Parse file contents. Only the timestamp is required.
    pub fn parse(text: &str) -> Option<LivenessRecord> {
        let mut lines = text.lines().map(str::trim);
        let timestamp_ms = lines.next()?.parse().ok()?;
        let fps = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0.0);
        let entity_count = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
        Some(LivenessRecord {
            timestamp_ms,
            fps,
            entity_count,
        })
    }
}

/// Timestamp from the liveness file at `path`. `Ok(None)` if the file is
/// missing or unreadable as a record.
pub fn read_timestamp(path: &Path) -> io::Result<Option<i64>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(LivenessRecord::parse(&text).map(|r| r.timestamp_ms)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Publish a liveness record to `path` every `period` until shutdown.
pub async fn run_heartbeat(
    path: PathBuf,
    store: Arc<EntityStore>,
    stats: Arc<FrameStats>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let text = LivenessRecord::now(stats.fps(), store.len()).to_text();
        let target = path.clone();
        if let Err(e) = offload(move || write_atomic(&target, text.as_bytes())).await {
            tracing::warn!(path = %path.display(), error = %e, "heartbeat write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_text_round_trip() {
        let record = LivenessRecord {
            timestamp_ms: 1_700_000_000_123,
            fps: 59.94,
            entity_count: 5,
        };
        let text = record.to_text();
        assert_eq!(text, "1700000000123\n59.9\n5\n");

        let parsed = LivenessRecord::parse(&text).unwrap();
        assert_eq!(parsed.timestamp_ms, record.timestamp_ms);
        assert_eq!(parsed.entity_count, 5);
    }

    #[test]
    fn timestamp_only_is_enough() {
        let parsed = LivenessRecord::parse("42\n").unwrap();
        assert_eq!(parsed.timestamp_ms, 42);
        assert!(LivenessRecord::parse("soon\n").is_none());
        assert!(LivenessRecord::parse("").is_none());
    }

    #[test]
    fn read_timestamp_handles_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("heartbeat.txt");
        assert_eq!(read_timestamp(&path).unwrap(), None);

        fs::write(&path, "1234\n60.0\n1\n").unwrap();
        assert_eq!(read_timestamp(&path).unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn publisher_writes_fresh_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("heartbeat.txt");
        let (tx, rx) = watch::channel(false);
        let before = chrono::Utc::now().timestamp_millis();

        let task = tokio::spawn(run_heartbeat(
            path.clone(),
            Arc::new(EntityStore::new(4)),
            Arc::new(FrameStats::new()),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let record = LivenessRecord::parse(&text).unwrap();
        assert!(record.timestamp_ms >= before);
        assert_eq!(record.entity_count, 0);
        assert!((record.fps - 62.5).abs() < 0.1);
    }
}
