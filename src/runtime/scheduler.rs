//! Fixed-period tick loop and frame statistics
//!
//! The tick task advances every entity by the wall-clock time since the
//! previous tick, so behavior speed does not depend on how regularly the
//! task is scheduled. Frame times feed an exponential moving average that
//! `perf` and the heartbeat report.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::pointer::PointerDriver;
use super::store::EntityStore;

/// Starting value of the frame time average.
pub const INITIAL_FRAME_MS: f64 = 16.0;

/// Longest step a single tick may take, in seconds. Stalls beyond this are
/// not replayed.
pub const MAX_STEP_SECS: f64 = 0.25;

/// Exponential moving average of frame time.
#[derive(Debug)]
pub struct FrameStats {
    avg_frame_ms: AtomicU64,
    frames: AtomicU64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            avg_frame_ms: AtomicU64::new(INITIAL_FRAME_MS.to_bits()),
            frames: AtomicU64::new(0),
        }
    }
}

impl FrameStats {
    /// Fresh statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame time into the average.
    pub fn record(&self, frame_ms: f64) {
        if !frame_ms.is_finite() || frame_ms < 0.0 {
            return;
        }
        let _ = self
            .avg_frame_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = f64::from_bits(bits);
                Some((avg * 0.9 + frame_ms * 0.1).to_bits())
            });
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Average frame time in milliseconds.
    pub fn avg_frame_ms(&self) -> f64 {
        f64::from_bits(self.avg_frame_ms.load(Ordering::Relaxed))
    }

    /// Frames per second derived from the average.
    pub fn fps(&self) -> f64 {
        let avg = self.avg_frame_ms();
        if avg > 0.0 { 1000.0 / avg } else { 0.0 }
    }

    /// Frames recorded.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Tick the store every `period` until `shutdown` flips to true.
pub async fn run_ticker(
    store: Arc<EntityStore>,
    pointer: Arc<dyn PointerDriver>,
    stats: Arc<FrameStats>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();

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

        let now = Instant::now();
        let elapsed = now.duration_since(last);
        last = now;

        let dt = elapsed.as_secs_f64().min(MAX_STEP_SECS);
        store.tick(dt, pointer.position());
        stats.record(elapsed.as_secs_f64() * 1000.0);
    }

    tracing::debug!(frames = stats.frames(), "tick loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::entity::{Behavior, Entity, Point};
    use crate::runtime::pointer::VirtualPointer;

    #[test]
    fn average_starts_at_sixteen_and_converges() {
        let stats = FrameStats::new();
        assert_eq!(stats.avg_frame_ms(), 16.0);
        assert_eq!(stats.fps(), 62.5);

        stats.record(26.0);
        assert!((stats.avg_frame_ms() - 17.0).abs() < 1e-9);

        for _ in 0..200 {
            stats.record(10.0);
        }
        assert!((stats.avg_frame_ms() - 10.0).abs() < 1e-3);
        assert_eq!(stats.frames(), 201);
    }

    #[test]
    fn invalid_frame_times_are_ignored() {
        let stats = FrameStats::new();
        stats.record(f64::NAN);
        stats.record(-1.0);
        assert_eq!(stats.avg_frame_ms(), 16.0);
        assert_eq!(stats.frames(), 0);
    }

    #[tokio::test]
    async fn ticker_moves_entities_and_stops_on_shutdown() {
        let store = Arc::new(EntityStore::new(8));
        store
            .add(Entity::new(Behavior::Mirror {
                offset_x: 5.0,
                offset_y: 0.0,
            }))
            .unwrap();
        let pointer: Arc<dyn PointerDriver> = Arc::new(VirtualPointer::new(Point::new(10.0, 10.0)));
        let stats = Arc::new(FrameStats::new());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run_ticker(
            store.clone(),
            pointer,
            stats.clone(),
            Duration::from_millis(2),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(store.position(1), Some(Point::new(15.0, 10.0)));
        assert!(stats.frames() > 0);
    }
}
