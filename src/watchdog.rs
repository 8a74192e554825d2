//! Heartbeat watchdog
//!
//! A synchronous supervisor that keeps one worker process alive. Each poll
//! relaunches an exited worker, checks the liveness file written by the
//! worker's heartbeat task, and restarts the worker once the file has been
//! stale for `stale_retries` consecutive polls. A stop file ends supervision
//! without touching the worker.

use crate::runtime::heartbeat::read_timestamp;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

/// Watchdog settings.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Worker executable.
    pub exe: PathBuf,
    /// Worker arguments.
    pub args: Vec<String>,
    /// Liveness file written by the worker.
    pub heartbeat: PathBuf,
    /// Supervision ends when this file appears.
    pub stop_file: PathBuf,
    /// Poll period.
    pub poll_interval: Duration,
    /// Age after which the liveness file counts as stale.
    pub stale_threshold: Duration,
    /// Consecutive stale polls before a restart (at least 1).
    pub stale_retries: u32,
    /// How long the worker gets to exit after SIGTERM.
    pub grace: Duration,
}

impl WatchdogConfig {
    /// Settings with the default timings.
    pub fn new(exe: impl Into<PathBuf>, heartbeat: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            args: Vec::new(),
            heartbeat: heartbeat.into(),
            stop_file: PathBuf::from("swarm_watchdog.stop"),
            poll_interval: Duration::from_millis(1000),
            stale_threshold: Duration::from_millis(5000),
            stale_retries: 2,
            grace: Duration::from_millis(1500),
        }
    }
}

/// A running worker.
pub trait WorkerHandle {
    /// Whether the worker has exited.
    fn has_exited(&mut self) -> bool;

    /// Ask the worker to stop, force it after `grace`.
    fn terminate(&mut self, grace: Duration);

    /// Process id.
    fn id(&self) -> u32;
}

/// Starts workers.
pub trait Launcher {
    /// Handle type for launched workers.
    type Handle: WorkerHandle;

    /// Start one worker.
    fn launch(&mut self) -> io::Result<Self::Handle>;
}

/// Launches the configured executable as a child process.
pub struct ProcessLauncher {
    exe: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launcher for `config.exe` with `config.args`.
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            exe: config.exe.clone(),
            args: config.args.clone(),
        }
    }
}

impl Launcher for ProcessLauncher {
    type Handle = Child;

    fn launch(&mut self) -> io::Result<Child> {
        Command::new(&self.exe).args(&self.args).spawn()
    }
}

impl WorkerHandle for Child {
    fn has_exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }

    fn terminate(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        if let Ok(pid) = libc::pid_t::try_from(self.id()) {
            // SAFETY: signalling a child we own; the pid is not reaped yet.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        tracing::warn!(pid = self.id(), "worker ignored SIGTERM, killing");
        if let Err(e) = self.kill() {
            tracing::warn!(error = %e, "kill failed");
        }
        let _ = self.wait();
    }

    fn id(&self) -> u32 {
        Child::id(self)
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Stop file found; supervision is over.
    Stop,
    /// No worker was running and one was started.
    Launched,
    /// Starting a worker failed.
    LaunchFailed,
    /// The worker was stale too long and was restarted.
    Restarted,
    /// The liveness file is stale; the counter is attached.
    Stale(u32),
    /// The liveness file is fresh again after stale polls.
    Recovered,
    /// The liveness file is fresh.
    Healthy,
}

/// Watchdog state: the current worker and the stale counter.
pub struct Watchdog<L: Launcher> {
    config: WatchdogConfig,
    launcher: L,
    child: Option<L::Handle>,
    stale_count: u32,
    launches: u32,
}

impl<L: Launcher> Watchdog<L> {
    /// Watchdog that starts workers with `launcher`.
    pub fn new(mut config: WatchdogConfig, launcher: L) -> Self {
        config.stale_retries = config.stale_retries.max(1);
        Self {
            config,
            launcher,
            child: None,
            stale_count: 0,
            launches: 0,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Consecutive stale polls.
    pub fn stale_count(&self) -> u32 {
        self.stale_count
    }

    /// Workers started after the first one.
    pub fn restarts(&self) -> u32 {
        self.launches.saturating_sub(1)
    }

    /// Whether a worker handle is held.
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// One supervision step at wall time `now_ms`.
    ///
    /// A poll that launches a worker does not read the liveness file. A
    /// fresh worker gets one full poll interval to publish its first record
    /// before a stale timestamp left by its predecessor counts against it.
    pub fn poll(&mut self, now_ms: i64) -> PollOutcome {
        if self.config.stop_file.exists() {
            tracing::info!(stop_file = %self.config.stop_file.display(), "stop file found, releasing worker");
            self.child = None;
            return PollOutcome::Stop;
        }

        let running = match self.child.as_mut() {
            Some(child) => !child.has_exited(),
            None => false,
        };
        if !running {
            if self.child.take().is_some() {
                tracing::warn!("worker exited");
            }
            self.stale_count = 0;
            return self.start();
        }

        let stale = match read_timestamp(&self.config.heartbeat) {
            Ok(Some(ts)) => now_ms.saturating_sub(ts) > threshold_ms(self.config.stale_threshold),
            Ok(None) => true,
            Err(e) => {
                tracing::debug!(error = %e, "liveness file unreadable");
                true
            }
        };

        if !stale {
            let outcome = if self.stale_count > 0 {
                tracing::info!(after = self.stale_count, "worker recovered");
                PollOutcome::Recovered
            } else {
                PollOutcome::Healthy
            };
            self.stale_count = 0;
            return outcome;
        }

        self.stale_count += 1;
        tracing::warn!(
            count = self.stale_count,
            retries = self.config.stale_retries,
            "worker liveness stale"
        );
        if self.stale_count < self.config.stale_retries {
            return PollOutcome::Stale(self.stale_count);
        }

        if let Some(mut child) = self.child.take() {
            tracing::warn!(pid = child.id(), "restarting stalled worker");
            child.terminate(self.config.grace);
        }
        self.stale_count = 0;
        match self.start() {
            PollOutcome::Launched => PollOutcome::Restarted,
            other => other,
        }
    }

    fn start(&mut self) -> PollOutcome {
        match self.launcher.launch() {
            Ok(child) => {
                tracing::info!(pid = child.id(), exe = %self.config.exe.display(), "worker launched");
                self.child = Some(child);
                self.launches += 1;
                PollOutcome::Launched
            }
            Err(e) => {
                tracing::error!(exe = %self.config.exe.display(), error = %e, "worker launch failed");
                PollOutcome::LaunchFailed
            }
        }
    }

    /// Poll until the stop file appears.
    pub fn run(&mut self) {
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            if self.poll(now) == PollOutcome::Stop {
                break;
            }
            thread::sleep(self.config.poll_interval);
        }
    }
}

fn threshold_ms(threshold: Duration) -> i64 {
    i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        launched: u32,
        terminated: u32,
        exited: bool,
    }

    struct FakeHandle {
        log: Rc<RefCell<Log>>,
        pid: u32,
    }

    impl WorkerHandle for FakeHandle {
        fn has_exited(&mut self) -> bool {
            self.log.borrow().exited
        }

        fn terminate(&mut self, _grace: Duration) {
            self.log.borrow_mut().terminated += 1;
        }

        fn id(&self) -> u32 {
            self.pid
        }
    }

    struct FakeLauncher {
        log: Rc<RefCell<Log>>,
    }

    impl Launcher for FakeLauncher {
        type Handle = FakeHandle;

        fn launch(&mut self) -> io::Result<FakeHandle> {
            let mut log = self.log.borrow_mut();
            log.launched += 1;
            log.exited = false;
            Ok(FakeHandle {
                log: self.log.clone(),
                pid: 100 + log.launched,
            })
        }
    }

    fn watchdog(dir: &std::path::Path, retries: u32) -> (Watchdog<FakeLauncher>, Rc<RefCell<Log>>) {
        let mut config = WatchdogConfig::new("worker", dir.join("heartbeat.txt"));
        config.stop_file = dir.join("stop");
        config.stale_retries = retries;
        let log = Rc::new(RefCell::new(Log::default()));
        let launcher = FakeLauncher { log: log.clone() };
        (Watchdog::new(config, launcher), log)
    }

    fn beat(dir: &std::path::Path, ts: i64) {
        std::fs::write(dir.join("heartbeat.txt"), format!("{ts}\n60.0\n3\n")).unwrap();
    }

    #[test]
    fn launches_then_relaunches_an_exited_worker() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, log) = watchdog(temp.path(), 2);
        assert_eq!(dog.poll(0), PollOutcome::Launched);
        beat(temp.path(), 0);
        assert_eq!(dog.poll(100), PollOutcome::Healthy);

        log.borrow_mut().exited = true;
        assert_eq!(dog.poll(200), PollOutcome::Launched);
        assert_eq!(log.borrow().launched, 2);
        assert_eq!(log.borrow().terminated, 0);
    }

    #[test]
    fn launching_poll_ignores_a_leftover_liveness_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, log) = watchdog(temp.path(), 1);
        beat(temp.path(), 0);

        assert_eq!(dog.poll(60_000), PollOutcome::Launched);
        assert_eq!(dog.stale_count(), 0);
        assert_eq!(log.borrow().terminated, 0);

        beat(temp.path(), 60_500);
        assert_eq!(dog.poll(61_000), PollOutcome::Healthy);
        assert_eq!(log.borrow().launched, 1);
    }

    #[test]
    fn restarts_after_consecutive_stale_polls() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, log) = watchdog(temp.path(), 2);
        assert_eq!(dog.poll(0), PollOutcome::Launched);
        beat(temp.path(), 0);

        assert_eq!(dog.poll(6_000), PollOutcome::Stale(1));
        assert_eq!(dog.poll(7_000), PollOutcome::Restarted);
        assert_eq!(log.borrow().terminated, 1);
        assert_eq!(log.borrow().launched, 2);
        assert_eq!(dog.stale_count(), 0);
    }

    #[test]
    fn fresh_heartbeat_resets_the_counter() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, _log) = watchdog(temp.path(), 3);
        dog.poll(0);
        assert_eq!(dog.poll(1_000), PollOutcome::Stale(1));
        beat(temp.path(), 1_500);
        assert_eq!(dog.poll(2_000), PollOutcome::Recovered);
        assert_eq!(dog.poll(3_000), PollOutcome::Healthy);
        assert_eq!(dog.stale_count(), 0);
    }

    #[test]
    fn retries_of_zero_behave_as_one() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, log) = watchdog(temp.path(), 0);
        assert_eq!(dog.config().stale_retries, 1);
        dog.poll(0);
        assert_eq!(dog.poll(10_000), PollOutcome::Restarted);
        assert_eq!(log.borrow().terminated, 1);
    }

    #[test]
    fn stop_file_releases_without_terminating() {
        let temp = tempfile::TempDir::new().unwrap();
        let (mut dog, log) = watchdog(temp.path(), 2);
        dog.poll(0);
        std::fs::write(temp.path().join("stop"), "").unwrap();
        assert_eq!(dog.poll(100), PollOutcome::Stop);
        assert!(!dog.has_child());
        assert_eq!(log.borrow().terminated, 0);
    }

    #[cfg(unix)]
    #[test]
    fn process_handle_terminates_a_real_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        assert!(!child.has_exited());
        child.terminate(Duration::from_millis(1000));
        assert!(child.has_exited());
    }
}
