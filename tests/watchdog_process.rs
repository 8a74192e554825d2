#![cfg(unix)]

use swarm::watchdog::{PollOutcome, ProcessLauncher, Watchdog, WatchdogConfig};
use tempfile::TempDir;

fn config(temp: &TempDir, script: &str) -> WatchdogConfig {
    let mut config = WatchdogConfig::new("sh", temp.path().join("swarm_heartbeat.txt"));
    config.args = vec!["-c".to_string(), script.to_string()];
    config.stop_file = temp.path().join("stop");
    config.stale_retries = 1;
    config.grace = std::time::Duration::from_millis(500);
    config
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[test]
fn relaunches_a_crashed_worker() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp, "exit 1");
    let mut watchdog = Watchdog::new(config.clone(), ProcessLauncher::new(&config));

    assert_eq!(watchdog.poll(now()), PollOutcome::Launched);
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(watchdog.poll(now()), PollOutcome::Launched);
    assert_eq!(watchdog.restarts(), 1);

    std::fs::write(&config.stop_file, "").unwrap();
    assert_eq!(watchdog.poll(now()), PollOutcome::Stop);
}

#[test]
fn restarts_a_worker_whose_heartbeat_is_stale() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp, "sleep 2");
    let mut watchdog = Watchdog::new(config.clone(), ProcessLauncher::new(&config));
    std::fs::write(&config.heartbeat, format!("{}\n0.0\n0\n", now() - 60_000)).unwrap();

    assert_eq!(watchdog.poll(now()), PollOutcome::Launched);
    assert_eq!(watchdog.poll(now()), PollOutcome::Restarted);
    assert!(watchdog.has_child());

    std::fs::write(&config.heartbeat, format!("{}\n60.0\n5\n", now())).unwrap();
    assert_eq!(watchdog.poll(now()), PollOutcome::Healthy);

    std::fs::write(&config.stop_file, "").unwrap();
    assert_eq!(watchdog.poll(now()), PollOutcome::Stop);
    assert!(!watchdog.has_child());
}
