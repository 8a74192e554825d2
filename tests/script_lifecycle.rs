#![cfg(unix)]

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm::runtime::entity::{Color, Point};
use swarm::runtime::{Runtime, RunningRuntime, SwarmConfig};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

async fn start(temp: &TempDir, host: &str) -> (RunningRuntime, mpsc::Receiver<String>) {
    let mut config = SwarmConfig::in_dir(temp.path());
    config.seed_entities = false;
    config.listener_count = 1;
    config.script_host = host.to_string();
    config.script_grace_ms = 300;
    let running = Runtime::new(config).start().await.unwrap();
    let events = running.context().events.attach();
    (running, events)
}

fn write_script(temp: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = temp.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn add_script_line(script: &Path) -> String {
    serde_json::json!({"op": "cursor/add", "behavior": "script", "script": script, "x": 5, "y": 5})
        .to_string()
}

async fn wait_for(events: &mut mpsc::Receiver<String>, name: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let line = events.recv().await.expect("event bus closed");
            let event: Value = serde_json::from_str(&line).unwrap();
            if event["event"] == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {name} event"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_terminates_script_and_deletes_socket() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "sh").await;
    let script = write_script(&temp, "sleeper.sh", "exec sleep 30\n");
    let service = running.service();

    service.execute_line(&add_script_line(&script)).await;
    let launched = wait_for(&mut events, "scriptLaunched").await;
    let id = launched["id"].as_u64().unwrap() as u32;
    let pid = launched["pid"].as_u64().unwrap();
    let socket = running.context().scripts.socket_path(id);
    assert!(Path::new(&format!("/proc/{pid}")).exists());
    assert!(socket.exists());
    assert!(running.context().store.get(id).unwrap().script_running);

    service
        .execute_line(&format!(r#"{{"op":"cursor/remove","id":{id}}}"#))
        .await;
    let removed = wait_for(&mut events, "removed").await;
    assert_eq!(removed["ok"], true);

    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(!socket.exists());
    assert!(!running.context().scripts.is_active(id));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_failure_keeps_the_entity() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "/nonexistent/swarm-script-host").await;
    let script = write_script(&temp, "never.sh", "exit 0\n");
    let service = running.service();

    service.execute_line(&add_script_line(&script)).await;
    let failed = wait_for(&mut events, "scriptError").await;
    assert_eq!(failed["code"], "launchFail");

    let id = failed["id"].as_u64().unwrap() as u32;
    let entity = running.context().store.get(id).unwrap();
    assert!(!entity.script_running);
    assert!(!running.context().scripts.socket_path(id).exists());
    assert_eq!(running.context().scripts.channel_count(), 0);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_messages_drive_the_entity() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "sh").await;
    let script = write_script(&temp, "idle.sh", "exec sleep 30\n");
    let service = running.service();

    service.execute_line(&add_script_line(&script)).await;
    let launched = wait_for(&mut events, "scriptLaunched").await;
    let id = launched["id"].as_u64().unwrap() as u32;

    let mut stream = UnixStream::connect(running.context().scripts.socket_path(id))
        .await
        .unwrap();
    wait_for(&mut events, "scriptPipeConnected").await;
    stream
        .write_all(b"pos 120 -40\ncolor #00FF00\nbogus line\nlog hello there\n")
        .await
        .unwrap();

    let log = wait_for(&mut events, "scriptLog").await;
    assert_eq!(log["msg"], "hello there");
    let entity = running.context().store.get(id).unwrap();
    assert_eq!(entity.position, Point::new(120.0, -40.0));
    assert_eq!(entity.color, Color::rgb(0, 255, 0));

    stream.write_all(b"remove\n").await.unwrap();
    let removed = wait_for(&mut events, "removed").await;
    assert_eq!(removed["id"], id);
    assert_eq!(removed["ok"], true);
    assert!(!running.context().store.contains(id));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn natural_exit_reports_the_code() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "sh").await;
    let script = write_script(&temp, "quitter.sh", "exit 3\n");
    let service = running.service();

    service.execute_line(&add_script_line(&script)).await;
    let exit = wait_for(&mut events, "scriptExit").await;
    assert_eq!(exit["code"], 3);

    let id = exit["id"].as_u64().unwrap() as u32;
    assert!(!running.context().store.get(id).unwrap().script_running);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_terminates_running_scripts() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "sh").await;
    let script = write_script(&temp, "sleeper.sh", "exec sleep 30\n");
    let service = running.service();

    service.execute_line(&add_script_line(&script)).await;
    let launched = wait_for(&mut events, "scriptLaunched").await;
    let id = launched["id"].as_u64().unwrap() as u32;
    let pid = launched["pid"].as_u64().unwrap();
    let socket = running.context().scripts.socket_path(id);
    assert!(socket.exists());

    service.execute_line(r#"{"op":"cursor/clear"}"#).await;
    let cleared = wait_for(&mut events, "cleared").await;
    assert_eq!(cleared["count"], 1);

    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(!socket.exists());
    assert_eq!(running.context().scripts.channel_count(), 0);
    assert!(running.context().store.is_empty());

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_racing_a_launch_leaves_no_script_behind() {
    let temp = TempDir::new().unwrap();
    let (running, mut events) = start(&temp, "sh").await;
    let script = write_script(&temp, "racer.sh", "exec sleep 30\n");
    let service = running.service();
    let ctx = running.context().clone();

    for id in 1..=20u32 {
        let line = serde_json::json!({
            "op": "cursor/add",
            "id": id,
            "behavior": "script",
            "script": script,
        })
        .to_string();
        let adder = service.clone();
        let add = tokio::spawn(async move { adder.execute_line(&line).await });
        let remover = service.clone();
        let remove = tokio::spawn(async move {
            while !remover.remove(id).await {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        tokio::time::timeout(Duration::from_secs(5), remove)
            .await
            .expect("remove never succeeded")
            .unwrap();
        assert!(!ctx.scripts.is_active(id));
        assert!(!ctx.scripts.socket_path(id).exists());

        add.await.unwrap();
        assert!(!ctx.store.contains(id));
        assert!(!ctx.scripts.is_active(id));
        assert!(!ctx.scripts.socket_path(id).exists());
    }
    assert_eq!(ctx.scripts.channel_count(), 0);

    let mut pids = Vec::new();
    while let Ok(line) = events.try_recv() {
        let event: Value = serde_json::from_str(&line).unwrap();
        if event["event"] == "scriptLaunched" {
            pids.push(event["pid"].as_u64().unwrap());
        }
    }
    for pid in pids {
        assert!(!Path::new(&format!("/proc/{pid}")).exists(), "script {pid} outlived its entity");
    }
    let leftover = std::fs::read_dir(temp.path().join("sockets"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("script-"))
        .count();
    assert_eq!(leftover, 0);

    running.shutdown().await;
}
