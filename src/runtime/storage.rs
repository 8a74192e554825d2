//! Filesystem layout, atomic writes and the two command files
//!
//! The state file holds one `cursor/add` record per entity and is replayed
//! through the ordinary command path on `load`. The config file is a list of
//! command lines that is replayed at startup and whenever it changes.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::SwarmConfig;
use super::entity::{Behavior, Entity};
use super::error::{StorageError, StorageResult};
use super::record::RecordWriter;

/// Run file work on the blocking pool so fsyncs and reads never stall an
/// async worker thread.
pub async fn offload<T, F>(work: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

/// Resolved file locations for one worker.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    state_path: PathBuf,
    config_path: PathBuf,
    heartbeat_path: PathBuf,
}

impl Storage {
    /// Resolve file names from `config` against its root.
    pub fn new(config: &SwarmConfig) -> Self {
        let root = config.root.clone();
        Self {
            state_path: root.join(&config.state_file),
            config_path: root.join(&config.config_file),
            heartbeat_path: root.join(&config.heartbeat_file),
            root,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entity state file.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Hot-reloaded command file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Liveness file.
    pub fn heartbeat_path(&self) -> &Path {
        &self.heartbeat_path
    }
}

/// Write `data` to `path` through a temporary file and a rename, so readers
/// never observe a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    let failed = |detail: String| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    let mut file = File::create(&temp_path)
        .map_err(|e| failed(format!("create {}: {e}", temp_path.display())))?;
    file.write_all(data)
        .map_err(|e| failed(format!("write: {e}")))?;
    file.sync_all().map_err(|e| failed(format!("sync: {e}")))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| failed(format!("rename: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new().read(true).open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

/// Command lines in `text`, skipping blanks and `#` comments.
pub fn command_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// `cursor/add` line reproducing `entity`.
pub fn encode_entity(entity: &Entity) -> String {
    let writer = RecordWriter::new()
        .str("op", "cursor/add")
        .num("id", entity.id as f64)
        .str("behavior", entity.kind().name());

    let writer = match &entity.behavior {
        Behavior::Mirror { offset_x, offset_y } => {
            writer.num("offsetX", *offset_x).num("offsetY", *offset_y)
        }
        Behavior::Static { target } => writer.num("x", target.x).num("y", target.y),
        Behavior::Orbit { radius, speed, .. } => writer.num("radius", *radius).num("speed", *speed),
        Behavior::FollowLag { lag_ms, .. } => writer.num("lagMs", *lag_ms),
        Behavior::Scripted { script, target } => writer
            .num("x", target.x)
            .num("y", target.y)
            .str("script", &script.to_string_lossy()),
    };

    writer
        .num("size", entity.size as f64)
        .str("color", &entity.color.to_string())
        .finish()
}

/// Entity state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Replace the file with one record per entity.
    pub fn save(&self, entities: &[Entity]) -> StorageResult<usize> {
        let mut data = String::new();
        for entity in entities {
            data.push_str(&encode_entity(entity));
            data.push('\n');
        }
        write_atomic(&self.path, data.as_bytes())?;
        Ok(entities.len())
    }

    /// Command lines stored in the file.
    pub fn load(&self) -> StorageResult<Vec<String>> {
        if !self.path.exists() {
            return Err(StorageError::PathNotFound(self.path.clone()));
        }
        Ok(command_lines(&fs::read_to_string(&self.path)?))
    }
}

/// Command file replayed whenever its modification time changes.
#[derive(Debug)]
pub struct ConfigSource {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigSource {
    /// Config file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines to replay, if the file changed since the last poll or `force`
    /// is set. A missing file yields nothing.
    pub fn poll(&self, force: bool) -> StorageResult<Option<Vec<String>>> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        {
            let mut last = self.last_modified.lock();
            if !force && *last == Some(modified) {
                return Ok(None);
            }
            *last = Some(modified);
        }

        let text = fs::read_to_string(&self.path)?;
        Ok(Some(command_lines(&text)))
    }
}

/// Load worker settings from a JSON file. Missing fields take defaults.
pub fn load_settings(path: &Path) -> StorageResult<SwarmConfig> {
    let data = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::PathNotFound(path.to_path_buf())
        } else {
            StorageError::Io(e)
        }
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| StorageError::Settings(format!("{}: {e}", path.display())))
}

/// Write worker settings as pretty JSON.
pub fn write_settings(path: &Path, config: &SwarmConfig) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::entity::{BehaviorKind, Color, Point};
    use crate::runtime::record::Record;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.dat");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn encoded_entities_reparse() {
        let mut entity = Entity::new(Behavior::Orbit {
            radius: 100.0,
            speed: -1.5,
            angle: 2.0,
        })
        .with_color(Color::rgb(255, 0, 0));
        entity.id = 7;

        let line = encode_entity(&entity);
        let record = Record::parse(&line).unwrap();
        assert_eq!(record.get("op"), Some("cursor/add"));
        assert_eq!(record.get("id"), Some("7"));
        assert_eq!(record.get("behavior"), Some("orbit"));
        assert_eq!(record.get("radius"), Some("100"));
        assert_eq!(record.get("speed"), Some("-1.5"));
        assert_eq!(record.get("color"), Some("#FF0000"));
    }

    #[test]
    fn scripted_entities_keep_their_script() {
        let mut entity = Entity::new(Behavior::Scripted {
            script: PathBuf::from("/tmp/drive me.sh"),
            target: Point::new(3.0, 4.0),
        });
        entity.id = 2;
        let record = Record::parse(&encode_entity(&entity)).unwrap();
        assert_eq!(record.get("behavior"), Some(BehaviorKind::Scripted.name()));
        assert_eq!(record.get("script"), Some("/tmp/drive me.sh"));
        assert_eq!(record.get("x"), Some("3"));
    }

    #[test]
    fn state_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let state = StateFile::new(temp.path().join("state.jsonl"));
        assert!(matches!(state.load(), Err(StorageError::PathNotFound(_))));

        let mut a = Entity::new(Behavior::default());
        a.id = 1;
        let mut b = Entity::new(Behavior::default_for(BehaviorKind::FollowLag));
        b.id = 2;
        assert_eq!(state.save(&[a, b]).unwrap(), 2);

        let lines = state.load().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(r#""behavior":"follow""#));
    }

    #[tokio::test]
    async fn offload_runs_off_the_runtime_thread() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("beat.txt");
        let caller = std::thread::current().id();

        let target = path.clone();
        let worker = offload(move || {
            write_atomic(&target, b"1\n")?;
            Ok(std::thread::current().id())
        })
        .await
        .unwrap();
        assert_ne!(worker, caller);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");

        let state = StateFile::new(temp.path().join("missing.jsonl"));
        let missing = offload(move || state.load()).await;
        assert!(matches!(missing, Err(StorageError::PathNotFound(_))));

        let panicked = offload(|| -> StorageResult<()> { panic!("disk on fire") }).await;
        assert!(matches!(panicked, Err(StorageError::Io(_))));
    }

    #[test]
    fn command_lines_skip_comments_and_blanks() {
        let lines = command_lines("# header\n\n  {\"cmd\":\"list\"}  \r\n#x\n{\"cmd\":\"perf\"}");
        assert_eq!(lines, vec![r#"{"cmd":"list"}"#, r#"{"cmd":"perf"}"#]);
    }

    #[test]
    fn config_source_reports_changes_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.jsonl");
        let source = ConfigSource::new(&path);
        assert_eq!(source.poll(false).unwrap(), None);

        fs::write(&path, "{\"cmd\":\"list\"}\n").unwrap();
        assert_eq!(
            source.poll(false).unwrap(),
            Some(vec![r#"{"cmd":"list"}"#.to_string()])
        );
        assert_eq!(source.poll(false).unwrap(), None);
        assert!(source.poll(true).unwrap().is_some());
    }

    #[test]
    fn settings_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");

        let config = SwarmConfig {
            listener_count: 3,
            seed_entities: false,
            ..SwarmConfig::default()
        };
        write_settings(&path, &config).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.listener_count, 3);
        assert!(!loaded.seed_entities);

        fs::write(&path, r#"{"max_entities": 5}"#).unwrap();
        let partial = load_settings(&path).unwrap();
        assert_eq!(partial.max_entities, 5);
        assert_eq!(partial.listener_count, SwarmConfig::default().listener_count);
    }
}
