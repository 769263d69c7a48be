//! Shared daemon state.
//!
//! The orchestrator publishes its run status, child ids and name into a
//! key-value store that workers and external monitors can read. The store is
//! passed explicitly; the backing is chosen by the caller:
//! - [`MemoryStore`]: in-process, for tests and embedding
//! - [`FileStore`]: one JSON document per key in a directory, readable
//!   from any process on the host

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

pub const KEY_STATE: &str = "state";
pub const KEY_CHILD_IDS: &str = "childIds";
pub const KEY_NAME: &str = "name";

/// Minimal key-value contract the daemon needs from a backing store.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StateError>;
    fn remove(&self, key: &str) -> Result<(), StateError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A poisoned map still holds consistent JSON values.
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Directory-backed store: `<dir>/<key>.json`, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `a/b` maps to `<dir>/a/b.json`. Each `/`-separated segment becomes a
    /// directory level, so distinct keys never share a file.
    fn path_for(&self, key: &str) -> Result<PathBuf, StateError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
            && key
                .split('/')
                .all(|segment| !matches!(segment, "" | "." | ".."));
        if !valid {
            return Err(StateError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, serde_json::to_vec(&value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Daemon run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Typed view over the shared daemon keys.
#[derive(Clone)]
pub struct DaemonState {
    store: Arc<dyn StateStore>,
}

impl DaemonState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn set_run_status(&self, status: RunStatus) -> Result<(), StateError> {
        self.store.set(KEY_STATE, serde_json::to_value(status)?)
    }

    pub fn run_status(&self) -> Result<Option<RunStatus>, StateError> {
        match self.store.get(KEY_STATE)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set_child_ids(&self, ids: &BTreeSet<u32>) -> Result<(), StateError> {
        self.store.set(KEY_CHILD_IDS, serde_json::to_value(ids)?)
    }

    pub fn child_ids(&self) -> Result<BTreeSet<u32>, StateError> {
        match self.store.get(KEY_CHILD_IDS)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BTreeSet::new()),
        }
    }

    pub fn set_name(&self, name: &str) -> Result<(), StateError> {
        self.store.set(KEY_NAME, Value::String(name.to_string()))
    }

    pub fn name(&self) -> Result<Option<String>, StateError> {
        Ok(self
            .store
            .get(KEY_NAME)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Drop every daemon key.
    pub fn release(&self) -> Result<(), StateError> {
        for key in [KEY_STATE, KEY_CHILD_IDS, KEY_NAME] {
            self.store.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonState").finish_non_exhaustive()
    }
}
