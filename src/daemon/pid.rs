//! Process identity bookkeeping and the PID file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// Tracks a process's own id, its parent's id and the children it spawned.
///
/// One registry exists per process. The orchestrator appends children as it
/// spawns workers and reaps them as they exit; a worker starts with a fresh
/// registry and never inherits the spawning process's child list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRegistry {
    current: u32,
    parent: Option<u32>,
    children: BTreeSet<u32>,
}

impl PidRegistry {
    pub fn new(current: u32, parent: Option<u32>) -> Self {
        Self {
            current,
            parent,
            children: BTreeSet::new(),
        }
    }

    /// Registry for the calling process, with no known parent.
    pub fn for_current_process() -> Self {
        Self::new(std::process::id(), None)
    }

    /// Registry for a freshly started worker owned by `parent`.
    pub fn for_worker(parent: Option<u32>) -> Self {
        let mut registry = Self::for_current_process();
        registry.on_become_child(std::process::id(), parent);
        registry
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn children(&self) -> &BTreeSet<u32> {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Re-scope this registry to the duplicated process.
    pub fn on_become_child(&mut self, new_id: u32, parent_id: Option<u32>) {
        self.current = new_id;
        self.parent = parent_id;
        self.children.clear();
    }

    /// Record a spawned child (parent side only).
    pub fn record_child(&mut self, id: u32) {
        self.children.insert(id);
    }

    /// Forget a child whose exit has been observed. Returns whether it was known.
    pub fn reap(&mut self, id: u32) -> bool {
        self.children.remove(&id)
    }
}

/// Plain-text file holding the orchestrator's process id.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pid, `None` when the file is absent or unparsable.
    pub fn read(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Fail with `AlreadyRunning` when the file names a live process.
    pub fn ensure_not_running(&self) -> Result<(), DaemonError> {
        match self.read() {
            Some(pid) if pid != std::process::id() && process_alive(pid) => {
                Err(DaemonError::AlreadyRunning {
                    pid,
                    path: self.path.clone(),
                })
            }
            Some(pid) => {
                tracing::debug!(pid, path = %self.path.display(), "Overwriting stale pid file");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Write `pid` followed by a newline, creating parent directories.
    pub fn write(&self, pid: u32) -> Result<(), DaemonError> {
        let map_err = |source| DaemonError::PidFile {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(map_err)?;
        }
        std::fs::write(&self.path, format!("{pid}\n")).map_err(map_err)
    }

    /// Remove the file; a missing file is not an error.
    pub fn remove(&self) -> Result<(), DaemonError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DaemonError::PidFile {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Whether a process with this id currently exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 performs the permission and existence checks without delivering anything.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_reap_children() {
        let mut pids = PidRegistry::new(100, None);
        pids.record_child(101);
        pids.record_child(102);
        pids.record_child(101);
        assert_eq!(pids.children().len(), 2);

        assert!(pids.reap(101));
        assert!(!pids.reap(101));
        assert_eq!(pids.children().iter().copied().collect::<Vec<_>>(), vec![102]);
        assert!(pids.reap(102));
        assert!(!pids.has_children());
    }

    #[test]
    fn become_child_starts_fresh() {
        let mut pids = PidRegistry::new(100, None);
        pids.record_child(101);
        pids.record_child(102);

        pids.on_become_child(101, Some(100));
        assert_eq!(pids.current(), 101);
        assert_eq!(pids.parent(), Some(100));
        assert!(pids.children().is_empty());
    }

    #[test]
    fn worker_registry_uses_own_pid() {
        let pids = PidRegistry::for_worker(Some(1));
        assert_eq!(pids.current(), std::process::id());
        assert_eq!(pids.parent(), Some(1));
        assert!(!pids.has_children());
    }

    #[test]
    fn pid_file_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = PidFile::new(dir.path().join("run/taskd.pid"));

        file.write(4242).unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "4242\n");
        assert_eq!(file.read(), Some(4242));

        file.remove().unwrap();
        assert!(!file.path().exists());
        // Second removal is a no-op
        file.remove().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn live_pid_file_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = PidFile::new(dir.path().join("taskd.pid"));

        // Parent of the test runner is alive and never equal to our own pid
        let parent = std::os::unix::process::parent_id();
        file.write(parent).unwrap();
        assert!(matches!(
            file.ensure_not_running(),
            Err(DaemonError::AlreadyRunning { pid, .. }) if pid == parent
        ));
    }

    #[test]
    fn stale_pid_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = PidFile::new(dir.path().join("taskd.pid"));

        std::fs::write(file.path(), "not-a-pid").unwrap();
        assert!(file.ensure_not_running().is_ok());

        file.write(std::process::id()).unwrap();
        assert!(file.ensure_not_running().is_ok());
    }
}
