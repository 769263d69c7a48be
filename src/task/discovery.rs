//! Finding task definitions on disk.

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, DaemonError};

/// File marking a directory as a task.
pub const TASK_MARKER: &str = "task.toml";

/// A task found under the task root.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTask {
    /// Path relative to the task root, `/`-separated.
    pub name: String,
    pub dir: PathBuf,
    /// Options carried by the marker file.
    pub options: toml::Table,
}

/// Walk `root` recursively and return every directory holding a marker,
/// sorted by name. Unreadable subdirectories and markers are skipped, and
/// symbolic links to directories are not descended into.
pub fn discover(root: &Path) -> Result<Vec<DiscoveredTask>, DaemonError> {
    if !root.is_dir() || std::fs::read_dir(root).is_err() {
        return Err(DaemonError::MissingSource(root.to_path_buf()));
    }

    let mut tasks = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "Skipping unreadable task directory: {}", e);
                continue;
            }
        };
        // Symlinked directories are not followed.
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                pending.push(entry.path());
            }
        }

        let marker = dir.join(TASK_MARKER);
        if dir != root && marker.is_file() {
            match read_marker(&marker) {
                Ok(options) => tasks.push(DiscoveredTask {
                    name: task_name(root, &dir),
                    dir,
                    options,
                }),
                Err(e) => tracing::warn!(marker = %marker.display(), "Skipping task: {}", e),
            }
        }
    }

    tasks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tasks)
}

fn read_marker(path: &Path) -> Result<toml::Table, ConfigError> {
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&source).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn task_name(root: &Path, dir: &Path) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
