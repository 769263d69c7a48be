//! The set of tasks the daemon runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::Manager;
use super::discovery::discover;
use super::factory::ComponentFactory;
use crate::error::DaemonError;

/// Task names from the task root plus tasks enabled in configuration.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    root: PathBuf,
}

impl TaskRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Discover tasks under the root, hand their marker options to the
    /// factory's configuration and merge in config-enabled tasks.
    pub fn scan(&self, factory: &mut ComponentFactory) -> Result<Vec<String>, DaemonError> {
        let discovered = discover(&self.root)?;
        let mut names = BTreeSet::new();
        for task in discovered {
            tracing::debug!(task = %task.name, dir = %task.dir.display(), "Discovered task");
            factory.config_mut().add_task_marker(&task.name, task.options);
            names.insert(task.name);
        }
        for name in factory.config().config().enabled_tasks() {
            if names.insert(name.clone()) {
                tracing::debug!(task = %name, "Task enabled in configuration");
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Assemble one manager per name. Tasks that fail to assemble are
    /// logged and left out.
    pub fn load(names: &[String], factory: &ComponentFactory) -> Vec<Box<dyn Manager>> {
        names
            .iter()
            .filter_map(|name| match factory.get(name) {
                Ok(manager) => Some(manager),
                Err(e) => {
                    tracing::error!(task = %name, "Failed to assemble task: {}", e);
                    None
                }
            })
            .collect()
    }
}
