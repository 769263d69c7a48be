//! Configuration types.
//!
//! The daemon reads a single TOML file with three sections:
//! - `[daemon]`: process-level settings (paths, tick lengths)
//! - `[defaults]`: component options applied to every task
//! - `[tasks."<name>"]`: per-task component options
//!
//! Component lookups go through [`ConfigProvider`], which only ever answers
//! two questions: "what is `<path>` globally" and "what is `<path>` for this
//! task".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "taskd.toml";

/// Process-level daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Daemon name published in shared state.
    pub name: String,
    /// Path of the PID file written by the orchestrator.
    pub pid_file: PathBuf,
    /// Directory backing the shared daemon state store.
    pub state_dir: PathBuf,
    /// Root directory scanned for task definitions.
    pub task_dir: PathBuf,
    /// Optional directory for a log file (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    /// Length of one sleep increment in the manager WAIT step.
    pub sleep_tick_ms: u64,
    /// Upper bound between two reap passes when no SIGCHLD arrives.
    pub reap_poll_ms: u64,
    /// How long workers get to exit after SIGTERM before being killed.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            name: "taskd".to_string(),
            pid_file: tmp.join("taskd.pid"),
            state_dir: tmp.join("taskd-state"),
            task_dir: PathBuf::from("tasks"),
            log_dir: None,
            sleep_tick_ms: 250,
            reap_poll_ms: 500,
            shutdown_grace_secs: 30,
        }
    }
}

impl DaemonSettings {
    pub fn sleep_tick(&self) -> Duration {
        Duration::from_millis(self.sleep_tick_ms.max(1))
    }

    pub fn reap_poll(&self) -> Duration {
        Duration::from_millis(self.reap_poll_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Full daemon configuration as read from disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    /// Options applied to all tasks.
    pub defaults: toml::Table,
    /// Options scoped to one task, keyed by task name.
    pub tasks: BTreeMap<String, toml::Table>,
}

impl DaemonConfig {
    /// Parse a configuration document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Load the given file, or `taskd.toml` from the working directory when
    /// it exists, or built-in defaults. Environment overrides are applied last.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `TASKD_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = &mut self.daemon;
        if let Some(v) = lookup("TASKD_NAME") {
            settings.name = v;
        }
        if let Some(v) = lookup("TASKD_PID_FILE") {
            settings.pid_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKD_STATE_DIR") {
            settings.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKD_TASK_DIR") {
            settings.task_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASKD_LOG_DIR") {
            settings.log_dir = Some(PathBuf::from(v));
        }
    }

    /// Task names switched on directly in the configuration file.
    pub fn enabled_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, table)| {
                table
                    .get("enabled")
                    .and_then(toml::Value::as_bool)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Read-only view over configuration used during component assembly.
#[derive(Debug, Clone, Default)]
pub struct ConfigProvider {
    config: DaemonConfig,
    /// Options carried by task marker files, below the daemon config.
    markers: BTreeMap<String, toml::Table>,
}

impl ConfigProvider {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            markers: BTreeMap::new(),
        }
    }

    /// Attach options read from a task's marker file.
    pub fn add_task_marker(&mut self, task: &str, options: toml::Table) {
        self.markers.insert(task.to_string(), options);
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.config.daemon
    }

    /// Look up a dotted path in the global `[defaults]` table.
    pub fn get(&self, path: &str) -> Option<&toml::Value> {
        lookup(&self.config.defaults, path)
    }

    /// Look up a dotted path for one task: the `[tasks."<task>"]` table first,
    /// then the task's marker file.
    pub fn task_option(&self, name: &str, task: &str) -> Option<&toml::Value> {
        self.config
            .tasks
            .get(task)
            .and_then(|table| lookup(table, name))
            .or_else(|| self.markers.get(task).and_then(|table| lookup(table, name)))
    }

    /// Global defaults table.
    pub fn defaults(&self) -> &toml::Table {
        &self.config.defaults
    }

    /// Effective per-task table (config entries win over marker entries).
    pub fn task_table(&self, task: &str) -> toml::Table {
        let mut merged = self.markers.get(task).cloned().unwrap_or_default();
        if let Some(table) = self.config.tasks.get(task) {
            for (key, value) in table {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Integer option: task scope, then global defaults.
    pub fn option_i64(&self, name: &str, task: &str) -> Option<i64> {
        self.task_option(name, task)
            .and_then(toml::Value::as_integer)
            .or_else(|| self.get(name).and_then(toml::Value::as_integer))
    }

    /// String option: task scope, then global defaults.
    pub fn option_str(&self, name: &str, task: &str) -> Option<&str> {
        self.task_option(name, task)
            .and_then(toml::Value::as_str)
            .or_else(|| self.get(name).and_then(toml::Value::as_str))
    }
}

/// Resolve `a.b.c` against nested tables, accepting a literal quoted
/// `"a.b.c"` key as well.
fn lookup<'a>(table: &'a toml::Table, path: &str) -> Option<&'a toml::Value> {
    if let Some(value) = table.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut value = table.get(parts.next()?)?;
    for part in parts {
        value = value.as_table()?.get(part)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [daemon]
        name = "sample"
        sleep_tick_ms = 10

        [defaults]
        trigger.type = "interval"
        timer.interval.time = 2000000

        [tasks.report]
        enabled = true
        trigger.type = "cron"
        timer.cron.expression = "0 */5 * * * *"

        [tasks.idle]
        "executor.type" = "noop"
    "#;

    #[test]
    fn parses_sections() {
        let config = DaemonConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.daemon.name, "sample");
        assert_eq!(config.daemon.sleep_tick(), Duration::from_millis(10));
        // Unset fields keep their defaults
        assert_eq!(config.daemon.reap_poll_ms, 500);
        assert_eq!(config.tasks.len(), 2);
    }

    #[test]
    fn invalid_document_is_parse_error() {
        let result = DaemonConfig::from_toml_str("[daemon\nname=");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn enabled_tasks_only_lists_switched_on() {
        let config = DaemonConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.enabled_tasks(), vec!["report".to_string()]);
    }

    #[test]
    fn task_option_and_global_lookup() {
        let provider = ConfigProvider::new(DaemonConfig::from_toml_str(SAMPLE).unwrap());
        assert_eq!(
            provider.get("trigger.type").and_then(|v| v.as_str()),
            Some("interval")
        );
        assert_eq!(
            provider
                .task_option("trigger.type", "report")
                .and_then(|v| v.as_str()),
            Some("cron")
        );
        assert_eq!(
            provider
                .task_option("executor.type", "idle")
                .and_then(|v| v.as_str()),
            Some("noop")
        );
        assert!(provider.task_option("trigger.type", "idle").is_none());
        assert_eq!(provider.option_i64("timer.interval.time", "idle"), Some(2_000_000));
    }

    #[test]
    fn marker_options_sit_below_config() {
        let mut provider = ConfigProvider::new(DaemonConfig::from_toml_str(SAMPLE).unwrap());
        let marker: toml::Table = toml::from_str(
            r#"
            trigger.type = "interval"
            timer.interval.time = 42
            "#,
        )
        .unwrap();
        provider.add_task_marker("report", marker);

        assert_eq!(provider.option_str("trigger.type", "report"), Some("cron"));
        assert_eq!(provider.option_i64("timer.interval.time", "report"), Some(42));
    }

    #[test]
    fn env_overrides_paths() {
        let mut config = DaemonConfig::default();
        config.apply_env_from(|key| match key {
            "TASKD_PID_FILE" => Some("/run/custom.pid".to_string()),
            "TASKD_LOG_DIR" => Some("/var/log/custom".to_string()),
            _ => None,
        });
        assert_eq!(config.daemon.pid_file, PathBuf::from("/run/custom.pid"));
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/custom")));
        assert_eq!(config.daemon.name, "taskd");
    }
}
