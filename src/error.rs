//! Error types for taskd.

use std::path::PathBuf;

use crate::task::ComponentKind;

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Factory error: {0}")]
    Factory(#[from] FactoryError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Component resolution and assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("Task {task}: invalid {kind} configuration: {message}")]
    Configuration {
        task: String,
        kind: ComponentKind,
        message: String,
    },

    #[error("Unknown component kind: {0}")]
    UnknownComponentKind(String),

    #[error("Task {task}: cannot attach {kind}: {reason}")]
    Assembly {
        task: String,
        kind: ComponentKind,
        reason: String,
    },
}

/// Orchestrator and process lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Task source {0} is not a readable directory")]
    MissingSource(PathBuf),

    #[error("Manager {name:?} rejected: {reason}")]
    InvalidManagerKind { name: String, reason: String },

    #[error("Failed to spawn worker for task {task}: {source}")]
    ForkFailure {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon already running with pid {pid} (pid file {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Errors raised while executing a single queue item.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Queue item missing required field {field:?}")]
    MissingField { field: String },

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Execution cancelled")]
    Cancelled,
}

/// Errors raised while loading a queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue load failed: {0}")]
    LoadFailed(String),
}

/// Shared state store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state key {0:?}")]
    InvalidKey(String),
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
