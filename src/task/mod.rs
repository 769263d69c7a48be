//! Task components: the pluggable parts a manager is assembled from.
//!
//! Every task is driven by one [`Manager`] wired from six further parts:
//! - `Trigger`: a [`Timer`] deciding how long to wait before the next load
//! - `Queue`: a [`Queue`] producing pending work items
//! - `Statistics`: [`Statistics`] counters over processed items
//! - `Process`: a [`Process`] running the loaded items
//! - `Executor`: an [`Executor`] performing one work item
//! - `Status`: a [`Status`] record of the running item's progress
//!
//! Concrete implementations are chosen per task by the [`factory`].

pub mod discovery;
pub mod executor;
pub mod factory;
pub mod manager;
pub mod process;
pub mod queue;
pub mod registry;
pub mod timer;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::daemon::pid::PidRegistry;
use crate::error::{Error, ExecutionError, FactoryError, QueueError};

pub use executor::ExecutionContext;
pub use factory::{ComponentFactory, ComponentRegistry};
pub use manager::TaskManager;
pub use registry::TaskRegistry;
pub use timer::{CronTimer, IntervalTimer, TimerKind};

/// The seven component kinds a task is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Manager,
    Trigger,
    Queue,
    Statistics,
    Process,
    Executor,
    Status,
}

impl ComponentKind {
    /// All kinds, in assembly order.
    pub const ALL: [ComponentKind; 7] = [
        Self::Manager,
        Self::Trigger,
        Self::Queue,
        Self::Statistics,
        Self::Process,
        Self::Executor,
        Self::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Trigger => "trigger",
            Self::Queue => "queue",
            Self::Statistics => "statistics",
            Self::Process => "process",
            Self::Executor => "executor",
            Self::Status => "status",
        }
    }

    /// Configuration key naming the implementation for this kind.
    pub fn type_key(&self) -> String {
        format!("{}.type", self.as_str())
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FactoryError::UnknownComponentKind(s.to_string()))
    }
}

/// One pending unit of work: an insertion-ordered mapping of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItem(Map<String, Value>);

impl QueueItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First required field absent from this item.
    pub fn missing_field<'a>(&self, required: &[&'a str]) -> Option<&'a str> {
        required.iter().copied().find(|field| !self.contains(field))
    }
}

impl From<Map<String, Value>> for QueueItem {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Progress of the item currently being executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub progress_percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionStatus {
    /// New status stamped now; progress is clamped to 100.
    pub fn new(progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            progress_percent: progress_percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(0, "idle")
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Events counted by [`Statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// A queue load returned this many items.
    Loaded(usize),
    /// One item executed successfully.
    Executed,
    /// One item failed.
    Failed,
    /// A full wait/load/execute cycle finished.
    CycleCompleted,
}

/// Point-in-time copy of a task's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub loaded: u64,
    pub executed: u64,
    pub failed: u64,
    pub cycles: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Result of running one loaded batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub executed: usize,
    pub failed: usize,
    /// Items left unexecuted because shutdown was requested.
    pub skipped: usize,
    /// Last wait override returned by the executor in this cycle.
    pub override_wait: Option<Duration>,
}

/// Computes how long to wait before the next queue load.
pub trait Timer: Send {
    fn kind(&self) -> TimerKind;

    /// Non-negative wait before the next load.
    fn time_to_wait(&mut self) -> Duration;

    /// Replace the wait of the next cycle only. Ignored by default.
    fn override_next(&mut self, _wait: Duration) {}
}

/// Source of pending work items.
#[async_trait]
pub trait Queue: Send {
    /// Load the current batch; an empty batch is not an error.
    async fn load(&mut self) -> Result<Vec<QueueItem>, QueueError>;
}

/// Aggregate counters over a queue's processed items.
pub trait Statistics: Send {
    fn record(&mut self, event: StatEvent);
    fn snapshot(&self) -> StatisticsSnapshot;
}

/// Progress record of the running item.
pub trait Status: Send {
    fn get(&self) -> ExecutionStatus;
    fn set(&mut self, status: ExecutionStatus);
}

/// Performs one work item.
#[async_trait]
pub trait Executor: Send {
    /// Fields every queue item must carry.
    fn required_fields(&self) -> &[&'static str] {
        &[]
    }

    /// Execute one item. `Ok(Some(wait))` asks an interval trigger to wait
    /// `wait` before the next load.
    async fn execute(
        &mut self,
        item: &QueueItem,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<Duration>, ExecutionError>;
}

/// Runs a loaded batch of items through the executor.
#[async_trait]
pub trait Process: Send {
    /// Called when attached to a manager; receives the manager's name.
    fn attach(&mut self, manager_name: &str);

    async fn run_items(
        &mut self,
        items: Vec<QueueItem>,
        executor: &mut dyn Executor,
        status: &mut dyn Status,
        statistics: &mut dyn Statistics,
        shutdown: &CancellationToken,
    ) -> CycleOutcome;
}

/// The capability set of a task manager.
///
/// Attach methods must be called in assembly order; each part can be attached
/// once.
#[async_trait]
pub trait Manager: Send + std::fmt::Debug {
    fn name(&self) -> &str;

    fn attach_trigger(&mut self, timer: Box<dyn Timer>) -> Result<(), FactoryError>;
    fn attach_queue(&mut self, queue: Box<dyn Queue>) -> Result<(), FactoryError>;
    fn attach_statistics(&mut self, statistics: Box<dyn Statistics>) -> Result<(), FactoryError>;
    fn attach_process(&mut self, process: Box<dyn Process>) -> Result<(), FactoryError>;
    fn attach_executor(&mut self, executor: Box<dyn Executor>) -> Result<(), FactoryError>;
    fn attach_status(&mut self, status: Box<dyn Status>) -> Result<(), FactoryError>;

    /// Parts not attached yet. Empty once fully assembled.
    fn missing_components(&self) -> Vec<ComponentKind>;

    /// Start the worker-side registry for this process.
    fn init(&mut self, parent_id: Option<u32>);

    fn pids(&self) -> Option<&PidRegistry>;

    /// Drive the wait/load/execute loop until `shutdown` is cancelled.
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_kind_parse() {
        assert_eq!("queue".parse::<ComponentKind>().unwrap(), ComponentKind::Queue);
        assert_eq!("Executor".parse::<ComponentKind>().unwrap(), ComponentKind::Executor);
        let err = "widget".parse::<ComponentKind>().unwrap_err();
        assert!(matches!(err, FactoryError::UnknownComponentKind(k) if k == "widget"));
    }

    #[test]
    fn component_kind_type_key() {
        assert_eq!(ComponentKind::Trigger.type_key(), "trigger.type");
        for kind in ComponentKind::ALL {
            assert_eq!(kind.to_string().parse::<ComponentKind>().unwrap(), kind);
        }
    }

    #[test]
    fn queue_item_keeps_insertion_order() {
        let item = QueueItem::new()
            .with("zeta", 1)
            .with("alpha", "two")
            .with("mid", true);
        let keys: Vec<&str> = item.fields().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn queue_item_missing_field() {
        let item = QueueItem::new().with("taskId", 3);
        assert_eq!(item.missing_field(&["taskId"]), None);
        assert_eq!(item.missing_field(&["taskId", "sleepTime"]), Some("sleepTime"));
    }

    #[test]
    fn execution_status_clamps_progress() {
        let status = ExecutionStatus::new(140, "overshoot");
        assert_eq!(status.progress_percent, 100);
        assert_eq!(ExecutionStatus::idle().progress_percent, 0);
    }
}
