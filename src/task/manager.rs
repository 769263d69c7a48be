//! The per-task control loop: wait, load, execute, repeat.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ComponentKind, CycleOutcome, ExecutionStatus, Executor, Manager, Process, Queue, StatEvent,
    Statistics, StatisticsSnapshot, Status, Timer, TimerKind,
};
use crate::daemon::pid::PidRegistry;
use crate::daemon::state::{DaemonState, RunStatus};
use crate::error::{Error, FactoryError};

/// Default length of one sleep increment while waiting for the next load.
pub const DEFAULT_SLEEP_TICK: Duration = Duration::from_millis(250);

/// Standard manager: owns one of each component and drives them in a loop.
pub struct TaskManager {
    name: String,
    sleep_tick: Duration,
    trigger: Option<Box<dyn Timer>>,
    queue: Option<Box<dyn Queue>>,
    statistics: Option<Box<dyn Statistics>>,
    process: Option<Box<dyn Process>>,
    executor: Option<Box<dyn Executor>>,
    status: Option<Box<dyn Status>>,
    pids: Option<PidRegistry>,
    daemon_state: Option<DaemonState>,
}

impl TaskManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sleep_tick: DEFAULT_SLEEP_TICK,
            trigger: None,
            queue: None,
            statistics: None,
            process: None,
            executor: None,
            status: None,
            pids: None,
            daemon_state: None,
        }
    }

    pub fn with_sleep_tick(mut self, tick: Duration) -> Self {
        self.sleep_tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Stop the loop once the orchestrator marks the daemon stopped.
    pub fn with_daemon_state(mut self, state: DaemonState) -> Self {
        self.daemon_state = Some(state);
        self
    }

    pub fn sleep_tick(&self) -> Duration {
        self.sleep_tick
    }

    pub fn timer_kind(&self) -> Option<TimerKind> {
        self.trigger.as_ref().map(|t| t.kind())
    }

    pub fn statistics(&self) -> Option<StatisticsSnapshot> {
        self.statistics.as_ref().map(|s| s.snapshot())
    }

    pub fn status(&self) -> Option<ExecutionStatus> {
        self.status.as_ref().map(|s| s.get())
    }

    fn is_attached(&self, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Manager => true,
            ComponentKind::Trigger => self.trigger.is_some(),
            ComponentKind::Queue => self.queue.is_some(),
            ComponentKind::Statistics => self.statistics.is_some(),
            ComponentKind::Process => self.process.is_some(),
            ComponentKind::Executor => self.executor.is_some(),
            ComponentKind::Status => self.status.is_some(),
        }
    }

    /// Each part attaches once, after the part preceding it in assembly order.
    fn check_attach(&self, kind: ComponentKind) -> Result<(), FactoryError> {
        let assembly_error = |reason: String| FactoryError::Assembly {
            task: self.name.clone(),
            kind,
            reason,
        };
        if self.is_attached(kind) {
            return Err(assembly_error("already attached".to_string()));
        }
        let position = ComponentKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        if let Some(previous) = position.checked_sub(1).map(|p| ComponentKind::ALL[p])
            && !self.is_attached(previous)
        {
            return Err(assembly_error(format!("{previous} must be attached first")));
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        let Some(state) = &self.daemon_state else {
            return false;
        };
        match state.run_status() {
            Ok(Some(RunStatus::Stopped)) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(task = %self.name, "Failed to read daemon state: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.name)
            .field("sleep_tick", &self.sleep_tick)
            .field("missing", &self.missing_components())
            .field("pids", &self.pids)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Manager for TaskManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach_trigger(&mut self, timer: Box<dyn Timer>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Trigger)?;
        self.trigger = Some(timer);
        Ok(())
    }

    fn attach_queue(&mut self, queue: Box<dyn Queue>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Queue)?;
        self.queue = Some(queue);
        Ok(())
    }

    fn attach_statistics(&mut self, statistics: Box<dyn Statistics>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Statistics)?;
        self.statistics = Some(statistics);
        Ok(())
    }

    fn attach_process(&mut self, mut process: Box<dyn Process>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Process)?;
        process.attach(&self.name);
        self.process = Some(process);
        Ok(())
    }

    fn attach_executor(&mut self, executor: Box<dyn Executor>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Executor)?;
        self.executor = Some(executor);
        Ok(())
    }

    fn attach_status(&mut self, status: Box<dyn Status>) -> Result<(), FactoryError> {
        self.check_attach(ComponentKind::Status)?;
        self.status = Some(status);
        Ok(())
    }

    fn missing_components(&self) -> Vec<ComponentKind> {
        ComponentKind::ALL
            .into_iter()
            .filter(|kind| !self.is_attached(*kind))
            .collect()
    }

    fn init(&mut self, parent_id: Option<u32>) {
        let pids = PidRegistry::for_worker(parent_id);
        tracing::debug!(
            task = %self.name,
            pid = pids.current(),
            parent = ?pids.parent(),
            "Manager initialised"
        );
        self.pids = Some(pids);
    }

    fn pids(&self) -> Option<&PidRegistry> {
        self.pids.as_ref()
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), Error> {
        if let Some(kind) = self.missing_components().first().copied() {
            return Err(FactoryError::Assembly {
                task: self.name.clone(),
                kind,
                reason: "manager not fully assembled".to_string(),
            }
            .into());
        }
        let name = self.name.clone();
        let tick = self.sleep_tick;

        tracing::info!(task = %name, "Task loop started");

        loop {
            let Self {
                trigger: Some(trigger),
                ..
            } = self
            else {
                break;
            };
            let wait = trigger.time_to_wait();
            tracing::debug!(task = %name, wait_ms = wait.as_millis() as u64, "Waiting for next load");

            if !sleep_in_increments(wait, tick, &shutdown).await {
                break;
            }
            if self.stop_requested() {
                tracing::info!(task = %name, "Daemon marked stopped, leaving task loop");
                break;
            }

            let cycle = Uuid::new_v4();
            let Self {
                trigger: Some(trigger),
                queue: Some(queue),
                statistics: Some(statistics),
                process: Some(process),
                executor: Some(executor),
                status: Some(status),
                ..
            } = self
            else {
                break;
            };

            let items = match queue.load().await {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!(task = %name, %cycle, "Queue load failed: {}", e);
                    Vec::new()
                }
            };
            statistics.record(StatEvent::Loaded(items.len()));

            let outcome = if items.is_empty() {
                CycleOutcome::default()
            } else {
                process
                    .run_items(
                        items,
                        executor.as_mut(),
                        status.as_mut(),
                        statistics.as_mut(),
                        &shutdown,
                    )
                    .await
            };
            statistics.record(StatEvent::CycleCompleted);

            if let Some(wait) = outcome.override_wait {
                match trigger.kind() {
                    TimerKind::Interval => trigger.override_next(wait),
                    TimerKind::Cron => {
                        tracing::debug!(task = %name, %cycle, "Cron trigger ignores wait override")
                    }
                }
            }

            tracing::info!(
                task = %name,
                %cycle,
                executed = outcome.executed,
                failed = outcome.failed,
                skipped = outcome.skipped,
                "Cycle completed"
            );

            if shutdown.is_cancelled() {
                break;
            }
        }

        tracing::info!(task = %name, "Task loop stopped");
        Ok(())
    }
}

/// Sleep `total` in steps of at most `tick`, racing each step against
/// `shutdown`. Returns `false` when cancelled before the full wait elapsed.
pub async fn sleep_in_increments(
    total: Duration,
    tick: Duration,
    shutdown: &CancellationToken,
) -> bool {
    let tick = tick.max(Duration::from_millis(1));
    let mut remaining = total;
    while !remaining.is_zero() {
        let step = remaining.min(tick);
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(step) => {}
        }
        remaining = remaining.saturating_sub(step);
    }
    !shutdown.is_cancelled()
}
