//! The parent process: spawns one worker per task and reaps them.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pid::{PidFile, PidRegistry};
use super::signals::{Role, SignalHandler};
use super::spawner::{WorkerExit, WorkerHandle, WorkerSpawner};
use super::state::{DaemonState, RunStatus};
use crate::config::DaemonSettings;
use crate::error::DaemonError;
use crate::task::{ComponentFactory, Manager, TaskRegistry};

/// A reaped worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedWorker {
    pub task: String,
    pub pid: u32,
    pub exit: Option<WorkerExit>,
}

/// What happened between `start` and shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `(task, pid)` of every worker started.
    pub spawned: Vec<(String, u32)>,
    /// Tasks whose worker could not be started.
    pub spawn_failures: Vec<String>,
    pub reaped: Vec<ReapedWorker>,
    /// Workers killed after the shutdown grace period.
    pub killed: Vec<u32>,
}

struct Worker {
    task: String,
    handle: Box<dyn WorkerHandle>,
}

pub struct ProcessOrchestrator {
    settings: DaemonSettings,
    state: DaemonState,
    pid_file: PidFile,
    pids: PidRegistry,
    managers: Vec<Box<dyn Manager>>,
    spawner: Box<dyn WorkerSpawner>,
    shutdown: CancellationToken,
    signals: Option<SignalHandler>,
}

impl ProcessOrchestrator {
    pub fn new(settings: DaemonSettings, state: DaemonState, spawner: Box<dyn WorkerSpawner>) -> Self {
        let pid_file = PidFile::new(&settings.pid_file);
        Self {
            settings,
            state,
            pid_file,
            pids: PidRegistry::for_current_process(),
            managers: Vec::new(),
            spawner,
            shutdown: CancellationToken::new(),
            signals: None,
        }
    }

    /// Use this handler instead of installing OS signal listeners at start.
    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        self.shutdown = handler.token().clone();
        self.signals = Some(handler);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pids(&self) -> &PidRegistry {
        &self.pids
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.managers.iter().map(|m| m.name()).collect()
    }

    /// Add a fully assembled manager to the active set.
    pub fn register(&mut self, manager: Box<dyn Manager>) -> Result<(), DaemonError> {
        let name = manager.name().to_string();
        if name.is_empty() {
            return Err(DaemonError::InvalidManagerKind {
                name,
                reason: "manager has no name".to_string(),
            });
        }
        let missing = manager.missing_components();
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
            return Err(DaemonError::InvalidManagerKind {
                name,
                reason: format!("missing components: {}", missing.join(", ")),
            });
        }
        if self.managers.iter().any(|m| m.name() == name) {
            return Err(DaemonError::InvalidManagerKind {
                name,
                reason: "a manager with this name is already registered".to_string(),
            });
        }
        tracing::debug!(task = %name, "Registered manager");
        self.managers.push(manager);
        Ok(())
    }

    /// Discover tasks under `path`, assemble and register one manager each.
    /// Returns how many were registered.
    pub fn register_from_source(
        &mut self,
        path: &Path,
        factory: &mut ComponentFactory,
    ) -> Result<usize, DaemonError> {
        let registry = TaskRegistry::new(path);
        let names = registry.scan(factory)?;
        let mut count = 0;
        for manager in TaskRegistry::load(&names, factory) {
            let name = manager.name().to_string();
            match self.register(manager) {
                Ok(()) => count += 1,
                Err(e) => tracing::error!(task = %name, "Skipping task: {}", e),
            }
        }
        tracing::info!(path = %path.display(), tasks = count, "Registered tasks from source");
        Ok(count)
    }

    /// Run the daemon until every worker has exited.
    pub async fn start(mut self) -> Result<ShutdownReport, DaemonError> {
        self.pid_file.ensure_not_running()?;
        self.pid_file.write(self.pids.current())?;

        let result = self.supervise().await;
        self.cleanup();
        result
    }

    async fn supervise(&mut self) -> Result<ShutdownReport, DaemonError> {
        self.state.set_run_status(RunStatus::Running)?;
        self.state.set_name(&self.settings.name)?;

        let mut report = ShutdownReport::default();
        if self.managers.is_empty() {
            tracing::info!("No daemon tasks found");
            return Ok(report);
        }

        let signals = match self.signals.take() {
            Some(handler) => handler,
            None => SignalHandler::install(Role::Orchestrator, self.shutdown.clone()),
        };

        let mut workers = BTreeMap::new();
        let parent_id = self.pids.current();
        for manager in &self.managers {
            let task = manager.name().to_string();
            match self.spawner.spawn(&task, parent_id) {
                Ok(handle) => {
                    let pid = handle.id();
                    self.pids.record_child(pid);
                    tracing::info!(task = %task, pid, "Started worker");
                    report.spawned.push((task.clone(), pid));
                    workers.insert(pid, Worker { task, handle });
                }
                Err(source) => {
                    let err = DaemonError::ForkFailure {
                        task: task.clone(),
                        source,
                    };
                    tracing::error!(severity = "CRIT", task = %task, "{}", err);
                    report.spawn_failures.push(task);
                }
            }
        }
        self.publish_children();

        self.reap_until_empty(&mut workers, &signals, &mut report).await;

        tracing::info!(
            spawned = report.spawned.len(),
            reaped = report.reaped.len(),
            "All workers exited"
        );
        Ok(report)
    }

    async fn reap_until_empty(
        &mut self,
        workers: &mut BTreeMap<u32, Worker>,
        signals: &SignalHandler,
        report: &mut ShutdownReport,
    ) {
        let poll = self.settings.reap_poll();
        let mut kill_deadline: Option<Instant> = None;

        while !workers.is_empty() {
            if kill_deadline.is_none() && self.shutdown.is_cancelled() {
                self.forward_shutdown(workers);
                kill_deadline = Some(Instant::now() + self.settings.shutdown_grace());
            }

            tokio::select! {
                _ = signals.child_event() => {}
                _ = self.shutdown.cancelled(), if kill_deadline.is_none() => {}
                _ = tokio::time::sleep(poll) => {}
            }

            self.reap_pass(workers, report);

            if let Some(deadline) = kill_deadline
                && Instant::now() >= deadline
                && !workers.is_empty()
            {
                for (pid, worker) in workers.iter_mut() {
                    tracing::warn!(task = %worker.task, pid = *pid, "Worker ignored shutdown, killing");
                    if let Err(e) = worker.handle.kill() {
                        tracing::error!(pid = *pid, "Failed to kill worker: {}", e);
                    }
                    report.killed.push(*pid);
                }
                // Pushed back so the kill is not repeated.
                kill_deadline = Some(deadline + self.settings.shutdown_grace().max(poll));
            }
        }
    }

    fn forward_shutdown(&mut self, workers: &mut BTreeMap<u32, Worker>) {
        tracing::info!(workers = workers.len(), "Shutdown requested, stopping workers");
        if let Err(e) = self.state.set_run_status(RunStatus::Stopped) {
            tracing::warn!("Failed to publish stopped state: {}", e);
        }
        for (pid, worker) in workers.iter_mut() {
            if let Err(e) = worker.handle.terminate() {
                tracing::warn!(task = %worker.task, pid = *pid, "Failed to signal worker: {}", e);
            }
        }
    }

    /// Collect every worker that has exited, without blocking.
    fn reap_pass(&mut self, workers: &mut BTreeMap<u32, Worker>, report: &mut ShutdownReport) {
        let mut exited = Vec::new();
        for (pid, worker) in workers.iter_mut() {
            match worker.handle.try_wait() {
                Ok(Some(exit)) => {
                    if exit.success() {
                        tracing::info!(task = %worker.task, pid = *pid, "Worker exited: {}", exit);
                    } else {
                        tracing::warn!(task = %worker.task, pid = *pid, "Worker exited: {}", exit);
                    }
                    exited.push((*pid, Some(exit)));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(task = %worker.task, pid = *pid, "Cannot wait on worker, dropping it: {}", e);
                    exited.push((*pid, None));
                }
            }
        }

        if exited.is_empty() {
            return;
        }
        for (pid, exit) in exited {
            if let Some(worker) = workers.remove(&pid) {
                self.pids.reap(pid);
                report.reaped.push(ReapedWorker {
                    task: worker.task,
                    pid,
                    exit,
                });
            }
        }
        self.publish_children();
    }

    fn publish_children(&self) {
        if let Err(e) = self.state.set_child_ids(self.pids.children()) {
            tracing::warn!("Failed to publish child ids: {}", e);
        }
    }

    fn cleanup(&self) {
        if let Err(e) = self.pid_file.remove() {
            tracing::warn!("{}", e);
        }
        if let Err(e) = self.state.release() {
            tracing::warn!("Failed to release daemon state: {}", e);
        }
        tracing::info!(pid = self.pids.current(), "Daemon stopped");
    }
}

impl std::fmt::Debug for ProcessOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOrchestrator")
            .field("pid_file", &self.pid_file)
            .field("pids", &self.pids)
            .field("tasks", &self.task_names())
            .finish_non_exhaustive()
    }
}
