//! Integration tests for the orchestrator lifecycle.
//!
//! Workers are simulated by a fake spawner, so no real processes are
//! started. Time is paused; reap polling advances instantly.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskd::config::{ConfigProvider, DaemonConfig, DaemonSettings};
use taskd::daemon::{
    DaemonState, MemoryStore, ProcessOrchestrator, Role, RunStatus, SignalHandler, StateStore,
    WorkerExit, WorkerHandle, WorkerSpawner,
};
use taskd::error::{DaemonError, StateError};
use taskd::task::{ComponentFactory, ComponentRegistry, IntervalTimer, Manager, TaskManager};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// Exit by itself after this many polls.
    ExitAfterPolls(usize),
    /// Run until SIGTERM.
    UntilTerminated,
    /// Ignore SIGTERM; only a kill stops it.
    Stubborn,
}

#[derive(Debug, Default)]
struct World {
    next_pid: u32,
    spawned: Vec<(String, u32)>,
    parents: Vec<u32>,
    terminated: Vec<u32>,
    killed: Vec<u32>,
}

struct FakeSpawner {
    world: Arc<Mutex<World>>,
    behaviour: Behaviour,
    fail_on: Vec<&'static str>,
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&mut self, task: &str, parent_id: u32) -> io::Result<Box<dyn WorkerHandle>> {
        if self.fail_on.contains(&task) {
            return Err(io::Error::other("fork refused"));
        }
        let mut world = self.world.lock().unwrap();
        world.next_pid += 1;
        let id = 10_000 + world.next_pid;
        world.spawned.push((task.to_string(), id));
        world.parents.push(parent_id);
        Ok(Box::new(FakeHandle {
            id,
            world: self.world.clone(),
            behaviour: self.behaviour,
            polls: 0,
            terminated: false,
            killed: false,
        }))
    }
}

struct FakeHandle {
    id: u32,
    world: Arc<Mutex<World>>,
    behaviour: Behaviour,
    polls: usize,
    terminated: bool,
    killed: bool,
}

impl WorkerHandle for FakeHandle {
    fn id(&self) -> u32 {
        self.id
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        self.polls += 1;
        if self.killed {
            return Ok(Some(WorkerExit::signalled(9)));
        }
        Ok(match self.behaviour {
            Behaviour::ExitAfterPolls(n) if self.polls >= n => Some(WorkerExit::code(0)),
            Behaviour::UntilTerminated if self.terminated => Some(WorkerExit::code(0)),
            _ => None,
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminated = true;
        self.world.lock().unwrap().terminated.push(self.id);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        self.world.lock().unwrap().killed.push(self.id);
        Ok(())
    }
}

/// Memory store that also keeps every write.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingStore {
    fn values_of(&self, key: &str) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl StateStore for RecordingStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.clone()));
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.inner.remove(key)
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    settings: DaemonSettings,
    store: Arc<RecordingStore>,
    world: Arc<Mutex<World>>,
    factory: ComponentFactory,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = DaemonSettings {
            name: "itest".to_string(),
            pid_file: dir.path().join("run/taskd.pid"),
            task_dir: dir.path().join("tasks"),
            reap_poll_ms: 10,
            shutdown_grace_secs: 5,
            ..DaemonSettings::default()
        };
        let store = Arc::new(RecordingStore::default());
        let config = DaemonConfig {
            daemon: settings.clone(),
            ..DaemonConfig::default()
        };
        let factory = ComponentFactory::new(
            ComponentRegistry::with_builtins(),
            ConfigProvider::new(config),
            DaemonState::new(store.clone()),
        );
        Self {
            _dir: dir,
            settings,
            store,
            world: Arc::new(Mutex::new(World::default())),
            factory,
        }
    }

    fn orchestrator(&self, behaviour: Behaviour, fail_on: Vec<&'static str>) -> ProcessOrchestrator {
        let spawner = FakeSpawner {
            world: self.world.clone(),
            behaviour,
            fail_on,
        };
        ProcessOrchestrator::new(
            self.settings.clone(),
            DaemonState::new(self.store.clone()),
            Box::new(spawner),
        )
        .with_signal_handler(SignalHandler::detached(
            Role::Orchestrator,
            CancellationToken::new(),
        ))
    }

    fn register(&self, orchestrator: &mut ProcessOrchestrator, names: &[&str]) {
        for name in names {
            orchestrator.register(self.factory.get(name).unwrap()).unwrap();
        }
    }

    fn add_task_dir(&self, name: &str) {
        let dir = self.settings.task_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("task.toml"), "").unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn spawns_one_worker_per_manager_and_reaps_all() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(3), vec![]);
    fx.register(&mut orchestrator, &["alpha", "beta", "gamma"]);
    let own_pid = orchestrator.pids().current();

    let report = orchestrator.start().await.unwrap();

    let world = fx.world.lock().unwrap();
    let tasks: Vec<&str> = world.spawned.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(tasks, vec!["alpha", "beta", "gamma"]);
    assert!(world.parents.iter().all(|p| *p == own_pid));
    assert_eq!(report.spawned.len(), 3);
    assert_eq!(report.reaped.len(), 3);
    assert!(report.reaped.iter().all(|r| r.exit == Some(WorkerExit::code(0))));

    // Child ids were published on spawn and shrank to empty as workers were reaped.
    let child_ids = fx.store.values_of("childIds");
    assert_eq!(
        child_ids.first().unwrap(),
        &serde_json::json!([10_001, 10_002, 10_003])
    );
    assert_eq!(child_ids.last().unwrap(), &serde_json::json!([]));

    assert!(!fx.settings.pid_file.exists());
    assert_eq!(fx.store.get("state").unwrap(), None);
    assert_eq!(fx.store.get("name").unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn failed_spawn_does_not_affect_other_tasks() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec!["beta"]);
    fx.register(&mut orchestrator, &["alpha", "beta", "gamma"]);

    let report = orchestrator.start().await.unwrap();

    assert_eq!(report.spawn_failures, vec!["beta".to_string()]);
    let started: Vec<&str> = report.spawned.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(started, vec!["alpha", "gamma"]);
    assert_eq!(report.reaped.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_managers_exits_without_spawning() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec![]);

    let report = orchestrator.start().await.unwrap();

    assert!(report.spawned.is_empty());
    assert!(fx.world.lock().unwrap().spawned.is_empty());
    assert!(!fx.settings.pid_file.exists());
    assert_eq!(
        fx.store.values_of("state"),
        vec![serde_json::json!("running")]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_forwarded_to_workers() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::UntilTerminated, vec![]);
    fx.register(&mut orchestrator, &["alpha", "beta"]);
    let token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    let report = orchestrator.start().await.unwrap();

    let world = fx.world.lock().unwrap();
    assert_eq!(world.terminated, vec![10_001, 10_002]);
    assert!(world.killed.is_empty());
    assert_eq!(report.reaped.len(), 2);
    assert_eq!(
        fx.store.values_of("state"),
        vec![serde_json::json!("running"), serde_json::json!("stopped")]
    );
    assert!(!fx.settings.pid_file.exists());
}

#[tokio::test(start_paused = true)]
async fn stubborn_workers_are_killed_after_grace() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::Stubborn, vec![]);
    fx.register(&mut orchestrator, &["alpha"]);
    let token = orchestrator.shutdown_token();
    token.cancel();

    let started = tokio::time::Instant::now();
    let report = orchestrator.start().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(report.killed, vec![10_001]);
    assert_eq!(report.reaped[0].exit, Some(WorkerExit::signalled(9)));
}

#[tokio::test]
async fn register_rejects_incomplete_managers() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec![]);

    let mut partial = TaskManager::new("partial");
    partial
        .attach_trigger(Box::new(IntervalTimer::default()))
        .unwrap();
    let err = orchestrator.register(Box::new(partial)).unwrap_err();
    assert!(matches!(err, DaemonError::InvalidManagerKind { ref name, .. } if name == "partial"));

    let unnamed = fx.factory.get("").unwrap();
    assert!(matches!(
        orchestrator.register(unnamed),
        Err(DaemonError::InvalidManagerKind { .. })
    ));

    orchestrator.register(fx.factory.get("alpha").unwrap()).unwrap();
    assert!(orchestrator.register(fx.factory.get("alpha").unwrap()).is_err());
    assert_eq!(orchestrator.task_names(), vec!["alpha"]);
}

#[cfg(unix)]
#[tokio::test]
async fn live_pid_file_refuses_start() {
    let fx = Fixture::new();
    let live_pid = std::os::unix::process::parent_id();
    std::fs::create_dir_all(fx.settings.pid_file.parent().unwrap()).unwrap();
    std::fs::write(&fx.settings.pid_file, format!("{live_pid}\n")).unwrap();

    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec![]);
    fx.register(&mut orchestrator, &["alpha"]);
    let err = orchestrator.start().await.unwrap_err();

    assert!(matches!(err, DaemonError::AlreadyRunning { pid, .. } if pid == live_pid));
    assert!(fx.world.lock().unwrap().spawned.is_empty());
    assert_eq!(
        std::fs::read_to_string(&fx.settings.pid_file).unwrap(),
        format!("{live_pid}\n")
    );
}

#[tokio::test]
async fn registers_tasks_from_source_directory() {
    let mut fx = Fixture::new();
    fx.add_task_dir("example");
    fx.add_task_dir("reports/daily");
    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec![]);

    let task_dir = fx.settings.task_dir.clone();
    let count = orchestrator
        .register_from_source(&task_dir, &mut fx.factory)
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(orchestrator.task_names(), vec!["example", "reports/daily"]);
}

#[tokio::test]
async fn missing_source_directory_is_reported() {
    let mut fx = Fixture::new();
    let mut orchestrator = fx.orchestrator(Behaviour::ExitAfterPolls(1), vec![]);

    let err = orchestrator
        .register_from_source(Path::new("/definitely/not/here"), &mut fx.factory)
        .unwrap_err();

    assert!(matches!(err, DaemonError::MissingSource(_)));
    assert!(orchestrator.task_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn worker_loop_stops_when_daemon_marked_stopped() {
    let fx = Fixture::new();
    let mut manager = fx.factory.get("alpha").unwrap();
    manager.init(Some(1));
    DaemonState::new(fx.store.clone())
        .set_run_status(RunStatus::Stopped)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(60), manager.run(CancellationToken::new()))
        .await
        .expect("manager loop should end on stopped state")
        .unwrap();
}
