use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use taskd::config::{ConfigProvider, DaemonConfig};
use taskd::daemon::{
    CommandSpawner, DaemonState, FileStore, ProcessOrchestrator, Role, SignalHandler, StateStore,
};
use taskd::error::DaemonError;
use taskd::task::{ComponentFactory, ComponentRegistry, TaskRegistry};

#[derive(Debug, Parser)]
#[command(name = "taskd", version, about = "Background task-processing daemon")]
struct Cli {
    /// Configuration file (defaults to ./taskd.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the orchestrator and one worker per task (default)
    Run,
    /// Run a single task's loop in this process
    Worker {
        #[arg(long)]
        task: String,
        #[arg(long)]
        parent_pid: Option<u32>,
    },
    /// Print discovered tasks and the components they resolve to
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DaemonConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(config.daemon.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(config, cli.config).await,
            Command::Worker { task, parent_pid } => worker(config, &task, parent_pid).await,
            Command::List => list(config),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Stderr logging filtered by `RUST_LOG` (default `info`), plus a
/// `taskd.log` file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "taskd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}

fn build_factory(config: DaemonConfig) -> anyhow::Result<ComponentFactory> {
    let store: Arc<dyn StateStore> = Arc::new(
        FileStore::open(&config.daemon.state_dir).with_context(|| {
            format!("cannot open state directory {}", config.daemon.state_dir.display())
        })?,
    );
    let mut registry = ComponentRegistry::with_builtins();
    taskd::tasks::register_all(&mut registry);
    Ok(ComponentFactory::new(
        registry,
        ConfigProvider::new(config),
        DaemonState::new(store),
    ))
}

async fn run(config: DaemonConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = config.daemon.clone();
    let mut factory = build_factory(config)?;
    let spawner = CommandSpawner::current_exe(config_path).context("cannot locate own executable")?;

    let mut orchestrator =
        ProcessOrchestrator::new(settings.clone(), factory.state().clone(), Box::new(spawner));
    match orchestrator.register_from_source(&settings.task_dir, &mut factory) {
        Ok(_) => {}
        Err(e @ DaemonError::MissingSource(_)) => {
            tracing::warn!("{}, continuing without tasks", e);
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(
        name = %settings.name,
        pid = std::process::id(),
        tasks = orchestrator.task_names().len(),
        "Starting daemon"
    );
    let report = orchestrator.start().await?;
    tracing::info!(
        spawned = report.spawned.len(),
        failed = report.spawn_failures.len(),
        killed = report.killed.len(),
        "Clean shutdown"
    );
    Ok(())
}

async fn worker(config: DaemonConfig, task: &str, parent_pid: Option<u32>) -> anyhow::Result<()> {
    // Installed first: the orchestrator may forward SIGTERM at any point.
    let signals = SignalHandler::install(Role::Worker, CancellationToken::new());
    let factory = build_factory(config)?;
    taskd::daemon::worker::run_worker(task, parent_pid, factory, signals)
        .await
        .with_context(|| format!("worker for task {task} failed"))
}

fn list(config: DaemonConfig) -> anyhow::Result<()> {
    let task_dir = config.daemon.task_dir.clone();
    let mut factory = build_factory(config)?;
    let names = match TaskRegistry::new(&task_dir).scan(&mut factory) {
        Ok(names) => names,
        Err(e @ DaemonError::MissingSource(_)) => {
            eprintln!("{e}");
            factory.config().config().enabled_tasks()
        }
        Err(e) => return Err(e.into()),
    };

    if names.is_empty() {
        println!("No daemon tasks found");
        return Ok(());
    }
    for name in names {
        println!("{name}");
        match factory.describe(&name) {
            Ok(resolved) => {
                for (kind, resolution) in resolved {
                    println!("  {:<10} {} ({})", kind, resolution.id, resolution.source);
                }
            }
            Err(e) => println!("  error: {e}"),
        }
    }
    Ok(())
}
