//! Worker-side entry point.

use super::signals::SignalHandler;
use crate::error::{DaemonError, Error};
use crate::task::{ComponentFactory, TaskRegistry};

/// Assemble the task's manager in this process and run its loop until
/// `signals` reports shutdown.
///
/// The handler is taken already installed so a terminate signal forwarded
/// while the manager is still being assembled ends the worker cleanly.
pub async fn run_worker(
    task: &str,
    parent_pid: Option<u32>,
    mut factory: ComponentFactory,
    signals: SignalHandler,
) -> Result<(), Error> {
    // Marker options live next to the task definitions.
    let root = factory.config().settings().task_dir.clone();
    match TaskRegistry::new(&root).scan(&mut factory) {
        Ok(_) => {}
        Err(DaemonError::MissingSource(path)) => {
            tracing::debug!(path = %path.display(), "No task directory, using configuration only");
        }
        Err(e) => return Err(e.into()),
    }

    let mut manager = factory.get(task)?;
    manager.init(parent_pid);
    tracing::info!(task = %task, pid = std::process::id(), parent = ?parent_pid, "Worker started");

    manager.run(signals.token().clone()).await?;

    tracing::info!(task = %task, "Worker finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{ConfigProvider, DaemonConfig};
    use crate::daemon::signals::Role;
    use crate::daemon::state::{DaemonState, MemoryStore};
    use crate::error::FactoryError;
    use crate::task::ComponentRegistry;

    fn factory(root: &std::path::Path, tasks: &str) -> ComponentFactory {
        let source = format!("[daemon]\ntask_dir = {:?}\n{tasks}", root.display().to_string());
        ComponentFactory::new(
            ComponentRegistry::with_builtins(),
            ConfigProvider::new(DaemonConfig::from_toml_str(&source).unwrap()),
            DaemonState::new(Arc::new(MemoryStore::new())),
        )
    }

    #[tokio::test]
    async fn shutdown_before_first_cycle_exits_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let signals = SignalHandler::detached(Role::Worker, CancellationToken::new());
        signals.shutdown();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_worker("idle", Some(1), factory(root.path(), ""), signals),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn assembly_failure_is_returned() {
        let root = tempfile::tempdir().unwrap();
        let f = factory(
            root.path(),
            "[tasks.broken]\ntrigger.type = \"cron\"\ntimer.cron.expression = \"never\"\n",
        );
        let signals = SignalHandler::detached(Role::Worker, CancellationToken::new());

        let err = run_worker("broken", None, f, signals).await.unwrap_err();
        assert!(matches!(err, Error::Factory(FactoryError::Configuration { .. })));
    }
}
