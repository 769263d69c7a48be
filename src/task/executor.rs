//! Executor context and built-in executor/status components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ExecutionStatus, Executor, QueueItem, Status};
use crate::daemon::state::StateStore;
use crate::error::ExecutionError;

/// Handed to [`Executor::execute`] for the duration of one item.
pub struct ExecutionContext<'a> {
    task: &'a str,
    status: &'a mut dyn Status,
    shutdown: &'a CancellationToken,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(task: &'a str, status: &'a mut dyn Status, shutdown: &'a CancellationToken) -> Self {
        Self {
            task,
            status,
            shutdown,
        }
    }

    pub fn task(&self) -> &str {
        self.task
    }

    /// Report progress of the running item.
    pub fn update_status(&mut self, progress_percent: u8, message: impl Into<String>) {
        self.status
            .set(ExecutionStatus::new(progress_percent, message));
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status.get()
    }

    /// Whether the worker has been asked to shut down. Long-running executors
    /// may poll this to stop early.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        self.shutdown
    }
}

/// Executor that accepts every item and does nothing.
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(
        &mut self,
        item: &QueueItem,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<Duration>, ExecutionError> {
        tracing::debug!(task = %ctx.task(), fields = item.len(), "No-op executor skipping item");
        ctx.update_status(100, "skipped");
        Ok(None)
    }
}

/// Status kept in process memory only.
#[derive(Debug, Default)]
pub struct MemoryStatus {
    current: ExecutionStatus,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Status for MemoryStatus {
    fn get(&self) -> ExecutionStatus {
        self.current.clone()
    }

    fn set(&mut self, status: ExecutionStatus) {
        self.current = status;
    }
}

/// Status mirrored into the shared state store under `status/<task>` so
/// external monitors can follow progress. Store failures are logged and the
/// in-memory copy stays authoritative.
pub struct SharedStatus {
    key: String,
    store: Arc<dyn StateStore>,
    current: ExecutionStatus,
}

impl SharedStatus {
    pub fn new(task: &str, store: Arc<dyn StateStore>) -> Self {
        Self {
            key: format!("status/{task}"),
            store,
            current: ExecutionStatus::idle(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Status for SharedStatus {
    fn get(&self) -> ExecutionStatus {
        self.current.clone()
    }

    fn set(&mut self, status: ExecutionStatus) {
        let published = serde_json::to_value(&status)
            .map_err(crate::error::StateError::from)
            .and_then(|value| self.store.set(&self.key, value));
        if let Err(e) = published {
            tracing::warn!(key = %self.key, "Failed to publish status: {}", e);
        }
        self.current = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::state::MemoryStore;

    #[tokio::test]
    async fn noop_executor_marks_item_done() {
        let mut status = MemoryStatus::new();
        let token = CancellationToken::new();
        let mut ctx = ExecutionContext::new("demo", &mut status, &token);

        let result = NoopExecutor
            .execute(&QueueItem::new().with("id", 1), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(status.get().progress_percent, 100);
    }

    #[test]
    fn context_reports_cancellation() {
        let mut status = MemoryStatus::new();
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new("demo", &mut status, &token);
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn shared_status_publishes_to_store() {
        let store = Arc::new(MemoryStore::new());
        let mut status = SharedStatus::new("reports/daily", store.clone());
        status.set(ExecutionStatus::new(40, "halfway"));

        assert_eq!(status.get().message, "halfway");
        let published = store.get("status/reports/daily").unwrap().unwrap();
        assert_eq!(published["progress_percent"], 40);
        assert_eq!(published["message"], "halfway");
    }
}
