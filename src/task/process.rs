//! In-worker sequential item processing.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    CycleOutcome, ExecutionContext, ExecutionStatus, Executor, Process, QueueItem, StatEvent,
    Statistics, Status,
};
use crate::error::ExecutionError;

/// Runs every item inside the worker process, one after another, in load
/// order. A failing item is logged and counted; the batch continues.
#[derive(Debug, Default)]
pub struct SameProcess {
    name: String,
}

impl SameProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager name copied in at attach time.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Process for SameProcess {
    fn attach(&mut self, manager_name: &str) {
        self.name = manager_name.to_string();
    }

    async fn run_items(
        &mut self,
        items: Vec<QueueItem>,
        executor: &mut dyn Executor,
        status: &mut dyn Status,
        statistics: &mut dyn Statistics,
        shutdown: &CancellationToken,
    ) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            // In-flight items finish; the rest of the batch is dropped on shutdown.
            if shutdown.is_cancelled() {
                outcome.skipped += total - index;
                tracing::info!(
                    task = %self.name,
                    skipped = outcome.skipped,
                    "Shutdown requested, skipping remaining items"
                );
                break;
            }

            status.set(ExecutionStatus::new(
                0,
                format!("running item {}/{}", index + 1, total),
            ));

            let result = match item.missing_field(executor.required_fields()) {
                Some(field) => Err(ExecutionError::MissingField {
                    field: field.to_string(),
                }),
                None => {
                    let mut ctx = ExecutionContext::new(&self.name, status, shutdown);
                    executor.execute(&item, &mut ctx).await
                }
            };

            match result {
                Ok(override_wait) => {
                    outcome.executed += 1;
                    if override_wait.is_some() {
                        outcome.override_wait = override_wait;
                    }
                    statistics.record(StatEvent::Executed);
                    tracing::debug!(task = %self.name, item = index, "Item executed");
                }
                Err(ExecutionError::Cancelled) => {
                    outcome.skipped += 1;
                    status.set(ExecutionStatus::new(
                        status.get().progress_percent,
                        "cancelled".to_string(),
                    ));
                    tracing::info!(task = %self.name, item = index, "Item interrupted by shutdown");
                }
                Err(e) => {
                    outcome.failed += 1;
                    statistics.record(StatEvent::Failed);
                    status.set(ExecutionStatus::new(
                        status.get().progress_percent,
                        format!("failed: {e}"),
                    ));
                    tracing::error!(task = %self.name, item = index, "Item failed: {}", e);
                }
            }
        }

        outcome
    }
}
