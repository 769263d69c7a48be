//! Demonstration task: loads a random batch of sleep jobs and works through
//! them, reporting progress in tenths.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::error::{ExecutionError, QueueError};
use crate::task::{ComponentRegistry, ExecutionContext, Executor, Queue, QueueItem};

/// Task directory / configuration name the sleep task registers under.
pub const TASK_NAME: &str = "example";

/// Upper bound on the batch size, overridable with `sleep.max_items`.
pub const DEFAULT_MAX_ITEMS: usize = 30;

const MAX_ITEMS_KEY: &str = "sleep.max_items";
const SLEEP_MICROS: std::ops::RangeInclusive<u64> = 100_000..=500_000;
const OVERRIDE_SECS: std::ops::RangeInclusive<u64> = 1..=5;

/// Register the sleep queue and executor as task classes for `task`.
pub fn register(registry: &mut ComponentRegistry, task: &str) {
    registry.register_task::<dyn Queue, _>(task, |ctx| {
        let max_items = ctx
            .config
            .option_i64(MAX_ITEMS_KEY, ctx.task)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_ITEMS);
        Ok(Box::new(SleepQueue::new(max_items)))
    });
    registry.register_task::<dyn Executor, _>(task, |_| Ok(Box::new(SleepExecutor)));
}

/// Produces between zero and `max_items` jobs per load.
#[derive(Debug, Clone)]
pub struct SleepQueue {
    max_items: usize,
}

impl SleepQueue {
    pub fn new(max_items: usize) -> Self {
        Self { max_items }
    }
}

#[async_trait]
impl Queue for SleepQueue {
    async fn load(&mut self) -> Result<Vec<QueueItem>, QueueError> {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..=self.max_items);
        Ok((0..count)
            .map(|id| {
                QueueItem::new()
                    .with("taskId", id as u64)
                    .with("sleepTime", rng.gen_range(SLEEP_MICROS))
            })
            .collect())
    }
}

/// Sleeps `sleepTime` microseconds nine times, then asks for a short random
/// wait before the next load.
#[derive(Debug, Default)]
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
    fn required_fields(&self) -> &[&'static str] {
        &["taskId", "sleepTime"]
    }

    async fn execute(
        &mut self,
        item: &QueueItem,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<Duration>, ExecutionError> {
        let step = item
            .get("sleepTime")
            .and_then(|v| v.as_u64())
            .map(Duration::from_micros)
            .ok_or_else(|| ExecutionError::Failed("sleepTime must be a positive integer".into()))?;
        let tag = Uuid::new_v4().simple().to_string()[..10].to_string();

        for tenth in 1..10u8 {
            tokio::select! {
                _ = ctx.shutdown().cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(step) => {}
            }
            ctx.update_status(tenth * 10, format!("Task data: {tag}"));
        }

        let wait = rand::thread_rng().gen_range(OVERRIDE_SECS);
        Ok(Some(Duration::from_secs(wait)))
    }
}
