//! Built-in queue and statistics components.

use async_trait::async_trait;
use chrono::Utc;

use super::{Queue, QueueItem, StatEvent, Statistics, StatisticsSnapshot};
use crate::error::QueueError;

/// Queue that never has pending work. Hard-coded fallback for tasks that
/// do not provide their own.
#[derive(Debug, Default)]
pub struct EmptyQueue;

#[async_trait]
impl Queue for EmptyQueue {
    async fn load(&mut self) -> Result<Vec<QueueItem>, QueueError> {
        Ok(Vec::new())
    }
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct MemoryStatistics {
    snapshot: StatisticsSnapshot,
}

impl MemoryStatistics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Statistics for MemoryStatistics {
    fn record(&mut self, event: StatEvent) {
        let s = &mut self.snapshot;
        match event {
            StatEvent::Loaded(count) => s.loaded += count as u64,
            StatEvent::Executed => {
                s.executed += 1;
                s.last_run = Some(Utc::now());
            }
            StatEvent::Failed => {
                s.failed += 1;
                s.last_run = Some(Utc::now());
            }
            StatEvent::CycleCompleted => s.cycles += 1,
        }
    }

    fn snapshot(&self) -> StatisticsSnapshot {
        self.snapshot.clone()
    }
}
