//! Trigger timers: fixed interval and cron schedule.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Timer;

/// Wait used when no positive interval is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(15_000_000);

/// Schedule used when a cron trigger has no expression configured (daily).
pub const DEFAULT_CRON_EXPRESSION: &str = "0 0 0 * * *";

/// Configuration key for the interval length in microseconds.
pub const INTERVAL_TIME_KEY: &str = "timer.interval.time";

/// Configuration key for the cron expression.
pub const CRON_EXPRESSION_KEY: &str = "timer.cron.expression";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Interval,
    Cron,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
        };
        write!(f, "{s}")
    }
}

/// Waits a configured constant between loads.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval: Duration,
    next_override: Option<Duration>,
}

impl IntervalTimer {
    /// Interval of `configured_micros`; zero or negative selects [`DEFAULT_INTERVAL`].
    pub fn new(configured_micros: i64) -> Self {
        let interval = u64::try_from(configured_micros)
            .ok()
            .filter(|micros| *micros > 0)
            .map(Duration::from_micros)
            .unwrap_or(DEFAULT_INTERVAL);
        Self {
            interval,
            next_override: None,
        }
    }

    pub fn from_duration(interval: Duration) -> Self {
        let micros = i64::try_from(interval.as_micros()).unwrap_or(i64::MAX);
        Self::new(micros)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Timer for IntervalTimer {
    fn kind(&self) -> TimerKind {
        TimerKind::Interval
    }

    fn time_to_wait(&mut self) -> Duration {
        self.next_override.take().unwrap_or(self.interval)
    }

    fn override_next(&mut self, wait: Duration) {
        self.next_override = Some(wait);
    }
}

/// Waits until the next occurrence of a cron schedule.
///
/// Expressions use the six-field form `sec min hour day-of-month month
/// day-of-week` with an optional trailing year.
#[derive(Debug, Clone)]
pub struct CronTimer {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTimer {
    pub fn new(expression: &str) -> Result<Self, cron::error::Error> {
        let schedule = cron::Schedule::from_str(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next scheduled run strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// Wait from `now` until the next scheduled run.
    pub fn time_to_wait_at(&self, now: DateTime<Utc>) -> Duration {
        match self.next_after(now) {
            Some(next) => wait_until(next, now),
            None => {
                tracing::warn!(
                    expression = %self.expression,
                    "Cron schedule has no upcoming run, falling back to default interval"
                );
                DEFAULT_INTERVAL
            }
        }
    }
}

impl Timer for CronTimer {
    fn kind(&self) -> TimerKind {
        TimerKind::Cron
    }

    fn time_to_wait(&mut self) -> Duration {
        self.time_to_wait_at(Utc::now())
    }
}

/// `next - now`, or zero when `next` is not after `now`.
pub fn wait_until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    if next <= now {
        return Duration::ZERO;
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
