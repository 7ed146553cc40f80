use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Identifies a monitored target by its position in the configuration.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash)]
pub struct JobId(usize);

impl From<usize> for JobId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<JobId> for usize {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// A monitored target as tracked by the scheduler.
///
/// `next_due` only ever moves forward: after each dispatch it is set to the dispatch instant
/// plus `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub interval: Duration,
    pub next_due: Instant,
}

/// A ready-to-run check handed from the scheduler to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub job_id: JobId,
    pub url: String,
    pub dispatch_time: DateTime<Utc>,
}
