//! Deciding when each target is due and feeding due checks into the task queue.
//!
//! The [`JobTable`] is a min-heap keyed by due time, ties broken by configuration order. The
//! [`Scheduler`] owns the table, so no synchronisation is needed around it.
use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use crate::{
    config::Target,
    job::{Job, JobId, Task},
    queue::{EnqueueError, TaskSender},
    shutdown::ShutdownSignal,
};

/// The monitored jobs, ordered by when they are next due.
#[derive(Debug)]
pub struct JobTable {
    jobs: Vec<Job>,
    schedule: BinaryHeap<Reverse<(Instant, JobId)>>,
}

impl JobTable {
    /// Builds the table with each job first due one interval after `start`.
    pub fn new(targets: impl IntoIterator<Item = Target>, start: Instant) -> Self {
        let jobs = targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| Job {
                id: index.into(),
                url: target.url,
                interval: target.interval,
                next_due: due_after(start, target.interval),
            })
            .collect::<Vec<_>>();
        let schedule = jobs
            .iter()
            .map(|job| Reverse((job.next_due, job.id)))
            .collect();
        Self { jobs, schedule }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(usize::from(id))
    }

    /// When the earliest job is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.schedule.peek().map(|Reverse((due, _))| *due)
    }

    /// Removes every job due at or before `now` and reschedules each one `interval` after `now`.
    ///
    /// Jobs are returned in dispatch order.
    pub fn take_due(&mut self, now: Instant) -> Vec<JobId> {
        let mut due = Vec::new();
        while let Some(Reverse((next_due, id))) = self.schedule.peek().copied() {
            if next_due > now {
                break;
            }
            self.schedule.pop();
            due.push(id);
        }
        for id in &due {
            let job = &mut self.jobs[usize::from(*id)];
            job.next_due = due_after(now, job.interval);
            self.schedule.push(Reverse((job.next_due, job.id)));
        }
        due
    }
}

/// `from + interval`, saturating at the longest interval a target may have.
fn due_after(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval)
        .or_else(|| from.checked_add(Target::MAX_INTERVAL))
        .unwrap_or(from)
}

/// Feeds due jobs into the task queue until shutdown.
pub struct Scheduler {
    table: JobTable,
    tasks: TaskSender,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        table: JobTable,
        tasks: TaskSender,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            table,
            tasks,
            shutdown,
            poll_interval,
        }
    }

    /// Runs until shutdown is requested, returning the number of tasks enqueued.
    ///
    /// Jobs that are due when shutdown is observed are abandoned.
    #[instrument(name = "scheduler", skip_all)]
    pub async fn run(mut self) -> Result<u64, SchedulerError> {
        tracing::info!(jobs = self.table.len(), "Starting scheduler");
        let mut dispatched = 0;

        'ticks: while !self.shutdown.is_triggered() {
            let now = Instant::now();
            let dispatch_time = Utc::now();
            for job_id in self.table.take_due(now) {
                let Some(job) = self.table.job(job_id) else {
                    continue;
                };
                let task = Task {
                    job_id,
                    url: job.url.clone(),
                    dispatch_time,
                };
                tracing::debug!(%job_id, url = %task.url, "Queuing task");
                if !self.dispatch(task).await? {
                    break 'ticks;
                }
                dispatched += 1;
            }

            let wake = self
                .table
                .next_due()
                .map_or(now + self.poll_interval, |due| {
                    due.min(now + self.poll_interval)
                });
            tracing::trace!(sleep = ?wake.saturating_duration_since(now), "Sleeping until next deadline");
            tokio::select! {
                _ = self.shutdown.triggered() => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }

        tracing::info!(dispatched, "Scheduler shutting down");
        Ok(dispatched)
    }

    /// Enqueues `task`, blocking while the queue is full.
    ///
    /// Returns `false` if shutdown was requested before the task was accepted.
    async fn dispatch(&self, mut task: Task) -> Result<bool, SchedulerError> {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Ok(false),
                result = self.tasks.enqueue(task, self.poll_interval) => result,
            };
            match result {
                Ok(()) => return Ok(true),
                Err(EnqueueError::Full(returned)) => {
                    tracing::warn!(
                        url = %returned.url,
                        capacity = self.tasks.capacity(),
                        "Task queue is full, workers are not keeping up",
                    );
                    task = returned;
                }
                Err(EnqueueError::Closed(_)) => return Err(SchedulerError::QueueClosed),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task queue closed while the scheduler was running")]
    QueueClosed,
}
