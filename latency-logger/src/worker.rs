//! Turning tasks into latency records.
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use thiserror::Error;
use tracing::instrument;

use crate::{
    job::Task,
    panic_message,
    probe::{Probe, ProbeError},
    publisher::{PublishError, Publisher},
    queue::{QueueClosed, TaskReceiver},
    record::{LatencyRecord, Outcome},
    shutdown::ShutdownSignal,
};

/// One of the concurrent executors draining the task queue.
pub struct Worker<P, B> {
    name: String,
    tasks: TaskReceiver,
    probe: Arc<P>,
    publisher: B,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl<P, B> Worker<P, B>
where
    P: Probe + Send + Sync + 'static,
    B: Publisher + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        tasks: TaskReceiver,
        probe: Arc<P>,
        publisher: B,
        shutdown: ShutdownSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            tasks,
            probe,
            publisher,
            shutdown,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Processes tasks until shutdown is requested, returning how many were processed.
    ///
    /// A task which has been taken from the queue is always completed, even when shutdown is
    /// requested in the meantime.
    pub async fn run(self) -> Result<u64, WorkerError> {
        tracing::info!(worker = %self.name, "Starting worker");
        let mut processed = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                next = self.tasks.dequeue(self.poll_interval) => next,
            };
            match next {
                Ok(Some(task)) => {
                    self.process(task).await?;
                    processed += 1;
                }
                Ok(None) => tracing::trace!(worker = %self.name, "No task to process"),
                Err(QueueClosed) => {
                    tracing::debug!(worker = %self.name, "Task queue closed");
                    break;
                }
            }
        }
        tracing::info!(worker = %self.name, processed, "Worker shutting down");
        Ok(processed)
    }

    #[instrument(skip_all, fields(worker = %self.name, job_id = %task.job_id, url = %task.url))]
    async fn process(&self, task: Task) -> Result<(), WorkerError> {
        let outcome = self.check(&task.url).await;
        let record = LatencyRecord::new(task, &self.name, outcome);

        let published = AssertUnwindSafe(self.publisher.publish(&record))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PublishError::Rejected(panic_message(&*panic))));

        match published {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => {
                tracing::error!(?error, "Message bus is unusable, stopping worker: {error}");
                Err(WorkerError::Publisher(error))
            }
            Err(error) => {
                tracing::warn!(?error, "Dropping latency record: {error}");
                Ok(())
            }
        }
    }

    /// Runs the probe in its own task so that a panic in the HTTP client fails only this check.
    async fn check(&self, url: &str) -> Outcome {
        let probe = Arc::clone(&self.probe);
        let target = url.to_owned();
        match tokio::spawn(async move { probe.perform(&target).await }).await {
            Ok(Ok(response)) => {
                tracing::debug!(
                    status_code = response.status_code,
                    first_byte = ?response.first_byte,
                    latency = ?response.elapsed,
                    "Check complete"
                );
                response.into()
            }
            Ok(Err(error)) => {
                tracing::warn!(?error, "Check failed: {error}");
                error.into()
            }
            Err(error) => {
                let error = ProbeError::from(error);
                tracing::error!(?error, "Check panicked: {error}");
                error.into()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Message bus connection is unusable")]
    Publisher(#[from] PublishError),
}

#[cfg(test)]
pub(crate) mod test {
    use std::num::NonZeroUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::{task::JoinHandle, time::Instant};

    use super::*;
    use crate::{
        probe::{MockProbe, ProbeResponse},
        publisher::memory::InMemoryPublisher,
        queue::{self, TaskReceiver, TaskSender},
        record::ErrorKind,
    };

    /// A probe which answers after a fixed delay, panicking for URLs containing `panic`.
    pub(crate) struct ScriptedProbe {
        pub(crate) delay: Duration,
        pub(crate) result: Result<u16, ProbeError>,
    }

    impl ScriptedProbe {
        pub(crate) fn responding(status_code: u16, delay: Duration) -> Self {
            Self {
                delay,
                result: Ok(status_code),
            }
        }

        pub(crate) fn failing(error: ProbeError) -> Self {
            Self {
                delay: Duration::ZERO,
                result: Err(error),
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn perform(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            if url.contains("panic") {
                panic!("probe exploded checking {url}");
            }
            self.result.clone().map(|status_code| ProbeResponse {
                status_code,
                first_byte: started.elapsed(),
                elapsed: started.elapsed(),
            })
        }
    }

    fn task(url: &str) -> Task {
        Task {
            job_id: 0.into(),
            url: url.to_owned(),
            dispatch_time: Utc::now(),
        }
    }

    async fn spawn_worker<P>(
        probe: P,
        publisher: InMemoryPublisher,
        urls: &[&str],
    ) -> (
        ShutdownSignal,
        (TaskSender, TaskReceiver),
        JoinHandle<Result<u64, WorkerError>>,
    )
    where
        P: Probe + Send + Sync + 'static,
    {
        let shutdown = ShutdownSignal::new();
        let (sender, receiver) = queue::bounded(NonZeroUsize::new(16).unwrap());
        for url in urls {
            sender.enqueue(task(url), Duration::from_secs(1)).await.unwrap();
        }
        let worker = Worker::new(
            "worker-0",
            receiver.clone(),
            Arc::new(probe),
            publisher,
            shutdown.clone(),
            Duration::from_secs(1),
        );
        (shutdown, (sender, receiver), tokio::spawn(worker.run()))
    }

    async fn wait_for_records(publisher: &InMemoryPublisher, count: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while publisher.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("records should be published");
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_a_record_per_task() {
        let mut probe = MockProbe::new();
        probe.expect_perform().times(3).returning(|_| {
            Ok(ProbeResponse {
                status_code: 200,
                first_byte: Duration::from_millis(20),
                elapsed: Duration::from_millis(50),
            })
        });
        let publisher = InMemoryPublisher::new();
        let urls = ["https://localhost/0", "https://localhost/1", "https://localhost/2"];

        let (shutdown, _queue, handle) = spawn_worker(probe, publisher.clone(), &urls).await;
        wait_for_records(&publisher, 3).await;
        shutdown.trigger();

        assert_matches!(handle.await.unwrap(), Ok(3));
        let records = publisher.records();
        assert_eq!(
            records.iter().map(|record| record.url.as_str()).collect::<Vec<_>>(),
            urls
        );
        for record in records {
            assert_eq!(record.worker, "worker-0");
            assert_eq!(
                record.outcome,
                Outcome::Success {
                    status_code: 200,
                    first_byte: Duration::from_millis(20),
                    latency: Duration::from_millis(50)
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_checks_are_published_as_failures() {
        let probe = ScriptedProbe::failing(ProbeError::new(
            ErrorKind::Connect,
            "tcp connect error: Connection refused",
        ));
        let publisher = InMemoryPublisher::new();

        let (shutdown, _queue, handle) =
            spawn_worker(probe, publisher.clone(), &["http://127.0.0.1:1/", "http://127.0.0.1:2/"])
                .await;
        wait_for_records(&publisher, 2).await;
        shutdown.trigger();

        assert_matches!(handle.await.unwrap(), Ok(2));
        for record in publisher.records() {
            assert_matches!(
                record.outcome,
                Outcome::Failure { error_kind: ErrorKind::Connect, .. }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_panic_fails_only_that_check() {
        let probe = ScriptedProbe::responding(200, Duration::from_millis(5));
        let publisher = InMemoryPublisher::new();

        let (shutdown, _queue, handle) = spawn_worker(
            probe,
            publisher.clone(),
            &["https://localhost/panic", "https://localhost/ok"],
        )
        .await;
        wait_for_records(&publisher, 2).await;
        shutdown.trigger();

        assert_matches!(handle.await.unwrap(), Ok(2));
        let records = publisher.records();
        assert_matches!(
            &records[0].outcome,
            Outcome::Failure { error_kind: ErrorKind::Panic, error_detail }
                if error_detail == "probe exploded checking https://localhost/panic"
        );
        assert_matches!(records[1].outcome, Outcome::Success { status_code: 200, .. });
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_records_are_dropped() {
        let probe = ScriptedProbe::responding(200, Duration::ZERO);
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(PublishError::Rejected("message too large".to_owned()));

        let (shutdown, _queue, handle) = spawn_worker(
            probe,
            publisher.clone(),
            &["https://localhost/dropped", "https://localhost/kept"],
        )
        .await;
        wait_for_records(&publisher, 1).await;
        // Give the worker a chance to publish anything it shouldn't have.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();

        assert_matches!(handle.await.unwrap(), Ok(2));
        let records = publisher.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://localhost/kept");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_publish_error_stops_the_worker() {
        let probe = ScriptedProbe::responding(200, Duration::ZERO);
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(PublishError::Fatal("authentication failed".to_owned()));

        let (shutdown, _queue, handle) = spawn_worker(
            probe,
            publisher.clone(),
            &["https://localhost/0", "https://localhost/1"],
        )
        .await;

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert_matches!(result, Ok(Ok(Err(WorkerError::Publisher(PublishError::Fatal(_))))));
        assert!(publisher.is_empty());
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_stops_within_the_poll_interval() {
        let probe = MockProbe::new();
        let publisher = InMemoryPublisher::new();

        let (shutdown, _queue, handle) = spawn_worker(probe, publisher, &[]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_matches!(result, Ok(Ok(Ok(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_task_completes_after_shutdown() {
        let probe = ScriptedProbe::responding(200, Duration::from_secs(3));
        let publisher = InMemoryPublisher::new();

        let (shutdown, (_sender, receiver), handle) = spawn_worker(
            probe,
            publisher.clone(),
            &["https://localhost/slow", "https://localhost/never"],
        )
        .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        assert_matches!(handle.await.unwrap(), Ok(1));
        assert_eq!(publisher.len(), 1);
        assert_eq!(publisher.records()[0].url, "https://localhost/slow");
        assert_eq!(receiver.drain().len(), 1);
    }
}
