//! The bounded task queue between the scheduler and the workers.
//!
//! The queue is a bounded multi-producer, multi-consumer FIFO. Every blocking operation takes a
//! timeout so that callers can re-check the shutdown signal at a bounded interval. Each [`Task`]
//! is delivered to exactly one [`TaskReceiver`].
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    Mutex,
};

use crate::job::Task;

/// Creates a task queue holding at most `capacity` tasks.
pub fn bounded(capacity: NonZeroUsize) -> (TaskSender, TaskReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.get());
    (
        TaskSender { inner: sender },
        TaskReceiver {
            inner: Arc::new(Mutex::new(receiver)),
        },
    )
}

/// The producing half of the task queue.
#[derive(Debug, Clone)]
pub struct TaskSender {
    inner: mpsc::Sender<Task>,
}

impl TaskSender {
    /// Enqueues `task`, waiting at most `timeout` for space to become available.
    ///
    /// On failure the task is handed back inside the error.
    pub async fn enqueue(&self, task: Task, timeout: Duration) -> Result<(), EnqueueError> {
        self.inner
            .send_timeout(task, timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(task) => EnqueueError::Full(task),
                SendTimeoutError::Closed(task) => EnqueueError::Closed(task),
            })
    }

    /// The number of tasks currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }
}

/// The consuming half of the task queue.
///
/// Cloning produces another consumer of the same queue; consumers compete for tasks.
#[derive(Debug, Clone)]
pub struct TaskReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Task>>>,
}

impl TaskReceiver {
    /// Takes the next task, waiting at most `timeout` for one to arrive.
    ///
    /// Returns `Ok(None)` if the timeout elapsed first, and [`QueueClosed`] once every
    /// [`TaskSender`] has been dropped and the queue is empty.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueClosed> {
        let next = tokio::time::timeout(timeout, async { self.inner.lock().await.recv().await });
        match next.await {
            Ok(Some(task)) => Ok(Some(task)),
            Ok(None) => Err(QueueClosed),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Removes every task currently waiting in the queue without blocking.
    ///
    /// Returns nothing if another consumer is mid-dequeue.
    pub fn drain(&self) -> Vec<Task> {
        let Ok(mut receiver) = self.inner.try_lock() else {
            return Vec::new();
        };
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Task queue is full")]
    Full(Task),
    #[error("Task queue is closed")]
    Closed(Task),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Task queue is closed")]
pub struct QueueClosed;

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;

    fn task(n: usize) -> Task {
        Task {
            job_id: n.into(),
            url: format!("https://localhost/{n}"),
            dispatch_time: Utc::now(),
        }
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let (sender, receiver) = bounded(capacity(3));
        for n in 0..3 {
            sender.enqueue(task(n), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(sender.len(), 3);

        for n in 0..3 {
            let next = receiver.dequeue(Duration::from_secs(1)).await.unwrap();
            assert_eq!(next.map(|task| task.job_id), Some(n.into()));
        }
        assert!(sender.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_when_empty() {
        let (_sender, receiver) = bounded(capacity(1));

        let next = receiver.dequeue(Duration::from_secs(1)).await;

        assert_eq!(next, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_times_out_when_full_and_returns_the_task() {
        let (sender, _receiver) = bounded(capacity(1));
        sender.enqueue(task(0), Duration::from_secs(1)).await.unwrap();

        let result = sender.enqueue(task(1), Duration::from_secs(1)).await;

        assert_matches!(result, Err(EnqueueError::Full(task)) if task.job_id == 1.into());
        assert_eq!(sender.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_blocks_until_space_is_available() {
        let (sender, receiver) = bounded(capacity(1));
        sender.enqueue(task(0), Duration::from_secs(1)).await.unwrap();

        let blocked = tokio::spawn({
            let sender = sender.clone();
            async move { sender.enqueue(task(1), Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!blocked.is_finished());

        let first = receiver.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.map(|task| task.job_id), Some(0.into()));
        blocked.await.unwrap().unwrap();

        let second = receiver.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.map(|task| task.job_id), Some(1.into()));
    }

    #[tokio::test]
    async fn dequeue_reports_closed_queue() {
        let (sender, receiver) = bounded(capacity(2));
        sender.enqueue(task(0), Duration::from_secs(1)).await.unwrap();
        drop(sender);

        assert!(receiver.dequeue(Duration::from_secs(1)).await.unwrap().is_some());
        assert_eq!(
            receiver.dequeue(Duration::from_secs(1)).await,
            Err(QueueClosed)
        );
    }

    #[tokio::test]
    async fn enqueue_reports_closed_queue() {
        let (sender, receiver) = bounded(capacity(2));
        drop(receiver);

        let result = sender.enqueue(task(0), Duration::from_secs(1)).await;

        assert_matches!(result, Err(EnqueueError::Closed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_task_is_delivered_to_one_consumer() {
        const TASKS: usize = 500;
        let (sender, receiver) = bounded(capacity(8));

        let consumers = (0..4)
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Ok(next) = receiver.dequeue(Duration::from_millis(50)).await {
                        seen.extend(next.map(|task| task.job_id));
                    }
                    seen
                })
            })
            .collect::<Vec<_>>();

        for n in 0..TASKS {
            sender.enqueue(task(n), Duration::from_secs(5)).await.unwrap();
        }
        drop(sender);

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        let unique = all.iter().copied().collect::<HashSet<_>>();
        assert_eq!(all.len(), TASKS);
        assert_eq!(unique.len(), TASKS);
    }

    #[tokio::test]
    async fn drain_removes_waiting_tasks() {
        let (sender, receiver) = bounded(capacity(4));
        for n in 0..3 {
            sender.enqueue(task(n), Duration::from_secs(1)).await.unwrap();
        }

        let drained = receiver.drain();

        assert_eq!(drained.len(), 3);
        assert!(sender.is_empty());
        assert!(receiver.drain().is_empty());
    }
}
