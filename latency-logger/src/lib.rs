//! Periodic HTTP latency monitoring.
//!
//! A single [`scheduler::Scheduler`] decides when each configured target is due and feeds
//! [`job::Task`]s into a bounded [`queue`]. A pool of [`worker::Worker`]s drains the queue,
//! checks each URL through a [`probe::Probe`] and hands the resulting
//! [`record::LatencyRecord`] to a [`publisher::Publisher`].
//!
//! [`Monitor`] wires these together and supervises them until the [`ShutdownSignal`] is
//! triggered:
//!
//! ```no_run
//! # use latency_logger::prelude::*;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let targets = load_targets("targets.csv")?;
//! let probe = ReqwestProbe::new(
//!     ReqwestProbe::DEFAULT_REQUEST_TIMEOUT,
//!     ReqwestProbe::DEFAULT_CONNECT_TIMEOUT,
//! )?;
//! let (publisher, _writer) = JsonLinesPublisher::stdout(JsonLinesPublisher::DEFAULT_BUFFER);
//!
//! let shutdown = ShutdownSignal::new();
//! let monitor = Monitor::new(targets, MonitorConfig::default(), probe, publisher)?;
//! let summary = monitor.run(shutdown).await?;
//! println!("{} checks dispatched", summary.dispatched);
//! # Ok(())
//! # }
//! ```
use std::{any::Any, fmt::Display, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use thiserror::Error;
use tokio::{task::JoinSet, time::Instant};
use tracing::instrument;

pub mod config;
pub mod job;
pub mod prelude;
pub mod probe;
pub mod publisher;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

use config::{ConfigError, MonitorConfig, Target};
use probe::Probe;
use publisher::Publisher;
use scheduler::{JobTable, Scheduler, SchedulerError};
pub use shutdown::ShutdownSignal;
use worker::{Worker, WorkerError};

/// Runs the scheduler and the worker pool for a fixed set of targets.
pub struct Monitor<P, B> {
    targets: Vec<Target>,
    config: MonitorConfig,
    probe: Arc<P>,
    publisher: B,
}

impl<P, B> Monitor<P, B>
where
    P: Probe + Send + Sync + 'static,
    B: Publisher + Send + Sync + 'static,
{
    pub fn new(
        targets: Vec<Target>,
        config: MonitorConfig,
        probe: P,
        publisher: B,
    ) -> Result<Self, MonitorError> {
        if targets.is_empty() {
            return Err(ConfigError::EmptySchedule.into());
        }
        Ok(Self {
            targets,
            config,
            probe: Arc::new(probe),
            publisher,
        })
    }

    /// Runs until `shutdown` is triggered and every unit has stopped.
    ///
    /// If the scheduler or any worker stops before shutdown was requested, shutdown is
    /// triggered for the remaining units and [`MonitorError::UnexpectedTermination`] is
    /// returned once they have all stopped. The publisher is flushed in either case.
    #[instrument(
        name = "monitor",
        skip_all,
        fields(jobs = self.targets.len(), workers = self.config.workers.get())
    )]
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<RunSummary, MonitorError> {
        let Self {
            targets,
            config,
            probe,
            publisher,
        } = self;

        let (sender, receiver) = queue::bounded(config.queue_capacity);
        let backlog = receiver.clone();
        let mut units = JoinSet::new();

        let scheduler = Scheduler::new(
            JobTable::new(targets, Instant::now()),
            sender,
            shutdown.clone(),
            config.poll_interval,
        );
        units.spawn(supervise(Unit::Scheduler, shutdown.clone(), scheduler.run()));

        for index in 0..config.workers.get() {
            let unit = Unit::Worker(index);
            let worker = Worker::new(
                unit.to_string(),
                receiver.clone(),
                Arc::clone(&probe),
                publisher.clone(),
                shutdown.clone(),
                config.poll_interval,
            );
            units.spawn(supervise(unit, shutdown.clone(), worker.run()));
        }
        drop(receiver);

        let mut summary = RunSummary::default();
        let mut fault = false;
        while let Some(joined) = units.join_next().await {
            let premature = match joined {
                Ok(UnitExit {
                    unit,
                    premature,
                    result: Ok(count),
                }) => {
                    match unit {
                        Unit::Scheduler => summary.dispatched = count,
                        Unit::Worker(_) => summary.processed += count,
                    }
                    if premature {
                        tracing::error!(%unit, "Unit stopped before shutdown was requested");
                    } else {
                        tracing::debug!(%unit, count, "Unit stopped");
                    }
                    premature
                }
                Ok(UnitExit {
                    unit,
                    premature,
                    result: Err(error),
                }) => {
                    tracing::error!(%unit, ?error, "Unit failed: {error}");
                    premature
                }
                Err(error) => {
                    tracing::error!(?error, "Unit task could not be joined: {error}");
                    !shutdown.is_triggered()
                }
            };
            if premature {
                fault = true;
                shutdown.trigger();
            }
        }

        if let Err(error) = publisher.flush().await {
            tracing::warn!(?error, "Failed to flush latency records: {error}");
        }

        summary.abandoned = backlog.drain().len() as u64;
        tracing::info!(
            dispatched = summary.dispatched,
            processed = summary.processed,
            abandoned = summary.abandoned,
            "Monitor stopped"
        );

        if fault {
            Err(MonitorError::UnexpectedTermination)
        } else {
            Ok(summary)
        }
    }
}

/// Counts reported by a [`Monitor`] once every unit has stopped.
///
/// Every task the scheduler enqueued is either processed by a worker or abandoned in the queue
/// at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: u64,
    pub processed: u64,
    pub abandoned: u64,
}

/// One supervised task of a [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Scheduler,
    Worker(usize),
}

impl Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => f.write_str("scheduler"),
            Self::Worker(index) => write!(f, "worker-{index}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Panicked: {0}")]
    Panic(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("A scheduler or worker stopped before shutdown was requested")]
    UnexpectedTermination,
}

/// How a supervised unit stopped.
#[derive(Debug)]
struct UnitExit {
    unit: Unit,
    /// Shutdown had not been requested at the moment the unit stopped.
    premature: bool,
    result: Result<u64, UnitError>,
}

fn supervise<F, E>(unit: Unit, shutdown: ShutdownSignal, run: F) -> impl Future<Output = UnitExit>
where
    F: Future<Output = Result<u64, E>>,
    E: Into<UnitError>,
{
    async move {
        let result = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result.map_err(Into::into),
            Err(panic) => Err(UnitError::Panic(panic_message(&*panic))),
        };
        UnitExit {
            unit,
            premature: !shutdown.is_triggered(),
            result,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}
