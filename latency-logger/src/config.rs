//! Loading the monitored targets and validating the monitor's tunables.
//!
//! The targets file holds one `interval,url` pair per line, where `interval` is the number of
//! seconds between checks of `url`. Blank lines and lines starting with `#` are ignored. A single
//! malformed line rejects the whole file.
//!
//! ```
//! # use latency_logger::config::parse_targets;
//! # use std::time::Duration;
//! let targets = parse_targets("# comment\n10, https://example.com/\n2.5,http://localhost/\n".as_bytes())
//!     .unwrap();
//!
//! assert_eq!(targets.len(), 2);
//! assert_eq!(targets[0].interval, Duration::from_secs(10));
//! assert_eq!(targets[1].interval, Duration::from_millis(2500));
//! ```
use std::{
    fs::File,
    io::{BufRead, BufReader},
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use reqwest::Url;
use thiserror::Error;

/// A URL to check and how often to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub interval: Duration,
    pub url: String,
}

impl Target {
    /// The longest supported interval between checks.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
}

impl FromStr for Target {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (seconds, url) = line
            .split_once(',')
            .ok_or_else(|| "expected '<seconds>,<url>'".to_owned())?;

        let seconds: f64 = seconds
            .trim()
            .parse()
            .map_err(|_| format!("invalid interval '{}'", seconds.trim()))?;
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(format!("interval must be positive, got {seconds}"));
        }
        let interval = Duration::try_from_secs_f64(seconds).map_err(|err| err.to_string())?;
        if interval.is_zero() {
            return Err(format!("interval must be at least 1ns, got {seconds}"));
        }
        if interval > Self::MAX_INTERVAL {
            return Err(format!(
                "interval must not exceed {} seconds, got {seconds}",
                Self::MAX_INTERVAL.as_secs()
            ));
        }

        let url = url.trim();
        let parsed = Url::parse(url).map_err(|err| format!("invalid url '{url}': {err}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("unsupported scheme '{}'", parsed.scheme()));
        }

        Ok(Self {
            interval,
            url: url.to_owned(),
        })
    }
}

/// Parses targets from a reader.
///
/// Fails on the first malformed line, and if no targets are found.
pub fn parse_targets(reader: impl BufRead) -> Result<Vec<Target>, ConfigError> {
    let mut targets = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let content = line.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let target = content
            .parse()
            .map_err(|reason| ConfigError::MalformedLine {
                line: index + 1,
                content: content.to_owned(),
                reason,
            })?;
        targets.push(target);
    }

    if targets.is_empty() {
        return Err(ConfigError::EmptySchedule);
    }
    Ok(targets)
}

/// Reads and parses the targets file at `path`.
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<Target>, ConfigError> {
    let file = File::open(path)?;
    parse_targets(BufReader::new(file))
}

/// Tunables for the scheduling and dispatch core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Capacity of the task queue between the scheduler and the workers.
    pub queue_capacity: NonZeroUsize,
    /// Number of concurrent workers.
    pub workers: NonZeroUsize,
    /// Upper bound on how long any unit blocks before re-checking the shutdown signal.
    pub poll_interval: Duration,
}

impl MonitorConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
    pub const DEFAULT_WORKERS: usize = 3;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(
        queue_capacity: usize,
        workers: usize,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let queue_capacity =
            NonZeroUsize::new(queue_capacity).ok_or(ConfigError::ZeroQueueCapacity)?;
        let workers = NonZeroUsize::new(workers).ok_or(ConfigError::ZeroWorkers)?;
        if poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(Self {
            queue_capacity,
            workers,
            poll_interval,
        })
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: NonZeroUsize::new(Self::DEFAULT_QUEUE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            workers: NonZeroUsize::new(Self::DEFAULT_WORKERS).unwrap_or(NonZeroUsize::MIN),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Expected '<seconds>,<url>' on line {line} ('{content}'): {reason}")]
    MalformedLine {
        line: usize,
        content: String,
        reason: String,
    },
    #[error("Cannot run an empty schedule")]
    EmptySchedule,
    #[error("Queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("Worker count must be at least 1")]
    ZeroWorkers,
    #[error("Poll interval must be positive")]
    ZeroPollInterval,
    #[error("Error reading configuration")]
    Io(#[from] std::io::Error),
}
