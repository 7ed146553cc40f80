//! A [`Publisher`] that keeps latency records in a shared `Vec` so they can be inspected
//! after a monitor run.
//!
//! Clones share the same records, so one clone can be handed to a [`crate::Monitor`] while
//! another is read afterwards. Records are never evicted, which makes it unsuitable for a
//! long-running monitor.
//!
//! ```
//! # use latency_logger::prelude::*;
//! let publisher = InMemoryPublisher::new();
//! let handed_out = publisher.clone();
//! handed_out.fail_next(PublishError::Rejected("record too large".to_owned()));
//!
//! assert!(publisher.is_empty());
//! assert_eq!(publisher.flush_count(), 0);
//! ```
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;

use super::{PublishError, Publisher};
use crate::record::LatencyRecord;

/// Records are kept in publication order. Failures can be queued up with
/// [`InMemoryPublisher::fail_next`] to exercise error handling.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    records: Arc<Mutex<Vec<LatencyRecord>>>,
    failures: Arc<Mutex<VecDeque<PublishError>>>,
    flushes: Arc<AtomicUsize>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to [`Publisher::publish`] fail with `error`.
    ///
    /// Calling this repeatedly queues up failures which are returned in order.
    pub fn fail_next(&self, error: PublishError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// The records published so far.
    pub fn records(&self) -> Vec<LatencyRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times [`Publisher::flush`] has been called.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, record: &LatencyRecord) -> Result<(), PublishError> {
        if let Some(error) = self
            .failures
            .lock()
            .map_err(|_| PublishError::Fatal("publisher state poisoned".to_owned()))?
            .pop_front()
        {
            return Err(error);
        }
        self.records
            .lock()
            .map_err(|_| PublishError::Fatal("publisher state poisoned".to_owned()))?
            .push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), PublishError> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
