//! Publishing latency records to a message bus.
//!
//! A [`Publisher`] is cloned into every worker. Implementations own their buffering: `publish`
//! should return once the record has been accepted for delivery, applying backpressure only when
//! their own outbound buffer is full.
//!
//! Errors fall into two groups, see [`PublishError::is_fatal`]:
//!
//! - errors about a single record, which the worker logs before dropping the record, and
//! - errors about the connection itself, which stop the worker.
use async_trait::async_trait;
use thiserror::Error;

use crate::record::LatencyRecord;

pub mod json_lines;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[async_trait]
pub trait Publisher: Clone {
    /// Hand `record` to the message bus.
    async fn publish(&self, record: &LatencyRecord) -> Result<(), PublishError>;

    /// Wait for buffered records to be delivered.
    ///
    /// Called once, after every worker has stopped.
    async fn flush(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Record rejected by the message bus: {0}")]
    Rejected(String),
    #[error("Error encoding record")]
    Serialize(#[from] serde_json::Error),
    #[error("Message bus connection is closed")]
    Closed,
    #[error("Message bus connection failed: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Whether the error means the connection to the message bus is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Fatal(_))
    }
}
