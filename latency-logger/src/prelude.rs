//! The purpose of this module is to alleviate the need to import many of the `[latency_logger]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use latency_logger::prelude::*;
//! ```
pub use crate::config::{load_targets, parse_targets, ConfigError, MonitorConfig, Target};
pub use crate::probe::{Probe, ProbeError, ProbeResponse, ReqwestProbe};
#[cfg(feature = "kafka")]
pub use crate::publisher::kafka::{KafkaConfig, KafkaPublisher, KafkaSsl};
pub use crate::publisher::json_lines::JsonLinesPublisher;
pub use crate::publisher::memory::InMemoryPublisher;
pub use crate::publisher::{PublishError, Publisher};
pub use crate::record::{ErrorKind, LatencyRecord, Outcome};
pub use crate::shutdown::ShutdownSignal;
pub use crate::{Monitor, MonitorError, RunSummary};
