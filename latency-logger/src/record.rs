use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::{
    job::Task,
    probe::{ProbeError, ProbeResponse},
};

/// The measurement produced for a single check.
///
/// Serialized as a flat JSON object, e.g.
///
/// ```json
/// {"url":"https://example.com/","dispatch_time":"2021-01-02T15:18:21Z","worker":"worker-0",
///  "result":"success","status_code":200,"first_byte_ms":20.4,"latency_ms":51.2}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyRecord {
    pub url: String,
    pub dispatch_time: DateTime<Utc>,
    pub worker: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl LatencyRecord {
    pub(crate) fn new(task: Task, worker: &str, outcome: Outcome) -> Self {
        Self {
            url: task.url,
            dispatch_time: task.dispatch_time,
            worker: worker.to_owned(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// A response was received. Non-2xx statuses are still successes.
    Success {
        status_code: u16,
        #[serde(rename = "first_byte_ms", serialize_with = "serialize_millis")]
        first_byte: Duration,
        #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
        latency: Duration,
    },
    /// No response could be obtained.
    Failure {
        error_kind: ErrorKind,
        error_detail: String,
    },
}

impl From<ProbeResponse> for Outcome {
    fn from(value: ProbeResponse) -> Self {
        Self::Success {
            status_code: value.status_code,
            first_byte: value.first_byte,
            latency: value.elapsed,
        }
    }
}

impl From<ProbeError> for Outcome {
    fn from(value: ProbeError) -> Self {
        Self::Failure {
            error_kind: value.kind,
            error_detail: value.detail,
        }
    }
}

/// Why a check failed to produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Timeout,
    Tls,
    Redirect,
    Request,
    Body,
    Panic,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::Redirect => "redirect",
            Self::Request => "request",
            Self::Body => "body",
            Self::Panic => "panic",
            Self::Other => "other",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64() * 1000.0)
}
