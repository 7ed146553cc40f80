//! Performing the HTTP checks.
//!
//! A [`Probe`] issues a single GET request and reports the status code and the elapsed wall
//! time. Failures to obtain a response are returned as a [`ProbeError`] classified by
//! [`ErrorKind`]. Retries, redirects and timeouts are the probe's business; the worker only sees
//! the final result.
use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{task::JoinError, time::Instant};

use crate::record::ErrorKind;

/// The response to a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
    /// Time until the response headers arrived.
    pub first_byte: Duration,
    /// Time until the whole body had been received.
    pub elapsed: Duration,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Probe {
    /// Issue a GET request to `url`.
    ///
    /// Any response, whatever its status, is a success.
    async fn perform(&self, url: &str) -> Result<ProbeResponse, ProbeError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {detail}")]
pub struct ProbeError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ProbeError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// A [`Probe`] backed by a [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Builds a probe whose requests are abandoned after `request_timeout`, and whose connection
    /// attempts are abandoned after `connect_timeout`.
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for ReqwestProbe {
    async fn perform(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(url).send().await?;
        let first_byte = started.elapsed();
        let status_code = response.status().as_u16();
        // The check isn't complete until the body has been received.
        response.bytes().await?;
        Ok(ProbeResponse {
            status_code,
            first_byte,
            elapsed: started.elapsed(),
        })
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(value: reqwest::Error) -> Self {
        let detail = error_chain(&value);
        let kind = if value.is_timeout() {
            ErrorKind::Timeout
        } else if value.is_connect() && is_tls_failure(&detail) {
            ErrorKind::Tls
        } else if value.is_connect() {
            ErrorKind::Connect
        } else if value.is_redirect() {
            ErrorKind::Redirect
        } else if value.is_body() || value.is_decode() {
            ErrorKind::Body
        } else if value.is_request() || value.is_builder() {
            ErrorKind::Request
        } else {
            ErrorKind::Other
        };
        Self { kind, detail }
    }
}

impl From<JoinError> for ProbeError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let detail = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            kind: ErrorKind::Panic,
            detail,
        }
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

fn is_tls_failure(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    ["certificate", "tls", "handshake"]
        .iter()
        .any(|needle| detail.contains(needle))
}
