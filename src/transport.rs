//! HTTP delivery of buffer snapshots to the HireFire collector.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};

use crate::buffer::Snapshot;
use crate::error::DispatchError;
use crate::settings::Settings;

pub const TOKEN_HEADER: &str = "HireFire-Token";
pub const RESOURCE_HEADER: &str = "HireFire-Resource";
pub const INTERVAL_HEADER: &str = "HireFire-Resource-Dispatch-Interval";
pub const TIMEOUT_HEADER: &str = "HireFire-Resource-Dispatch-Timeout";
pub const BUFFER_TTL_HEADER: &str = "HireFire-Resource-Buffer-TTL";

/// Dispatcher tunables the collector asked us to change.
///
/// `None` means "keep the current value".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overrides {
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub buffer_ttl: Option<u64>,
}

impl Overrides {
    /// Read the three override headers. Missing, malformed, zero or negative
    /// values are ignored individually.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            interval: header_str(headers, INTERVAL_HEADER).and_then(parse_positive_secs),
            timeout: header_str(headers, TIMEOUT_HEADER).and_then(parse_positive_secs),
            buffer_ttl: header_str(headers, BUFFER_TTL_HEADER)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ttl| *ttl > 0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interval.is_none() && self.timeout.is_none() && self.buffer_ttl.is_none()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_positive_secs(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// One delivery attempt of a snapshot.
///
/// Implementations report every failure through [`DispatchError`] and never
/// panic on I/O faults.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, snapshot: &Snapshot, timeout: Duration) -> Result<Overrides, DispatchError>;
}

/// POSTs snapshots as JSON with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    settings: Settings,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: Settings) -> Self {
        // Client::builder() only fails when the TLS backend cannot initialise;
        // fall back to the default client rather than panicking.
        let client = reqwest::Client::builder().build().unwrap_or_default();
        Self { settings, client }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, snapshot: &Snapshot, timeout: Duration) -> Result<Overrides, DispatchError> {
        let token = self
            .settings
            .token
            .as_deref()
            .ok_or(DispatchError::MissingToken)?;

        let body = serde_json::to_vec(snapshot).map_err(|e| DispatchError::Request(e.to_string()))?;

        let resp = self
            .client
            .post(self.settings.dispatch_url())
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(TOKEN_HEADER, token)
            .header(RESOURCE_HEADER, crate::resource_header())
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        Ok(Overrides::from_headers(resp.headers()))
    }
}

/// Longest rejection body, in bytes, carried into [`DispatchError::Rejected`]
/// and from there into the failure log.
pub const MAX_REJECTION_BODY: usize = 512;

fn truncate_body(mut body: String) -> String {
    if body.len() <= MAX_REJECTION_BODY {
        return body;
    }
    let mut cut = MAX_REJECTION_BODY;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body.push_str("...");
    body
}

fn classify(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Request(err.to_string())
    }
}


// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use mock::MockTransport;
