//! # Stage: Request Adapter
//!
//! ## Responsibility
//! The framework-neutral half of a HireFire middleware. A framework adapter
//! copies three things out of its request type into [`RequestParts`] and
//! hands them to [`HireFire::process_request`], which either answers the
//! info endpoint or records the request's queue time.
//!
//! ## Guarantees
//! - Never fails a pass-through request: a missing or malformed
//!   `X-Request-Start` header simply records nothing.
//! - Token comparison is constant-time.
//! - Without a configured token nothing is recorded, nothing is intercepted,
//!   and the dispatcher is never started.
//!
//! ## NOT Responsible For
//! - Reading framework request types or writing framework responses
//! - Choosing header name variants (`X-Request-Start` vs
//!   `HTTP_X_REQUEST_START`); the adapter normalizes before calling in

use subtle::ConstantTimeEq;

use crate::configuration::{Configuration, HireFire};
use crate::error::MeasureError;

/// Path prefix shared by both forms of the info endpoint.
pub const INFO_PATH: &str = "/hirefire";

/// Cache policy for info responses; HireFire must always see fresh values.
pub const INFO_CACHE_CONTROL: &str = "must-revalidate, private, max-age=0";

/// The parts of an inbound request the agent looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParts<'a> {
    /// Request path. A query string, if present, is ignored.
    pub path: &'a str,
    /// Raw `X-Request-Start` header value.
    pub request_start: Option<&'a str>,
    /// Raw `HireFire-Token` request header value.
    pub token: Option<&'a str>,
}

/// A complete response for an intercepted info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl InfoResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse an `X-Request-Start` value into epoch milliseconds.
///
/// Accepts `1700000000123`, `1700000000123.4` and `t=1700000000123`.
/// Returns `None` for anything else, including negative or non-finite numbers.
pub fn parse_request_start(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("t=").unwrap_or(raw);
    if let Ok(ms) = raw.parse::<u64>() {
        return Some(ms);
    }
    let ms = raw.parse::<f64>().ok()?;
    (ms.is_finite() && ms >= 0.0).then(|| ms.floor() as u64)
}

/// Whether `request` targets the info endpoint for `token`.
///
/// Matches `/hirefire/<token>/info`, or bare `/hirefire` carrying a
/// `HireFire-Token` header equal to `token`.
pub fn is_info_request(request: &RequestParts<'_>, token: &str) -> bool {
    let path = strip_query(request.path);
    let Some(rest) = path.strip_prefix(INFO_PATH) else {
        return false;
    };

    if rest.is_empty() || rest == "/" {
        return request.token.is_some_and(|given| tokens_match(given, token));
    }

    rest.strip_prefix('/')
        .and_then(|r| r.strip_suffix("/info"))
        .is_some_and(|given| tokens_match(given, token))
}

fn strip_query(path: &str) -> &str {
    path.find('?').map_or(path, |idx| &path[..idx])
}

fn tokens_match(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Build the info response body and headers from the workers' current values.
///
/// # Errors
/// The first provider failure.
pub async fn info_response(config: &Configuration) -> Result<InfoResponse, MeasureError> {
    let values = config.info().await?;
    let body = serde_json::to_vec(&values).map_err(|e| MeasureError::Other(e.to_string()))?;
    Ok(InfoResponse {
        status: 200,
        headers: vec![
            ("Content-Type", "application/json".to_owned()),
            ("Cache-Control", INFO_CACHE_CONTROL.to_owned()),
            (crate::transport::RESOURCE_HEADER, crate::resource_header()),
        ],
        body,
    })
}

impl HireFire {
    /// Handle one inbound request.
    ///
    /// Returns `Ok(Some(response))` when the request is an info request and
    /// must be answered with `response` instead of reaching the application.
    /// Returns `Ok(None)` for every other request, after recording its queue
    /// time when a web dyno is configured.
    ///
    /// # Errors
    /// A worker's provider failed while answering an info request.
    pub async fn process_request(
        &self,
        request: &RequestParts<'_>,
    ) -> Result<Option<InfoResponse>, MeasureError> {
        let config = self.configuration();
        let Some(token) = config.settings().token.as_deref() else {
            return Ok(None);
        };

        if is_info_request(request, token) {
            return info_response(&config).await.map(Some);
        }

        if let Some(web) = config.web() {
            if let Some(start) = request.request_start.and_then(parse_request_start) {
                let now = web.clock().unix_millis();
                web.record(now.saturating_sub(start));
                web.start_dispatcher();
            }
        }

        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
