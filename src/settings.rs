//! Environment-derived settings shared by the transport and the info endpoint.

use std::env;

/// Collector origin used when `HIREFIRE_DISPATCH_URL` is unset.
pub const DEFAULT_DISPATCH_URL: &str = "https://logdrain.hirefire.io/";

pub const TOKEN_ENV: &str = "HIREFIRE_TOKEN";
pub const DISPATCH_URL_ENV: &str = "HIREFIRE_DISPATCH_URL";

/// Delivery credentials and collector location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Shared secret sent as `HireFire-Token`. Required to dispatch.
    pub token: Option<String>,
    /// Collector URL override.
    pub dispatch_url: Option<String>,
}

impl Settings {
    /// Read `HIREFIRE_TOKEN` and `HIREFIRE_DISPATCH_URL`. Empty values count
    /// as unset.
    pub fn from_env() -> Self {
        Self {
            token: non_empty_var(TOKEN_ENV),
            dispatch_url: non_empty_var(DISPATCH_URL_ENV),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_dispatch_url(mut self, url: impl Into<String>) -> Self {
        self.dispatch_url = Some(url.into());
        self
    }

    /// The URL snapshots are POSTed to.
    pub fn dispatch_url(&self) -> &str {
        self.dispatch_url.as_deref().unwrap_or(DEFAULT_DISPATCH_URL)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
