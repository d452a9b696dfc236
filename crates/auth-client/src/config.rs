//! Client configuration

use std::time::Duration;

use serde::Deserialize;
use session_auth::{DEFAULT_ENTRY_ROUTE, REFRESH_PATH};

/// Backend connection settings for the authenticated client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Backend base URL, e.g. `https://api.example.com`
    pub base_url: String,
    /// Per-request timeout. Generous because branding generation calls are slow.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    /// Route the app is sent to after a forced logout
    #[serde(default = "default_entry_route")]
    pub entry_route: String,
    /// Upper bound on the refresh call itself. Unbounded when absent.
    #[serde(default)]
    pub refresh_timeout_secs: Option<u64>,
    /// Upper bound on how long a queued request waits for someone else's
    /// refresh. Unbounded when absent.
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

fn default_timeout() -> u64 {
    60
}

fn default_refresh_path() -> String {
    REFRESH_PATH.to_string()
}

fn default_entry_route() -> String {
    DEFAULT_ENTRY_ROUTE.to_string()
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout(),
            refresh_path: default_refresh_path(),
            entry_route: default_entry_route(),
            refresh_timeout_secs: None,
            wait_timeout_secs: None,
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "base_url",
                format!("must start with http:// or https://, got: {}", self.base_url),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(common::Error::invalid("timeout_secs", "must be greater than 0"));
        }
        if !self.refresh_path.starts_with('/') {
            return Err(common::Error::invalid("refresh_path", "must start with /"));
        }
        if self.refresh_timeout_secs == Some(0) {
            return Err(common::Error::invalid(
                "refresh_timeout_secs",
                "must be greater than 0 when set",
            ));
        }
        if self.wait_timeout_secs == Some(0) {
            return Err(common::Error::invalid(
                "wait_timeout_secs",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }

    /// Join a backend path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn refresh_url(&self) -> String {
        self.url(&self.refresh_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_secs.map(Duration::from_secs)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}
