//! Engine configuration.

use serde::Deserialize;
use std::time::Duration;

/// Settings consumed by the dispatcher and the stream manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote service, without a trailing slash.
    pub base_url: String,
    /// Delay before a reconnect attempt after an unexpected channel close.
    pub retry_delay: Duration,
    /// How long a stream may stay disconnected before it is declared lost.
    pub lost_timeout: Duration,
    /// Timeout applied to one-shot HTTP requests.
    pub request_timeout: Duration,
}

impl Config {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            retry_delay: Duration::from_secs(5),
            lost_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}
