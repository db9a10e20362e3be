// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

use std::time::Duration;

use crate::error::{InimError, Result};

/// Smallest window `get_log_elements` accepts.
pub const MIN_FETCH_LIMIT: u32 = 1;
/// Largest window `get_log_elements` accepts; also the escalation window.
pub const MAX_FETCH_LIMIT: u32 = 4000;
/// Default size of the cheap probe fetch.
pub const DEFAULT_TRIGGER_FETCH_LIMIT: u32 = 10;
/// Default size of the reconciliation fetch.
pub const DEFAULT_FETCH_LIMIT: u32 = 100;
/// Fetches above this many rows use the large-fetch timeout.
pub const LARGE_FETCH_THRESHOLD: u32 = 500;

/// Connection settings for the panel's HTTP API.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Panel host name or IP, optionally with `:port`
    pub host: String,
    /// API key configured on the panel
    pub api_key: String,
    /// Talk HTTPS (panel default, self-signed certificate)
    pub use_https: bool,
    /// Ping the panel once when connecting
    pub ping_on_connect: bool,
    /// Default per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Timeout in milliseconds for log fetches above `LARGE_FETCH_THRESHOLD` rows
    pub large_fetch_timeout_ms: u64,
    /// Extra attempts after a transport failure (0 = no retries)
    pub retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.92".to_string(),
            api_key: String::new(),
            use_https: true,
            ping_on_connect: true,
            timeout_ms: 20_000,
            large_fetch_timeout_ms: 120_000,
            retries: 0,
            retry_delay_ms: 500,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// `scheme://host` without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}", self.host.trim_end_matches('/'))
    }

    /// Timeout to use for a log fetch of `limit` rows.
    pub fn log_fetch_timeout(&self, limit: u32) -> Duration {
        if limit > LARGE_FETCH_THRESHOLD {
            Duration::from_millis(self.large_fetch_timeout_ms)
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self
    }

    pub fn use_https(mut self, use_https: bool) -> Self {
        self.config.use_https = use_https;
        self
    }

    pub fn ping_on_connect(mut self, ping: bool) -> Self {
        self.config.ping_on_connect = ping;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn large_fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.large_fetch_timeout_ms = ms;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Settings of the log event poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPollConfig {
    /// Rows fetched by the probe that decides whether a full fetch is needed
    pub trigger_fetch_limit: u32,
    /// Rows fetched by the reconciliation fetch (user option)
    pub fetch_limit: u32,
    /// Rows fetched when the reconciliation window is saturated
    pub max_fetch_limit: u32,
    /// Time between two poll cycles in milliseconds
    pub scan_interval_ms: u64,
}

impl Default for LogPollConfig {
    fn default() -> Self {
        Self {
            trigger_fetch_limit: DEFAULT_TRIGGER_FETCH_LIMIT,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            max_fetch_limit: MAX_FETCH_LIMIT,
            scan_interval_ms: 30_000,
        }
    }
}

impl LogPollConfig {
    pub fn builder() -> LogPollConfigBuilder {
        LogPollConfigBuilder::default()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Check limits against the API's accepted range and each other.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("trigger_fetch_limit", self.trigger_fetch_limit),
            ("fetch_limit", self.fetch_limit),
            ("max_fetch_limit", self.max_fetch_limit),
        ] {
            if !(MIN_FETCH_LIMIT..=MAX_FETCH_LIMIT).contains(&value) {
                return Err(InimError::InvalidConfig {
                    details: format!(
                        "{name} = {value} outside {MIN_FETCH_LIMIT}..={MAX_FETCH_LIMIT}"
                    ),
                });
            }
        }
        if self.trigger_fetch_limit > self.fetch_limit {
            return Err(InimError::InvalidConfig {
                details: format!(
                    "trigger_fetch_limit ({}) larger than fetch_limit ({})",
                    self.trigger_fetch_limit, self.fetch_limit
                ),
            });
        }
        if self.fetch_limit > self.max_fetch_limit {
            return Err(InimError::InvalidConfig {
                details: format!(
                    "fetch_limit ({}) larger than max_fetch_limit ({})",
                    self.fetch_limit, self.max_fetch_limit
                ),
            });
        }
        if self.scan_interval_ms == 0 {
            return Err(InimError::InvalidConfig {
                details: "scan_interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for LogPollConfig.
#[derive(Debug, Clone, Default)]
pub struct LogPollConfigBuilder {
    config: LogPollConfig,
}

impl LogPollConfigBuilder {
    pub fn trigger_fetch_limit(mut self, limit: u32) -> Self {
        self.config.trigger_fetch_limit = limit;
        self
    }

    pub fn fetch_limit(mut self, limit: u32) -> Self {
        self.config.fetch_limit = limit;
        self
    }

    pub fn max_fetch_limit(mut self, limit: u32) -> Self {
        self.config.max_fetch_limit = limit;
        self
    }

    pub fn scan_interval_ms(mut self, ms: u64) -> Self {
        self.config.scan_interval_ms = ms;
        self
    }

    pub fn build(self) -> LogPollConfig {
        self.config
    }
}
