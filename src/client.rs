// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, MAX_FETCH_LIMIT, MIN_FETCH_LIMIT};
use crate::error::{InimError, Result};
use crate::log_event::LogEvent;
use crate::protocol::{parse_log_events, Command, Envelope, API_PATH};

/// Anything the poller can pull audit log windows from.
#[async_trait]
pub trait LogEventSource: Send + Sync {
    /// Fetch the `limit` most recent log events, ordered oldest to newest.
    async fn fetch_log_events(&self, limit: u32) -> Result<Vec<LogEvent>>;
}

#[async_trait]
impl<T: LogEventSource + ?Sized> LogEventSource for Arc<T> {
    async fn fetch_log_events(&self, limit: u32) -> Result<Vec<LogEvent>> {
        (**self).fetch_log_events(limit).await
    }
}

/// HTTP client for the INIM Prime panel API.
pub struct InimClient {
    config: ClientConfig,
    http: Option<reqwest::Client>,
}

impl InimClient {
    /// Create a client without opening a session. Call [`InimClient::open`]
    /// before issuing commands.
    pub fn new(config: ClientConfig) -> Self {
        Self { config, http: None }
    }

    /// Create a client, open its session and optionally ping the panel.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let mut client = Self::new(config);
        client.open().await?;
        Ok(client)
    }

    /// Open the HTTP session. Does nothing if it is already open.
    pub async fn open(&mut self) -> Result<()> {
        if self.http.is_some() {
            return Ok(());
        }

        info!("Opening session to panel at {}", self.config.base_url());
        let http = reqwest::Client::builder()
            // The panel serves a self-signed certificate
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build()?;
        self.http = Some(http);

        if self.config.ping_on_connect {
            self.ping().await?;
        }
        Ok(())
    }

    /// Drop the HTTP session.
    pub fn close(&mut self) {
        if self.http.take().is_some() {
            debug!("Panel session closed");
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(&Command::Ping, self.default_timeout()).await?;
        debug!("Panel answered ping");
        Ok(())
    }

    /// API version string reported by the panel.
    pub async fn api_version(&self) -> Result<String> {
        let data = self.request(&Command::Version, self.default_timeout()).await?;
        Ok(match data {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }

    /// Fetch the `limit` most recent log events, oldest first.
    pub async fn get_log_events(&self, limit: u32) -> Result<Vec<LogEvent>> {
        if !(MIN_FETCH_LIMIT..=MAX_FETCH_LIMIT).contains(&limit) {
            return Err(InimError::InvalidLimit {
                limit,
                max: MAX_FETCH_LIMIT,
            });
        }
        let timeout = self.config.log_fetch_timeout(limit);
        let data = self
            .request(&Command::GetLogElements { limit }, timeout)
            .await?;
        let events = parse_log_events(data)?;
        debug!("Fetched {} log events (limit {})", events.len(), limit);
        Ok(events)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Send a command, retrying transport failures up to `retries` times.
    async fn request(&self, command: &Command, timeout: Duration) -> Result<serde_json::Value> {
        let retries = self.config.retries;
        let delay = Duration::from_millis(self.config.retry_delay_ms);

        let mut attempt = 0;
        loop {
            match self.request_once(command, timeout).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Request {} failed ({}), retrying {}/{} in {:.1}s...",
                        command.name(),
                        e,
                        attempt,
                        retries,
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(&self, command: &Command, timeout: Duration) -> Result<serde_json::Value> {
        let http = self.http.as_ref().ok_or(InimError::NotConnected)?;
        let url = format!("{}{}", self.config.base_url(), API_PATH);

        let mut query = vec![
            ("apikey", self.config.api_key.clone()),
            ("cmd", command.name().to_string()),
        ];
        query.extend(command.params());

        let response = http
            .get(&url)
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, command))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InimError::HttpStatus {
                command: command.name().to_string(),
                status: status.as_u16(),
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, command))?;
        envelope.into_data()
    }
}

fn map_transport_error(e: reqwest::Error, command: &Command) -> InimError {
    if e.is_timeout() {
        InimError::Timeout {
            command: command.name().to_string(),
        }
    } else {
        InimError::Http(e)
    }
}

#[async_trait]
impl LogEventSource for InimClient {
    async fn fetch_log_events(&self, limit: u32) -> Result<Vec<LogEvent>> {
        self.get_log_events(limit).await
    }
}
