// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use inim_prime_bridge::{
    CheckpointStore, ClientConfig, FileCheckpointStore, InimClient, InimError, LogEvent,
    LogEventPoller, LogEventSink, LogEventSource, LogPollConfig,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "inim2mqtt")]
#[command(about = "Bridge between an INIM Prime panel's audit log and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    panel: PanelToml,
    #[serde(default)]
    log_events: LogEventsToml,
    #[serde(default)]
    storage: StorageToml,
    mqtt: MqttToml,
}

#[derive(Debug, Deserialize)]
struct PanelToml {
    host: String,
    api_key: String,
    /// Serial number; scopes the persisted checkpoint to this panel
    serial_number: String,
    #[serde(default = "default_use_https")]
    use_https: bool,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
    #[serde(default = "default_large_fetch_timeout")]
    large_fetch_timeout_ms: u64,
    #[serde(default)]
    retries: u32,
    #[serde(default = "default_retry_delay")]
    retry_delay_ms: u64,
}

fn default_use_https() -> bool {
    true
}
fn default_timeout() -> u64 {
    20_000
}
fn default_large_fetch_timeout() -> u64 {
    120_000
}
fn default_retry_delay() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
struct LogEventsToml {
    #[serde(default = "default_fetch_limit")]
    fetch_limit: u32,
    #[serde(default = "default_trigger_fetch_limit")]
    trigger_fetch_limit: u32,
    #[serde(default = "default_scan_interval")]
    scan_interval_secs: u64,
}

impl Default for LogEventsToml {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            trigger_fetch_limit: default_trigger_fetch_limit(),
            scan_interval_secs: default_scan_interval(),
        }
    }
}

fn default_fetch_limit() -> u32 {
    inim_prime_bridge::config::DEFAULT_FETCH_LIMIT
}
fn default_trigger_fetch_limit() -> u32 {
    inim_prime_bridge::config::DEFAULT_TRIGGER_FETCH_LIMIT
}
fn default_scan_interval() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct StorageToml {
    #[serde(default = "default_storage_dir")]
    dir: String,
}

impl Default for StorageToml {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

fn default_storage_dir() -> String {
    "data".to_string()
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_client_id() -> String {
    "inim-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "inim/cmd".to_string()
}
fn default_publish_topic() -> String {
    "inim".to_string()
}

fn build_client_config(toml: &PanelToml) -> ClientConfig {
    ClientConfig::builder()
        .host(&toml.host)
        .api_key(&toml.api_key)
        .use_https(toml.use_https)
        .timeout_ms(toml.timeout_ms)
        .large_fetch_timeout_ms(toml.large_fetch_timeout_ms)
        .retries(toml.retries)
        .retry_delay_ms(toml.retry_delay_ms)
        .build()
}

fn build_poll_config(toml: &LogEventsToml) -> Result<LogPollConfig> {
    let config = LogPollConfig::builder()
        .fetch_limit(toml.fetch_limit)
        .trigger_fetch_limit(toml.trigger_fetch_limit.min(toml.fetch_limit))
        .scan_interval_ms(toml.scan_interval_secs.saturating_mul(1000))
        .build();
    config.validate()?;
    Ok(config)
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    build_poll_config(&config.log_events).context("Invalid [log_events] section")?;
    parse_mqtt_url(&config.mqtt.url)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttLogEvent<'a> {
    now: u64,
    op: String,
    event: MqttLogEventBody<'a>,
}

#[derive(Serialize)]
struct MqttLogEventBody<'a> {
    id: u64,
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'a str,
    agent: Option<&'a str>,
    location: Option<&'a str>,
    value: Option<&'a str>,
}

impl<'a> From<&'a LogEvent> for MqttLogEventBody<'a> {
    fn from(event: &'a LogEvent) -> Self {
        Self {
            id: event.id,
            timestamp: event.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            kind: &event.kind,
            agent: event.agent.as_deref(),
            location: event.location.as_deref(),
            value: event.value.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct MqttPollFailed {
    now: u64,
    op: String,
    kind: String,
    error: String,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// A serialized message waiting for the publisher task.
struct Outgoing {
    topic: String,
    payload: String,
    retain: bool,
}

/// Queue of messages for the publisher task.
///
/// Queuing never waits on the MQTT client: only the publisher task awaits
/// `AsyncClient::publish`, and the event loop task keeps draining rumqttc's
/// request channel independently of it.
#[derive(Clone)]
struct Outbox {
    topic: String,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    fn new(topic: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                topic: topic.into(),
                tx,
            },
            rx,
        )
    }

    fn send_json(&self, payload: &impl Serialize, retain: bool) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                let msg = Outgoing {
                    topic: self.topic.clone(),
                    payload: json,
                    retain,
                };
                if self.tx.send(msg).is_err() {
                    debug!("Publisher stopped, dropping message for {}", self.topic);
                }
            }
            Err(e) => error!("Failed to serialize MQTT payload: {e}"),
        }
    }

    fn cmd_ack(
        &self,
        success: bool,
        src: Option<serde_json::Value>,
        data: Option<serde_json::Value>,
    ) {
        let msg = MqttCmdAck {
            now: now_epoch_ms(),
            op: "CMD_ACK".to_string(),
            success,
            src,
            data,
        };
        self.send_json(&msg, false);
    }
}

/// Publish queued messages in order until every [`Outbox`] is dropped.
async fn run_publisher(client: AsyncClient, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = client
            .publish(&msg.topic, QoS::AtLeastOnce, msg.retain, msg.payload)
            .await
        {
            error!("Failed to publish to {}: {e}", msg.topic);
        }
    }
}

// ---------------------------------------------------------------------------
// Log events → MQTT
// ---------------------------------------------------------------------------

/// Publishes each new log event as its own message, oldest first.
struct MqttSink {
    outbox: Outbox,
}

#[async_trait]
impl LogEventSink for MqttSink {
    async fn on_new_events(&self, events: &[LogEvent]) {
        for event in events {
            info!("Log event: {event}");
            let msg = MqttLogEvent {
                now: now_epoch_ms(),
                op: "LOG_EVENT".to_string(),
                event: event.into(),
            };
            self.outbox.send_json(&msg, false);
        }
    }

    async fn on_poll_failed(&self, error: &InimError) {
        let msg = MqttPollFailed {
            now: now_epoch_ms(),
            op: "POLL_FAILED".to_string(),
            kind: error.kind().to_string(),
            error: error.to_string(),
        };
        self.outbox.send_json(&msg, false);
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

const COMMAND_QUEUE_SIZE: usize = 16;

/// Commands that need the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollCommand {
    Diagnostics,
    PollNow,
}

#[derive(Debug)]
struct QueuedCommand {
    command: PollCommand,
    src: Option<serde_json::Value>,
}

/// Route a command received by the MQTT event loop task. PING is answered
/// here; poller commands are queued for the poll worker. Never waits.
fn dispatch_command(
    payload_str: &str,
    cmd: MqttCommand,
    commands: &mpsc::Sender<QueuedCommand>,
    outbox: &Outbox,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    let command = match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            outbox.cmd_ack(true, src_json, None);
            return;
        }
        "DIAGNOSTICS" => PollCommand::Diagnostics,
        "POLL_NOW" => PollCommand::PollNow,
        other => {
            warn!("Unknown command: {other}");
            outbox.cmd_ack(false, src_json, None);
            return;
        }
    };

    if let Err(e) = commands.try_send(QueuedCommand {
        command,
        src: src_json,
    }) {
        warn!("Cannot queue {} command: {e}", cmd.op);
        outbox.cmd_ack(false, e.into_inner().src, None);
    }
}

/// Run a queued poller command and acknowledge it.
async fn handle_command<S: LogEventSource, C: CheckpointStore>(
    queued: QueuedCommand,
    poller: &mut LogEventPoller<S, C>,
    outbox: &Outbox,
) {
    match queued.command {
        PollCommand::Diagnostics => {
            debug!("Command: DIAGNOSTICS");
            let data = serde_json::to_value(poller.diagnostics()).ok();
            outbox.cmd_ack(data.is_some(), queued.src, data);
        }
        PollCommand::PollNow => {
            info!("Command: POLL_NOW");
            let outcome = poller.tick().await;
            let data = outcome.as_ref().and_then(|o| serde_json::to_value(o).ok());
            outbox.cmd_ack(outcome.is_some(), queued.src, data);
        }
    }
}

/// Own the poller: run a cycle every `scan_interval` and queued commands in
/// between, one at a time. Returns once the command queue is closed.
async fn run_poll_worker<S: LogEventSource, C: CheckpointStore>(
    mut poller: LogEventPoller<S, C>,
    scan_interval: Duration,
    mut commands: mpsc::Receiver<QueuedCommand>,
    outbox: Outbox,
) {
    let mut ticker = interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poller.tick().await;
            }
            queued = commands.recv() => match queued {
                Some(queued) => handle_command(queued, &mut poller, &outbox).await,
                None => break,
            },
        }
    }
    debug!("Poll worker stopped");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=inim_prime_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let client_config = build_client_config(&config.panel);
        let poll_config = build_poll_config(&config.log_events)?;
        let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
        let publish_topic = config.mqtt.publish_topic.clone();
        let subscribe_topic = config.mqtt.subscribe_topic.clone();

        // Connect to panel
        info!("Connecting to INIM Prime panel at {}", client_config.host);
        let panel = InimClient::connect(client_config)
            .await
            .context("Failed to connect to panel")?;
        match panel.api_version().await {
            Ok(version) => info!("Panel API version {version}"),
            Err(e) => warn!("Cannot retrieve panel API version: {e}"),
        }

        let store = FileCheckpointStore::new(&config.storage.dir, &config.panel.serial_number);
        let scan_interval = poll_config.scan_interval();
        let mut poller = LogEventPoller::new(panel, store, poll_config);
        poller.startup().await;

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        let (outbox, outgoing) = Outbox::new(publish_topic);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        // Log events are only consumed once someone can publish them
        poller.attach(Arc::new(MqttSink {
            outbox: outbox.clone(),
        }));

        // Task 1: publisher (the only place that awaits a publish)
        let publish_handle = tokio::spawn(run_publisher(client.clone(), outgoing));

        // Task 2: MQTT event loop (receives messages, forwards commands)
        let client_sub = client.clone();
        let outbox_cmds = outbox.clone();
        let sub_topic = subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_sub.try_subscribe(&sub_topic, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    info!("MQTT command received: {payload}");
                                    dispatch_command(&payload, cmd, &command_tx, &outbox_cmds);
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: poll worker, owns the poller
        let poll_handle = tokio::spawn(run_poll_worker(poller, scan_interval, command_rx, outbox));

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        // Abort tasks; an interrupted cycle has not touched the checkpoint
        poll_handle.abort();
        mqtt_handle.abort();
        publish_handle.abort();
        if let Err(e) = client.try_disconnect() {
            debug!("MQTT disconnect: {e}");
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => {
                config = new_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use inim_prime_bridge::ApiStatus;

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("tcp://10.0.0.2:8883").unwrap(),
            ("10.0.0.2".to_string(), 8883)
        );
        assert!(parse_mqtt_url("mqtt://broker.local").is_err());
        assert!(parse_mqtt_url("mqtt://broker.local:port").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str(
            r#"
            [panel]
            host = "192.168.1.92"
            api_key = "abc"
            serial_number = "SN0001"

            [mqtt]
            url = "mqtt://localhost:1883"
            "#,
        )
        .unwrap();
        assert!(config.panel.use_https);
        assert_eq!(config.panel.retries, 0);
        assert_eq!(config.log_events.fetch_limit, 100);
        assert_eq!(config.log_events.trigger_fetch_limit, 10);
        assert_eq!(config.storage.dir, "data");
        assert_eq!(config.mqtt.publish_topic, "inim");

        let poll = build_poll_config(&config.log_events).unwrap();
        assert_eq!(poll.scan_interval(), Duration::from_secs(30));
        assert_eq!(poll.max_fetch_limit, 4000);
    }

    #[test]
    fn test_poll_config_clamps_trigger_and_rejects_bad_limits() {
        let small = LogEventsToml {
            fetch_limit: 5,
            trigger_fetch_limit: 10,
            scan_interval_secs: 30,
        };
        assert_eq!(build_poll_config(&small).unwrap().trigger_fetch_limit, 5);

        let huge = LogEventsToml {
            fetch_limit: 5000,
            ..LogEventsToml::default()
        };
        assert!(build_poll_config(&huge).is_err());
    }

    #[test]
    fn test_log_event_payload() {
        let ts = NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(10, 0, 5)
            .unwrap();
        let event = LogEvent::new(12, ts, "Disarm", Some("User 1".into()), None, None);
        let msg = MqttLogEvent {
            now: 1,
            op: "LOG_EVENT".to_string(),
            event: (&event).into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"]["type"], "Disarm");
        assert_eq!(json["event"]["timestamp"], "2025-03-14T10:00:05");
        assert_eq!(json["event"]["agent"], "User 1");
        assert!(json["event"]["location"].is_null());
    }

    fn ev(n: u32) -> LogEvent {
        let base = NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        LogEvent::new(
            n as u64,
            base + chrono::Duration::seconds(n as i64),
            "Zone alarm",
            None,
            Some(format!("Zone {n}")),
            None,
        )
    }

    /// Panel log with a fixed content; every fetch returns its tail.
    struct FixedLog {
        events: Vec<LogEvent>,
        fail: bool,
    }

    #[async_trait]
    impl LogEventSource for FixedLog {
        async fn fetch_log_events(&self, limit: u32) -> inim_prime_bridge::Result<Vec<LogEvent>> {
            if self.fail {
                return Err(InimError::Timeout {
                    command: "get_log_elements".to_string(),
                });
            }
            let start = self.events.len().saturating_sub(limit as usize);
            Ok(self.events[start..].to_vec())
        }
    }

    fn bridge_poller(
        events: Vec<LogEvent>,
        fail: bool,
        dir: &tempfile::TempDir,
        outbox: &Outbox,
    ) -> LogEventPoller<FixedLog, FileCheckpointStore> {
        let store = FileCheckpointStore::new(dir.path(), "SN1");
        let mut poller =
            LogEventPoller::new(FixedLog { events, fail }, store, LogPollConfig::default());
        poller.attach(Arc::new(MqttSink {
            outbox: outbox.clone(),
        }));
        poller
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(msg.topic, "inim");
            assert!(!msg.retain);
            out.push(serde_json::from_str(&msg.payload).unwrap());
        }
        out
    }

    fn dispatch(payload: &str, commands: &mpsc::Sender<QueuedCommand>, outbox: &Outbox) {
        let cmd: MqttCommand = serde_json::from_str(payload).unwrap();
        dispatch_command(payload, cmd, commands, outbox);
    }

    #[tokio::test]
    async fn test_sink_does_not_wait_on_mqtt_for_large_batches() {
        // More events than the rumqttc request channel holds
        let (outbox, mut rx) = Outbox::new("inim");
        let sink = MqttSink { outbox };
        let events: Vec<LogEvent> = (0..300).map(ev).collect();

        let done =
            tokio::time::timeout(Duration::from_secs(1), sink.on_new_events(&events)).await;
        assert!(done.is_ok());

        let published = drain(&mut rx);
        assert_eq!(published.len(), 300);
        for (i, msg) in published.iter().enumerate() {
            assert_eq!(msg["op"], "LOG_EVENT");
            assert_eq!(msg["event"]["id"], i as u64);
        }
        assert_eq!(published[299]["event"]["location"], "Zone 299");
    }

    #[tokio::test]
    async fn test_sink_publishes_poll_failed() {
        let (outbox, mut rx) = Outbox::new("inim");
        let sink = MqttSink { outbox };
        sink.on_poll_failed(&InimError::Api(ApiStatus::ApiKey)).await;

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["op"], "POLL_FAILED");
        assert_eq!(published[0]["kind"], "authentication");
    }

    #[test]
    fn test_dispatch_ping_acks_directly() {
        let (outbox, mut rx) = Outbox::new("inim");
        let (tx, mut commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        dispatch(r#"{"op": "PING", "op_id": "p1"}"#, &tx, &outbox);

        assert!(commands.try_recv().is_err());
        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["op"], "CMD_ACK");
        assert_eq!(published[0]["success"], true);
        assert_eq!(published[0]["src"]["op_id"], "p1");
    }

    #[test]
    fn test_dispatch_queues_poller_commands() {
        let (outbox, mut rx) = Outbox::new("inim");
        let (tx, mut commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        dispatch(r#"{"op": "DIAGNOSTICS"}"#, &tx, &outbox);
        dispatch(r#"{"op": "POLL_NOW", "op_id": "n1"}"#, &tx, &outbox);

        let first = commands.try_recv().unwrap();
        assert_eq!(first.command, PollCommand::Diagnostics);
        let second = commands.try_recv().unwrap();
        assert_eq!(second.command, PollCommand::PollNow);
        assert_eq!(second.src.unwrap()["op_id"], "n1");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dispatch_unknown_op_nacks() {
        let (outbox, mut rx) = Outbox::new("inim");
        let (tx, mut commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        dispatch(r#"{"op": "ARM"}"#, &tx, &outbox);

        assert!(commands.try_recv().is_err());
        let published = drain(&mut rx);
        assert_eq!(published[0]["success"], false);
        assert_eq!(published[0]["src"]["op"], "ARM");
    }

    #[test]
    fn test_dispatch_full_queue_nacks() {
        let (outbox, mut rx) = Outbox::new("inim");
        let (tx, _commands) = mpsc::channel(1);
        dispatch(r#"{"op": "POLL_NOW"}"#, &tx, &outbox);
        dispatch(r#"{"op": "POLL_NOW", "op_id": "late"}"#, &tx, &outbox);

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["success"], false);
        assert_eq!(published[0]["src"]["op_id"], "late");
    }

    #[tokio::test]
    async fn test_poll_now_publishes_events_then_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (outbox, mut rx) = Outbox::new("inim");
        // First poll without a checkpoint escalates and emits everything
        let mut poller = bridge_poller((0..300).map(ev).collect(), false, &dir, &outbox);

        let queued = QueuedCommand {
            command: PollCommand::PollNow,
            src: Some(serde_json::json!({"op": "POLL_NOW"})),
        };
        handle_command(queued, &mut poller, &outbox).await;

        let published = drain(&mut rx);
        assert_eq!(published.len(), 301);
        assert!(published[..300].iter().all(|m| m["op"] == "LOG_EVENT"));
        assert_eq!(published[0]["event"]["id"], 0);
        let ack = &published[300];
        assert_eq!(ack["op"], "CMD_ACK");
        assert_eq!(ack["success"], true);
        assert_eq!(ack["data"]["result"], "emitted");
        assert_eq!(ack["data"]["count"], 300);
        assert_eq!(ack["data"]["escalated"], true);
    }

    #[tokio::test]
    async fn test_poll_now_failure_nacks() {
        let dir = tempfile::tempdir().unwrap();
        let (outbox, mut rx) = Outbox::new("inim");
        let mut poller = bridge_poller(Vec::new(), true, &dir, &outbox);

        let queued = QueuedCommand {
            command: PollCommand::PollNow,
            src: None,
        };
        handle_command(queued, &mut poller, &outbox).await;

        let published = drain(&mut rx);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0]["op"], "POLL_FAILED");
        assert_eq!(published[0]["kind"], "transport");
        assert_eq!(published[1]["op"], "CMD_ACK");
        assert_eq!(published[1]["success"], false);
    }

    #[tokio::test]
    async fn test_diagnostics_ack_carries_known_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (outbox, mut rx) = Outbox::new("inim");
        let mut poller = bridge_poller((0..3).map(ev).collect(), false, &dir, &outbox);
        poller.poll_once().await.unwrap();
        drain(&mut rx);

        let queued = QueuedCommand {
            command: PollCommand::Diagnostics,
            src: None,
        };
        handle_command(queued, &mut poller, &outbox).await;

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["success"], true);
        assert_eq!(published[0]["data"]["known_tail_len"], 3);
        assert_eq!(published[0]["data"]["log_events"][2]["location"], "Zone 2");
        assert_eq!(published[0]["data"]["stats"]["events_emitted"], 3);
    }

    #[tokio::test]
    async fn test_poll_worker_serves_commands_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (outbox, mut rx) = Outbox::new("inim");
        let poller = bridge_poller((0..5).map(ev).collect(), false, &dir, &outbox);
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);

        let worker = tokio::spawn(run_poll_worker(
            poller,
            Duration::from_secs(3600),
            commands,
            outbox,
        ));
        tx.send(QueuedCommand {
            command: PollCommand::PollNow,
            src: None,
        })
        .await
        .unwrap();
        drop(tx);

        let finished = tokio::time::timeout(Duration::from_secs(5), worker).await;
        assert!(matches!(finished, Ok(Ok(()))));

        // The immediate first tick and POLL_NOW may run in either order, but
        // the events are emitted exactly once.
        let published = drain(&mut rx);
        let log_events = published.iter().filter(|m| m["op"] == "LOG_EVENT").count();
        assert_eq!(log_events, 5);
        let last = published.last().unwrap();
        assert_eq!(last["op"], "CMD_ACK");
        assert_eq!(last["success"], true);
    }
}
