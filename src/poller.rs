// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

//! Two-phase polling of the panel's audit log.
//!
//! Each cycle first fetches a small probe window. Only when the probe shows
//! something new is the full window fetched and reconciled, and when that
//! window is saturated with new events one more fetch at the API maximum is
//! made. The known tail is replaced and persisted only after the new events
//! have been handed to the sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::LogEventSource;
use crate::config::LogPollConfig;
use crate::error::Result;
use crate::event::LogEventSink;
use crate::log_event::LogEvent;
use crate::reconcile::reconcile;

/// The last reconciled log window, oldest first, bounded to `capacity`.
#[derive(Debug, Clone, Default)]
pub struct KnownTail {
    events: Vec<LogEvent>,
    capacity: usize,
}

impl KnownTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
        }
    }

    pub fn from_events(events: Vec<LogEvent>, capacity: usize) -> Self {
        let mut tail = Self::new(capacity);
        tail.replace(events);
        tail
    }

    /// Replace the whole tail with `window`, keeping its newest `capacity`
    /// events.
    pub fn replace(&mut self, mut window: Vec<LogEvent>) {
        if window.len() > self.capacity {
            window.drain(..window.len() - self.capacity);
        }
        self.events = window;
    }

    pub fn as_slice(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn newest(&self) -> Option<&LogEvent> {
        self.events.last()
    }
}

/// Where a poll cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Probing,
    Reconciling,
    Escalating,
    Emitting,
}

/// Result of one successful poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PollOutcome {
    /// No sink attached yet; nothing was fetched
    NotReady,
    /// Nothing new on the panel
    Unchanged,
    /// `count` new events were handed to the sink
    Emitted { count: usize, escalated: bool },
}

/// Counters kept across cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub cycles: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub events_emitted: u64,
    pub escalations: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Serializable snapshot of the poller for diagnostics export.
#[derive(Debug, Clone, Serialize)]
pub struct PollDiagnostics {
    pub ready: bool,
    pub phase: PollPhase,
    pub trigger_fetch_limit: u32,
    pub fetch_limit: u32,
    pub max_fetch_limit: u32,
    pub scan_interval_ms: u64,
    pub known_tail_len: usize,
    pub newest_known_event: Option<LogEvent>,
    /// The whole known tail, oldest first
    pub log_events: Vec<LogEvent>,
    pub stats: PollStats,
}

/// Presentation layer slot. Cycles are skipped until a sink is attached so
/// no event is consumed before anyone can surface it.
enum Subscriber {
    NotReady,
    Attached(Arc<dyn LogEventSink>),
}

/// Steps of one cycle.
enum Step {
    Probe,
    Reconcile,
    Escalate,
    Emit { window: Vec<LogEvent>, new_count: usize },
}

/// Polls one panel's audit log and forwards newly appended events.
pub struct LogEventPoller<S, C> {
    source: S,
    store: C,
    config: LogPollConfig,
    tail: KnownTail,
    subscriber: Subscriber,
    phase: PollPhase,
    stats: PollStats,
}

impl<S: LogEventSource, C: CheckpointStore> LogEventPoller<S, C> {
    pub fn new(source: S, store: C, config: LogPollConfig) -> Self {
        let capacity = config.max_fetch_limit as usize;
        Self {
            source,
            store,
            config,
            tail: KnownTail::new(capacity),
            subscriber: Subscriber::NotReady,
            phase: PollPhase::Idle,
            stats: PollStats::default(),
        }
    }

    /// Restore the known tail from the checkpoint store. A missing or
    /// unreadable checkpoint starts from an empty tail.
    pub async fn startup(&mut self) {
        let capacity = self.config.max_fetch_limit as usize;
        self.tail = match self.store.load().await {
            Ok(Some(events)) => {
                info!("Restored {} known log events from checkpoint", events.len());
                KnownTail::from_events(events, capacity)
            }
            Ok(None) => {
                debug!("No log event checkpoint, starting empty");
                KnownTail::new(capacity)
            }
            Err(e) => {
                warn!("Failed to load log event checkpoint, starting empty: {e}");
                KnownTail::new(capacity)
            }
        };
    }

    /// Register the presentation layer. Replaces any previous sink.
    pub fn attach(&mut self, sink: Arc<dyn LogEventSink>) {
        self.subscriber = Subscriber::Attached(sink);
    }

    pub fn detach(&mut self) {
        self.subscriber = Subscriber::NotReady;
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.subscriber, Subscriber::Attached(_))
    }

    pub fn known_tail(&self) -> &KnownTail {
        &self.tail
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn config(&self) -> &LogPollConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> PollDiagnostics {
        PollDiagnostics {
            ready: self.is_ready(),
            phase: self.phase,
            trigger_fetch_limit: self.config.trigger_fetch_limit,
            fetch_limit: self.config.fetch_limit,
            max_fetch_limit: self.config.max_fetch_limit,
            scan_interval_ms: self.config.scan_interval_ms,
            known_tail_len: self.tail.len(),
            newest_known_event: self.tail.newest().cloned(),
            log_events: self.tail.as_slice().to_vec(),
            stats: self.stats.clone(),
        }
    }

    /// Run one poll cycle.
    ///
    /// A fetch failure aborts the cycle and is returned; the known tail and
    /// the checkpoint are left as they were.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let sink = match &self.subscriber {
            Subscriber::Attached(sink) => Arc::clone(sink),
            Subscriber::NotReady => {
                debug!("Log event sink not attached yet, skipping poll");
                return Ok(PollOutcome::NotReady);
            }
        };

        let result = self.run_cycle(sink.as_ref()).await;
        self.phase = PollPhase::Idle;
        self.record(&result);
        result
    }

    /// Run one cycle and report a failure to the sink instead of returning
    /// it.
    pub async fn tick(&mut self) -> Option<PollOutcome> {
        match self.poll_once().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Log event poll failed ({}): {}", e.kind(), e);
                if let Subscriber::Attached(sink) = &self.subscriber {
                    sink.on_poll_failed(&e).await;
                }
                None
            }
        }
    }

    /// Poll every `scan_interval` until `shutdown` becomes `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Log event poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(&mut self, sink: &dyn LogEventSink) -> Result<PollOutcome> {
        let fetch_limit = self.config.fetch_limit;
        let max_fetch_limit = self.config.max_fetch_limit;
        let mut escalated = false;
        let mut step = Step::Probe;

        loop {
            step = match step {
                Step::Probe => {
                    self.phase = PollPhase::Probing;
                    let window = self
                        .source
                        .fetch_log_events(self.config.trigger_fetch_limit)
                        .await?;
                    if reconcile(self.tail.as_slice(), &window).is_empty() {
                        return Ok(PollOutcome::Unchanged);
                    }
                    Step::Reconcile
                }
                Step::Reconcile => {
                    self.phase = PollPhase::Reconciling;
                    let window = self.source.fetch_log_events(fetch_limit).await?;
                    let new_count = reconcile(self.tail.as_slice(), &window).len();
                    if new_count == fetch_limit as usize && fetch_limit < max_fetch_limit {
                        debug!("Log window saturated with {new_count} new events, escalating");
                        Step::Escalate
                    } else {
                        Step::Emit { window, new_count }
                    }
                }
                Step::Escalate => {
                    self.phase = PollPhase::Escalating;
                    escalated = true;
                    let window = self.source.fetch_log_events(max_fetch_limit).await?;
                    let new_count = reconcile(self.tail.as_slice(), &window).len();
                    Step::Emit { window, new_count }
                }
                Step::Emit { window, new_count } => {
                    self.phase = PollPhase::Emitting;
                    if new_count == 0 {
                        return Ok(PollOutcome::Unchanged);
                    }
                    info!("{new_count} new log events");
                    sink.on_new_events(&window[window.len() - new_count..]).await;
                    self.tail.replace(window);
                    if let Err(e) = self.store.save(self.tail.as_slice()).await {
                        warn!("Failed to persist log event checkpoint: {e}");
                    }
                    return Ok(PollOutcome::Emitted {
                        count: new_count,
                        escalated,
                    });
                }
            };
        }
    }

    fn record(&mut self, result: &Result<PollOutcome>) {
        match result {
            Ok(PollOutcome::NotReady) => {}
            Ok(outcome) => {
                self.stats.cycles += 1;
                self.stats.consecutive_failures = 0;
                self.stats.last_success = Some(Utc::now());
                if let PollOutcome::Emitted { count, escalated } = outcome {
                    self.stats.events_emitted += *count as u64;
                    if *escalated {
                        self.stats.escalations += 1;
                    }
                }
            }
            Err(e) => {
                self.stats.cycles += 1;
                self.stats.failures += 1;
                self.stats.consecutive_failures += 1;
                self.stats.last_error = Some(e.to_string());
            }
        }
    }
}
