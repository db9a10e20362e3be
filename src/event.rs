// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FailureKind, InimError};
use crate::log_event::LogEvent;

/// Receiver of the poller's output.
///
/// `on_new_events` is called at most once per poll cycle, only with a
/// non-empty list, oldest event first.
#[async_trait]
pub trait LogEventSink: Send + Sync {
    async fn on_new_events(&self, events: &[LogEvent]);

    /// A poll cycle failed; the known tail was left untouched.
    async fn on_poll_failed(&self, _error: &InimError) {}
}

/// Events broadcast to in-process subscribers.
///
/// Subscribe via [`event_channel`] and attach the sender to the poller.
#[derive(Debug, Clone)]
pub enum PanelEvent {
    /// Newly appended audit log entries, oldest first
    LogEvents(Vec<LogEvent>),
    /// A poll cycle failed
    PollFailed { kind: FailureKind, message: String },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<PanelEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<PanelEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

#[async_trait]
impl LogEventSink for EventSender {
    async fn on_new_events(&self, events: &[LogEvent]) {
        if self.send(PanelEvent::LogEvents(events.to_vec())).is_err() {
            debug!("No subscribers for {} log events", events.len());
        }
    }

    async fn on_poll_failed(&self, error: &InimError) {
        let _ = self.send(PanelEvent::PollFailed {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_broadcast_sink() {
        let (tx, mut rx) = event_channel(8);
        let ts = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let events = vec![LogEvent::new(1, ts, "Arm", None, None, None)];

        tx.on_new_events(&events).await;
        match rx.recv().await.unwrap() {
            PanelEvent::LogEvents(received) => assert_eq!(received, events),
            other => panic!("unexpected event: {other:?}"),
        }

        tx.on_poll_failed(&InimError::NotConnected).await;
        match rx.recv().await.unwrap() {
            PanelEvent::PollFailed { kind, .. } => assert_eq!(kind, FailureKind::Transport),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let (tx, rx) = event_channel(8);
        drop(rx);
        // Must not panic when nobody listens.
        tx.on_new_events(&[]).await;
    }
}
