// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge
//
//! # inim-prime-bridge
//!
//! Polls the audit log of an INIM Prime alarm panel over its HTTP API and
//! forwards only the newly appended entries.
//!
//! The panel exposes nothing but its N most recent log entries, with ids
//! that are not stable between calls. The poller keeps the last window it
//! has seen (the known tail), aligns every fresh window against it on event
//! content, and persists it so a restart does not replay history.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use inim_prime_bridge::{
//!     event_channel, ClientConfig, FileCheckpointStore, InimClient, LogEventPoller,
//!     LogPollConfig, PanelEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = InimClient::connect(
//!         ClientConfig::builder()
//!             .host("192.168.1.92")
//!             .api_key("my-api-key")
//!             .build(),
//!     )
//!     .await?;
//!     let store = FileCheckpointStore::new("/var/lib/inim2mqtt", "SN0001");
//!
//!     let mut poller = LogEventPoller::new(client, store, LogPollConfig::default());
//!     poller.startup().await;
//!
//!     let (tx, mut rx) = event_channel(64);
//!     poller.attach(Arc::new(tx));
//!     tokio::spawn(async move {
//!         while let Ok(PanelEvent::LogEvents(events)) = rx.recv().await {
//!             for event in events {
//!                 println!("{event}");
//!             }
//!         }
//!     });
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     poller.run(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod log_event;
pub mod poller;
pub mod protocol;
pub mod reconcile;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use client::{InimClient, LogEventSource};
pub use config::{ClientConfig, ClientConfigBuilder, LogPollConfig, LogPollConfigBuilder};
pub use error::{ApiStatus, FailureKind, InimError, Result};
pub use event::{event_channel, EventReceiver, EventSender, LogEventSink, PanelEvent};
pub use log_event::LogEvent;
pub use poller::{KnownTail, LogEventPoller, PollDiagnostics, PollOutcome, PollPhase, PollStats};
pub use reconcile::reconcile;
