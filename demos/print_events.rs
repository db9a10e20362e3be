//! Example: Fetch the recent audit log of an INIM Prime panel, then print
//! new events as they are appended.

use std::sync::Arc;

use inim_prime_bridge::{
    event_channel, ClientConfig, FileCheckpointStore, InimClient, LogEventPoller, LogPollConfig,
    PanelEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ClientConfig::builder()
        .host("192.168.1.92")
        .api_key("my-api-key")
        .retries(2)
        .build();

    println!("Connecting to panel...");
    let client = InimClient::connect(config).await?;
    println!("API version: {}", client.api_version().await?);

    // Print the last few entries
    let recent = client.get_log_events(10).await?;
    println!("\n--- Last {} log events ---", recent.len());
    for event in &recent {
        println!("  {event}");
    }

    let store = FileCheckpointStore::new(std::env::temp_dir(), "demo");
    let poll_config = LogPollConfig::builder().scan_interval_ms(10_000).build();
    let mut poller = LogEventPoller::new(client, store, poll_config);
    poller.startup().await;

    let (tx, mut rx) = event_channel(64);
    poller.attach(Arc::new(tx));

    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                PanelEvent::LogEvents(events) => {
                    for event in events {
                        println!("New: {event}");
                    }
                }
                PanelEvent::PollFailed { kind, message } => {
                    println!("Poll failed ({kind}): {message}");
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    println!("\nWatching for new events (Ctrl+C to stop)...");
    poller.run(shutdown_rx).await;
    Ok(())
}
