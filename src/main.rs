use anyhow::Result;
use clap::Parser;
use log::{info, LevelFilter};
use std::sync::Arc;
use std::time::Duration;

use courier::config::{load_config, SyncConfig};
use courier::models::MessageContent;
use courier::sync::{ClientEvent, MockTransport, SyncClient};
use courier::utils;
use courier::SystemClock;

/// Command line arguments for the courier harness
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Courier harness: exercises the delivery sync core over an in-memory transport.",
    long_about = "Runs the synchronization core end to end against a simulated transport:\n\
    connect, send a burst of messages, optionally drop the connection mid-run to\n\
    exercise offline queuing and replay, then report the observed events."
)]
struct Args {
    /// Number of messages to send
    #[arg(short = 'n', long, default_value_t = 10)]
    messages: usize,

    /// Recipient identifier used for every message
    #[arg(long, default_value = "demo@example.com")]
    recipient: String,

    /// Sever the connection halfway through to exercise offline replay
    #[arg(long)]
    simulate_drop: bool,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    utils::setup_logging(args.log_file.as_deref(), level)?;

    let config = load_config().unwrap_or_else(|e| {
        log::warn!("Could not load config ({}), using defaults", e);
        SyncConfig::default()
    });
    info!(
        "Harness: {} messages to {} (simulate_drop: {})",
        args.messages, args.recipient, args.simulate_drop
    );

    let transport = Arc::new(MockTransport::with_auto_ack());
    let (mut client, handle, events_rx) =
        SyncClient::new(config, transport.clone(), Arc::new(SystemClock));
    let mut client_events = client.subscribe();
    tokio::spawn(client.run(events_rx));

    handle.connect().await?;

    let halfway = args.messages / 2;
    for i in 0..args.messages {
        if args.simulate_drop && i == halfway {
            info!("Severing the connection mid-run");
            transport
                .emit(courier::sync::TransportEvent::ConnectionStatus { connected: false })
                .await;
            transport.sever();
        }
        let id = handle
            .send_message(
                &args.recipient,
                MessageContent::text(format!("harness message {}", i + 1)),
            )
            .await?;
        info!("Requested send of {}", id);
    }

    // Let the core settle: acks, reconnect backoff, replay
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut updates = 0usize;
    let mut notifications = 0usize;
    loop {
        let event = tokio::time::timeout_at(deadline, client_events.recv()).await;
        match event {
            Ok(Some(ClientEvent::MessageUpdated(message))) => {
                updates += 1;
                info!("Message {} is now {:?}", message.id, message.status);
            }
            Ok(Some(ClientEvent::ConnectionChanged(state))) => {
                info!("Connection: {:?}", state);
            }
            Ok(Some(ClientEvent::Notification(notification))) => {
                notifications += 1;
                info!(
                    "Notification [{}] {} (x{})",
                    notification.group_key, notification.title, notification.occurrence_count
                );
            }
            Ok(Some(other)) => info!("Event: {:?}", other),
            Ok(None) | Err(_) => break,
        }
    }

    handle.disconnect().await?;
    info!(
        "Done: {} status updates, {} notifications, {} payloads reached the transport",
        updates,
        notifications,
        transport.sent().len()
    );
    Ok(())
}
