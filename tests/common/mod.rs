// Common test utilities for integration tests
// Builds a sync client wired to a mock transport and a manual clock so
// scenarios run deterministically, without wall-clock sleeps.
// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use tokio::sync::mpsc;

use courier::clock::ManualClock;
use courier::config::SyncConfig;
use courier::sync::{ClientEvent, Event, MockTransport, SyncClient, SyncHandle};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub fn test_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub struct TestRig {
    pub client: SyncClient,
    pub handle: SyncHandle,
    pub events_rx: mpsc::Receiver<Event>,
    pub client_events: mpsc::Receiver<ClientEvent>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
}

/// Build a client over a fresh mock transport. The caller drives
/// `client.handle_event` directly (or drains `events_rx`) so tests stay
/// deterministic.
pub fn setup_test_client(config: SyncConfig) -> TestRig {
    setup_logging();
    let clock = Arc::new(ManualClock::new(test_start_time()));
    let transport = Arc::new(MockTransport::new());
    let (mut client, handle, events_rx) =
        SyncClient::new(config, transport.clone(), clock.clone());
    let client_events = client.subscribe();
    TestRig {
        client,
        handle,
        events_rx,
        client_events,
        transport,
        clock,
    }
}

/// Collect every client event currently queued.
pub fn drain_client_events(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Count the notifications among a batch of client events.
pub fn notification_count(events: &[ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Notification(_)))
        .count()
}
