// Synchronization core: keeps the client's view of outbound message state
// consistent with an unreliable transport. Everything runs on a single
// dispatch loop consuming typed events; timers and the transport post
// events back into the loop, so no state is touched concurrently.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod connection;
pub mod dispatch;
pub mod notify;
pub mod offline;
pub mod retry;
pub mod store;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{BatchDispatcher, DispatchOptions, DispatchOutcome, DispatchReport};
pub use notify::{
    DeliveryMode, NoCapability, Notification, NotificationAggregator, NotificationCapability,
    NotificationPermission, NotificationPriority,
};
pub use offline::{OfflineQueue, OfflineQueueEntry, QueuedOperation};
pub use retry::{RetryScheduler, RetryTask, ScheduleOutcome};
pub use store::MessageStore;
pub use transport::{BatchResponse, MockTransport, SendPayload, Transport, TransportEvent};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{SendError, StoreError};
use crate::models::{Message, MessageContent, MessageFilter, MessageStatus};

/// Everything the dispatch loop reacts to: inbound transport events,
/// caller commands, and timer firings.
#[derive(Debug)]
pub enum Event {
    Transport(TransportEvent),
    Command(Command),
    /// A retry backoff timer fired.
    RetryDue {
        message_id: String,
        attempt_number: u32,
        generation: u64,
    },
    /// A reconnect backoff timer fired.
    ReconnectDue { generation: u64 },
    /// A scheduled message reached its dispatch time.
    ScheduledDue { message_id: String },
    /// A notification debounce window closed.
    FlushNotifications { group_key: String },
}

/// Caller requests, posted through a `SyncHandle`.
#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send {
        message_id: String,
        recipient: String,
        content: MessageContent,
        dispatch_at: Option<DateTime<Utc>>,
    },
    Cancel { message_id: String },
    Acknowledge { message_id: String },
}

/// Events surfaced to subscribers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    /// A locally tracked message changed state.
    MessageUpdated(Message),
    /// A new inbound message arrived over the stream.
    MessageReceived(Message),
    Notification(Notification),
    /// The offline queue evicted an entry to stay within capacity.
    QueueOverflow { dropped_sequence: u64 },
    /// Session-level failure requiring caller intervention.
    SessionError(String),
}

/// Cheap cloneable handle posting commands into the dispatch loop.
#[derive(Clone)]
pub struct SyncHandle {
    events_tx: mpsc::Sender<Event>,
}

impl SyncHandle {
    pub async fn connect(&self) -> Result<()> {
        self.post(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.post(Command::Disconnect).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.post(Command::Reconnect).await
    }

    /// Request a send; returns the assigned message id.
    pub async fn send_message(&self, recipient: &str, content: MessageContent) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        self.post(Command::Send {
            message_id: message_id.clone(),
            recipient: recipient.to_string(),
            content,
            dispatch_at: None,
        })
        .await?;
        Ok(message_id)
    }

    /// Request a send at a future dispatch time.
    pub async fn schedule_message(
        &self,
        recipient: &str,
        content: MessageContent,
        dispatch_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        self.post(Command::Send {
            message_id: message_id.clone(),
            recipient: recipient.to_string(),
            content,
            dispatch_at: Some(dispatch_at),
        })
        .await?;
        Ok(message_id)
    }

    pub async fn cancel_message(&self, message_id: &str) -> Result<()> {
        self.post(Command::Cancel {
            message_id: message_id.to_string(),
        })
        .await
    }

    pub async fn acknowledge_message(&self, message_id: &str) -> Result<()> {
        self.post(Command::Acknowledge {
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn post(&self, command: Command) -> Result<()> {
        self.events_tx
            .send(Event::Command(command))
            .await
            .map_err(|_| anyhow!("sync loop is no longer running"))
    }
}

pub struct SyncClient {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    connection: ConnectionManager,
    store: MessageStore,
    retries: RetryScheduler,
    offline: OfflineQueue,
    dispatcher: BatchDispatcher,
    notifier: NotificationAggregator,
    events_tx: mpsc::Sender<Event>,
    subscribers: Vec<mpsc::Sender<ClientEvent>>,
    last_connection_state: ConnectionState,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> (Self, SyncHandle, mpsc::Receiver<Event>) {
        let capability: Arc<dyn NotificationCapability> = Arc::new(NoCapability);
        Self::assemble(config, transport, clock, capability, None)
    }

    /// Variant with a host notification capability and durable offline
    /// queue persistence.
    pub fn with_options(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        capability: Arc<dyn NotificationCapability>,
        offline_path: Option<PathBuf>,
    ) -> Result<(Self, SyncHandle, mpsc::Receiver<Event>)> {
        if let Some(path) = &offline_path {
            // Validate the persisted queue up front so a corrupt file
            // surfaces at startup rather than at the first enqueue.
            OfflineQueue::with_persistence(config.offline_queue_capacity, clock.clone(), path.clone())?;
        }
        Ok(Self::assemble(config, transport, clock, capability, offline_path))
    }

    fn assemble(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        capability: Arc<dyn NotificationCapability>,
        offline_path: Option<PathBuf>,
    ) -> (Self, SyncHandle, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (transport_tx, mut transport_rx) = mpsc::channel::<TransportEvent>(256);

        // Bridge the transport's event stream into the dispatch loop.
        let bridge_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if bridge_tx.send(Event::Transport(event)).await.is_err() {
                    break;
                }
            }
        });

        let connection = ConnectionManager::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.max_reconnect_attempts,
            transport.clone(),
            transport_tx,
            events_tx.clone(),
            StdRng::from_entropy(),
        );
        let store = MessageStore::new(config.terminal_ttl_secs, clock.clone());
        let retries = RetryScheduler::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.max_send_attempts,
            StdRng::from_entropy(),
            clock.clone(),
            events_tx.clone(),
        );
        let offline = match offline_path {
            Some(path) => {
                OfflineQueue::with_persistence(config.offline_queue_capacity, clock.clone(), path)
                    // Validated in with_options; fall back to volatile on a race.
                    .unwrap_or_else(|_| OfflineQueue::new(config.offline_queue_capacity, clock.clone()))
            }
            None => OfflineQueue::new(config.offline_queue_capacity, clock.clone()),
        };
        let dispatcher =
            BatchDispatcher::new(transport, config.batch_size, config.rate_limit_per_minute);
        let notifier = NotificationAggregator::new(
            config.notification_capacity,
            config.debounce_window_ms,
            capability,
            clock.clone(),
            events_tx.clone(),
        );

        let handle = SyncHandle {
            events_tx: events_tx.clone(),
        };
        (
            SyncClient {
                config,
                clock,
                connection,
                store,
                retries,
                offline,
                dispatcher,
                notifier,
                events_tx,
                subscribers: Vec::new(),
                last_connection_state: ConnectionState::Disconnected,
            },
            handle,
            events_rx,
        )
    }

    /// Register a subscriber for client events.
    pub fn subscribe(&mut self) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(128);
        self.subscribers.push(tx);
        rx
    }

    /// Drive the dispatch loop until every event source is gone.
    pub async fn run(mut self, mut events_rx: mpsc::Receiver<Event>) {
        info!("Sync loop started");
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        info!("Sync loop stopped");
    }

    /// Process one event to completion.
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.handle_command(command).await,
            Event::Transport(transport_event) => self.handle_transport(transport_event).await,
            Event::RetryDue {
                message_id,
                attempt_number,
                generation,
            } => self.handle_retry_due(message_id, attempt_number, generation).await,
            Event::ReconnectDue { generation } => {
                self.connection.on_reconnect_due(generation).await;
                self.after_connection_change().await;
            }
            Event::ScheduledDue { message_id } => self.handle_scheduled_due(message_id).await,
            Event::FlushNotifications { group_key } => {
                if let Some(notification) = self.notifier.flush(&group_key) {
                    self.emit(ClientEvent::Notification(notification));
                }
            }
        }
    }

    pub async fn connect(&mut self) {
        self.connection.connect().await;
        self.after_connection_change().await;
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
        self.after_connection_change().await;
    }

    pub async fn reconnect(&mut self) {
        self.connection.reconnect().await;
        self.after_connection_change().await;
    }

    /// Create and dispatch a message now; returns its id.
    pub async fn send_message(
        &mut self,
        recipient: &str,
        content: MessageContent,
    ) -> Result<String, StoreError> {
        let message_id = Uuid::new_v4().to_string();
        self.create_and_send(message_id.clone(), recipient.to_string(), content, None)
            .await?;
        Ok(message_id)
    }

    /// Create a message for dispatch at a future time; returns its id.
    pub async fn schedule_message(
        &mut self,
        recipient: &str,
        content: MessageContent,
        dispatch_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let message_id = Uuid::new_v4().to_string();
        self.create_and_send(
            message_id.clone(),
            recipient.to_string(),
            content,
            Some(dispatch_at),
        )
        .await?;
        Ok(message_id)
    }

    /// Cancel a pending or scheduled message: transitions it to
    /// `Cancelled`, drops its retry timer, and removes any buffered send.
    pub async fn cancel_message(&mut self, message_id: &str) -> Result<(), StoreError> {
        let updated =
            self.store
                .apply_status(message_id, MessageStatus::Cancelled, self.clock.now())?;
        self.retries.cancel(message_id);
        self.offline.cancel(message_id);
        if let Some(message) = updated {
            self.emit(ClientEvent::MessageUpdated(message));
        }
        Ok(())
    }

    /// Acknowledge a terminal message, releasing it for collection.
    pub fn acknowledge(&mut self, message_id: &str) -> bool {
        let acked = self.store.acknowledge(message_id);
        if acked {
            self.store.collect_garbage();
        }
        acked
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.store.get(message_id)
    }

    pub fn messages(&self, filter: &MessageFilter) -> Vec<&Message> {
        self.store.list(filter)
    }

    pub fn offline_size(&self) -> usize {
        self.offline.size()
    }

    pub fn retry_task(&self, message_id: &str) -> Option<&RetryTask> {
        self.retries.task(message_id)
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::Reconnect => self.reconnect().await,
            Command::Send {
                message_id,
                recipient,
                content,
                dispatch_at,
            } => {
                if let Err(e) = self
                    .create_and_send(message_id, recipient, content, dispatch_at)
                    .await
                {
                    warn!("Send command rejected: {}", e);
                }
            }
            Command::Cancel { message_id } => {
                if let Err(e) = self.cancel_message(&message_id).await {
                    warn!("Cancel of message {} rejected: {}", message_id, e);
                }
            }
            Command::Acknowledge { message_id } => {
                self.acknowledge(&message_id);
            }
        }
    }

    async fn create_and_send(
        &mut self,
        message_id: String,
        recipient: String,
        content: MessageContent,
        dispatch_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let message = Message::with_id(message_id.clone(), recipient, content, now);
        self.store.create(message.clone())?;
        self.emit(ClientEvent::MessageUpdated(message));

        match dispatch_at {
            Some(at) if at > now => {
                self.store.apply_status(&message_id, MessageStatus::Scheduled, now)?;
                self.store.set_schedule(&message_id, at)?;
                if let Some(message) = self.store.get(&message_id) {
                    self.emit(ClientEvent::MessageUpdated(message.clone()));
                }
                let delay = (at - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events_tx.send(Event::ScheduledDue { message_id }).await;
                });
            }
            _ => self.dispatch_outbound(vec![message_id]).await,
        }
        Ok(())
    }

    async fn handle_scheduled_due(&mut self, message_id: String) {
        if self.store.get(&message_id).map(|m| m.status) != Some(MessageStatus::Scheduled) {
            // Cancelled in the meantime, or never scheduled
            return;
        }
        match self
            .store
            .apply_status(&message_id, MessageStatus::Pending, self.clock.now())
        {
            Ok(Some(message)) => {
                self.emit(ClientEvent::MessageUpdated(message));
                self.dispatch_outbound(vec![message_id]).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Scheduled dispatch of {} failed: {}", message_id, e),
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageNew(message) => match self.store.create(message.clone()) {
                Ok(()) => self.emit(ClientEvent::MessageReceived(message)),
                Err(StoreError::DuplicateMessage(id)) => {
                    debug!("Duplicate inbound message {}, ignoring", id)
                }
                Err(e) => warn!("Failed to track inbound message: {}", e),
            },
            TransportEvent::MessageStatus {
                message_id,
                status,
                timestamp,
            } => match self.store.apply_status(&message_id, status, timestamp) {
                Ok(Some(message)) => {
                    // The server has the message; any local retry is moot.
                    self.retries.cancel(&message_id);
                    self.emit(ClientEvent::MessageUpdated(message));
                }
                Ok(None) => debug!("Duplicate status event for message {}", message_id),
                Err(StoreError::StaleTimestamp { .. }) => {
                    debug!("Out-of-order status event for message {}, rejected", message_id)
                }
                Err(e) => debug!("Status event rejected: {}", e),
            },
            TransportEvent::ConnectionStatus { connected } => {
                self.connection.on_transport_status(connected).await;
                self.after_connection_change().await;
            }
            TransportEvent::Error {
                message,
                recoverable,
                retry_after,
            } => {
                if recoverable {
                    debug!(
                        "Recoverable transport error (retry_after {:?}): {}",
                        retry_after, message
                    );
                } else {
                    self.connection.fail_fatal(&message).await;
                    self.emit(ClientEvent::SessionError(message.clone()));
                    self.after_connection_change().await;
                }
            }
        }
    }

    async fn handle_retry_due(&mut self, message_id: String, attempt_number: u32, generation: u64) {
        if generation != self.connection.generation() {
            debug!("Retry timer for {} belongs to a dead connection", message_id);
            return;
        }
        if !self.retries.take_due(&message_id, attempt_number, generation) {
            return;
        }
        if self.store.get(&message_id).map(|m| m.status) != Some(MessageStatus::Pending) {
            debug!("Retry for {} dropped, message no longer pending", message_id);
            return;
        }
        self.dispatch_outbound(vec![message_id]).await;
    }

    /// Transmit messages if connected, otherwise buffer them for replay.
    async fn dispatch_outbound(&mut self, message_ids: Vec<String>) {
        if self.connection.state() != ConnectionState::Connected {
            for message_id in message_ids {
                if let Some(payload) = self.payload_for(&message_id) {
                    self.enqueue_offline(payload);
                }
            }
            return;
        }

        let payloads: Vec<SendPayload> = message_ids
            .iter()
            .filter_map(|id| self.payload_for(id))
            .collect();
        if payloads.is_empty() {
            return;
        }
        let report = self
            .dispatcher
            .send(payloads, DispatchOptions::default())
            .await;
        self.apply_report(report).await;
    }

    async fn apply_report(&mut self, report: DispatchReport) {
        for (message_id, outcome) in report.outcomes {
            match outcome {
                DispatchOutcome::Sent => {
                    match self
                        .store
                        .apply_status(&message_id, MessageStatus::Sent, self.clock.now())
                    {
                        Ok(Some(message)) => self.emit(ClientEvent::MessageUpdated(message)),
                        Ok(None) => {}
                        Err(e) => debug!("Post-send transition for {} rejected: {}", message_id, e),
                    }
                }
                DispatchOutcome::Failed(error) => {
                    self.handle_send_failure(&message_id, error).await
                }
                DispatchOutcome::NotAttempted => {
                    // Skipped by fail-fast: buffer for a later replay.
                    if let Some(payload) = self.payload_for(&message_id) {
                        self.enqueue_offline(payload);
                    }
                }
            }
        }
    }

    async fn handle_send_failure(&mut self, message_id: &str, error: SendError) {
        if error.is_fatal() {
            self.connection.fail_fatal(&error.to_string()).await;
            self.emit(ClientEvent::SessionError(error.to_string()));
            // This can be reached from within a replay, so the call back
            // into the connection-change path must be boxed to keep the
            // future finite.
            Box::pin(self.after_connection_change()).await;
            return;
        }

        if !error.is_retryable() {
            // Validation: terminal immediately, no retry attempt consumed.
            match self
                .store
                .mark_failed(message_id, self.clock.now(), error.to_string())
            {
                Ok(Some(message)) => {
                    self.emit(ClientEvent::MessageUpdated(message));
                    if let Some(notification) = self.notifier.notify(
                        "send-invalid",
                        "Message rejected",
                        &error.to_string(),
                        NotificationPriority::Normal,
                    ) {
                        self.emit(ClientEvent::Notification(notification));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Validation failure for {} not recorded: {}", message_id, e),
            }
            return;
        }

        // Retryable: silent until the attempt budget is spent.
        let attempt_number = self
            .store
            .get(message_id)
            .map(|m| m.retry_count)
            .unwrap_or(0);
        let recipient = self
            .store
            .get(message_id)
            .map(|m| m.recipient.clone())
            .unwrap_or_default();
        let generation = self.connection.generation();
        match self.retries.schedule(
            &mut self.store,
            message_id,
            attempt_number,
            generation,
            error.retry_after(),
        ) {
            Ok(ScheduleOutcome::Scheduled(_)) => {
                if let Err(e) = self.store.record_attempt(message_id) {
                    warn!("Could not count retry attempt for {}: {}", message_id, e);
                }
            }
            Ok(ScheduleOutcome::Exhausted) => {
                if let Some(message) = self.store.get(message_id) {
                    self.emit(ClientEvent::MessageUpdated(message.clone()));
                }
                if let Some(notification) = self.notifier.notify(
                    "send-failed",
                    "Message could not be delivered",
                    &format!("Delivery to {} failed after repeated attempts", recipient),
                    NotificationPriority::Normal,
                ) {
                    self.emit(ClientEvent::Notification(notification));
                }
            }
            Err(e) => warn!("Retry scheduling for {} failed: {}", message_id, e),
        }
    }

    /// React to a connection state change: fan out the transition, surface
    /// connectivity notifications, and trigger offline replay on entering
    /// `Connected`.
    async fn after_connection_change(&mut self) {
        let state = self.connection.state();
        if state == self.last_connection_state {
            return;
        }
        let previous = self.last_connection_state;
        self.last_connection_state = state;
        info!("Connection state {:?} -> {:?}", previous, state);
        self.emit(ClientEvent::ConnectionChanged(state));

        match state {
            ConnectionState::Connected => {
                self.replay_offline().await;
            }
            ConnectionState::Reconnecting => {
                if let Some(notification) = self.notifier.notify(
                    "connectivity",
                    "Connection lost",
                    "Trying to reconnect...",
                    NotificationPriority::Normal,
                ) {
                    self.emit(ClientEvent::Notification(notification));
                }
            }
            ConnectionState::Error => {
                self.requeue_stranded_retries();
                let reason = self
                    .connection
                    .fatal_error()
                    .unwrap_or("connection error")
                    .to_string();
                if let Some(notification) = self.notifier.notify(
                    "session",
                    "Connection error",
                    &reason,
                    NotificationPriority::High,
                ) {
                    self.emit(ClientEvent::Notification(notification));
                }
            }
            ConnectionState::Disconnected => {
                self.requeue_stranded_retries();
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Retry timers die with their connection. The affected messages are
    /// still pending, so buffer their sends for replay instead of leaving
    /// them without a way back into the send path.
    fn requeue_stranded_retries(&mut self) {
        let cancelled = self.retries.cancel_stale(self.connection.generation());
        for task in cancelled {
            if self.store.get(&task.message_id).map(|m| m.status)
                != Some(MessageStatus::Pending)
            {
                continue;
            }
            if let Some(payload) = self.payload_for(&task.message_id) {
                self.enqueue_offline(payload);
            }
        }
    }

    /// Drain the offline queue in order. Stops and requeues the remainder
    /// if the connection drops mid-replay; the in-flight guard inside the
    /// queue prevents overlapping replays.
    async fn replay_offline(&mut self) {
        let Some(entries) = self.offline.begin_replay() else {
            return;
        };
        let mut iter = entries.into_iter();
        while let Some(entry) = iter.next() {
            if self.connection.state() != ConnectionState::Connected {
                let mut remaining = vec![entry];
                remaining.extend(iter);
                self.offline.requeue_front(remaining);
                break;
            }
            match entry.operation {
                QueuedOperation::Send(payload) => {
                    match self.store.get(&payload.message_id).map(|m| m.status) {
                        Some(MessageStatus::Pending) => {}
                        None => {
                            // Restored from a previous run's durable queue;
                            // recreate the record before sending.
                            let message = Message::with_id(
                                payload.message_id.clone(),
                                payload.recipient.clone(),
                                payload.content.clone(),
                                self.clock.now(),
                            );
                            if self.store.create(message.clone()).is_ok() {
                                self.emit(ClientEvent::MessageUpdated(message));
                            }
                        }
                        Some(_) => {
                            debug!(
                                "Skipping replay of #{}, message no longer pending",
                                entry.sequence_number
                            );
                            continue;
                        }
                    }
                    let report = self
                        .dispatcher
                        .send(vec![payload], DispatchOptions::default())
                        .await;
                    self.apply_report(report).await;
                }
            }
        }
        self.offline.end_replay();
    }

    fn payload_for(&self, message_id: &str) -> Option<SendPayload> {
        let message = self.store.get(message_id)?;
        Some(SendPayload {
            message_id: message.id.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
        })
    }

    fn enqueue_offline(&mut self, payload: SendPayload) {
        let message_id = payload.message_id.clone();
        let enqueued = self.offline.enqueue(QueuedOperation::Send(payload), false);
        debug!(
            "Message {} buffered offline as #{}",
            message_id, enqueued.sequence_number
        );
        if let Some(evicted) = enqueued.evicted {
            let QueuedOperation::Send(dropped) = &evicted.operation;
            match self.store.mark_failed(
                &dropped.message_id,
                self.clock.now(),
                "evicted from offline queue",
            ) {
                Ok(Some(message)) => self.emit(ClientEvent::MessageUpdated(message)),
                Ok(None) => {}
                Err(e) => debug!("Evicted message not failed: {}", e),
            }
            self.emit(ClientEvent::QueueOverflow {
                dropped_sequence: evicted.sequence_number,
            });
            if let Some(notification) = self.notifier.notify(
                "queue-overflow",
                "Offline queue full",
                "Oldest queued message was dropped",
                NotificationPriority::Normal,
            ) {
                self.emit(ClientEvent::Notification(notification));
            }
        }
    }

    fn emit(&mut self, event: ClientEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscriber queue full, dropping client event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
