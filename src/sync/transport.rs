// Transport seam: the core consumes an abstract bidirectional event
// channel plus an abstract batch-send API. Real transports live outside
// this crate; `MockTransport` here backs the tests and the CLI harness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SendError;
use crate::models::{Message, MessageContent, MessageStatus};

/// Events arriving over the streaming connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A full inbound message record.
    MessageNew(Message),
    /// Status change for a previously sent message.
    MessageStatus {
        message_id: String,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },
    /// The transport's own view of connectivity.
    ConnectionStatus { connected: bool },
    /// Transport-level error; `recoverable: false` is session-fatal.
    Error {
        message: String,
        recoverable: bool,
        retry_after: Option<Duration>,
    },
}

/// One message creation payload in a batch-send request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    pub message_id: String,
    pub recipient: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<SendError>,
}

#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub batch_id: String,
    pub results: Vec<BatchItemResult>,
    pub success_count: usize,
    pub fail_count: usize,
    /// Server-communicated rate limit hint, requests per minute.
    pub rate_limit_per_minute: Option<u32>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the streaming connection; events are delivered into `events`
    /// until the connection closes. Errors classify per `SendError`.
    async fn open(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), SendError>;

    /// Close the streaming connection. Idempotent.
    async fn close(&self);

    /// Submit one batch of message creation payloads.
    async fn send_batch(&self, payloads: &[SendPayload]) -> Result<BatchResponse, SendError>;
}

struct MockInner {
    connected: bool,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    /// Number of upcoming `open` calls to fail.
    fail_connects: u32,
    connect_error: Option<SendError>,
    /// Scripted per-message failures, consumed front-first.
    scripted: HashMap<String, VecDeque<SendError>>,
    sent: Vec<SendPayload>,
    /// Sizes of the batches received, in order.
    batches: Vec<usize>,
    /// Emit a Delivered status event for each accepted payload.
    auto_ack: bool,
    rate_limit_hint: Option<u32>,
}

/// In-memory transport for tests and the harness binary.
pub struct MockTransport {
    inner: Mutex<MockInner>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Mutex::new(MockInner {
                connected: false,
                events_tx: None,
                fail_connects: 0,
                connect_error: None,
                scripted: HashMap::new(),
                sent: Vec::new(),
                batches: Vec::new(),
                auto_ack: false,
                rate_limit_hint: None,
            }),
        }
    }

    pub fn with_auto_ack() -> Self {
        let transport = Self::new();
        transport.inner.lock().unwrap().auto_ack = true;
        transport
    }

    /// Make the next `n` open() calls fail with `error`.
    pub fn fail_next_connects(&self, n: u32, error: SendError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_connects = n;
        inner.connect_error = Some(error);
    }

    /// Queue a failure for the next send of the given message id.
    pub fn script_send_failure(&self, message_id: &str, error: SendError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .scripted
            .entry(message_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_rate_limit_hint(&self, per_minute: u32) {
        self.inner.lock().unwrap().rate_limit_hint = Some(per_minute);
    }

    /// Payloads accepted so far, in send order.
    pub fn sent(&self) -> Vec<SendPayload> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Sizes of the batches received so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    /// Sever the connection without an event, as a silent network drop.
    pub fn sever(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.events_tx = None;
    }

    /// Push an event into the open connection's stream.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.inner.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), SendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            let err = inner
                .connect_error
                .clone()
                .unwrap_or_else(|| SendError::Transient("connection refused".to_string()));
            debug!("MockTransport refusing connection: {}", err);
            return Err(err);
        }
        inner.connected = true;
        inner.events_tx = Some(events);
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.events_tx = None;
    }

    async fn send_batch(&self, payloads: &[SendPayload]) -> Result<BatchResponse, SendError> {
        let (results, events_tx, auto_ack, rate_limit_hint) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                return Err(SendError::Transient("not connected".to_string()));
            }
            inner.batches.push(payloads.len());

            let mut results = Vec::with_capacity(payloads.len());
            for payload in payloads {
                let scripted = inner
                    .scripted
                    .get_mut(&payload.message_id)
                    .and_then(|queue| queue.pop_front());
                match scripted {
                    Some(error) => results.push(BatchItemResult {
                        id: payload.message_id.clone(),
                        success: false,
                        error: Some(error),
                    }),
                    None => {
                        inner.sent.push(payload.clone());
                        results.push(BatchItemResult {
                            id: payload.message_id.clone(),
                            success: true,
                            error: None,
                        });
                    }
                }
            }
            (
                results,
                inner.events_tx.clone(),
                inner.auto_ack,
                inner.rate_limit_hint,
            )
        };

        if auto_ack {
            if let Some(tx) = events_tx.clone() {
                let acked: Vec<String> = results
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.id.clone())
                    .collect();
                // Ack a beat after the send returns, as a server would, so
                // the ack timestamp postdates the local Sent transition.
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    for id in acked {
                        let _ = tx
                            .send(TransportEvent::MessageStatus {
                                message_id: id,
                                status: MessageStatus::Delivered,
                                timestamp: Utc::now(),
                            })
                            .await;
                    }
                });
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let fail_count = results.len() - success_count;
        Ok(BatchResponse {
            batch_id: Uuid::new_v4().to_string(),
            results,
            success_count,
            fail_count,
            rate_limit_per_minute: rate_limit_hint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        transport.open(tx).await.unwrap();
        transport.script_send_failure("m1", SendError::Transient("timeout".into()));

        let payload = SendPayload {
            message_id: "m1".to_string(),
            recipient: "alice".to_string(),
            content: MessageContent::text("hi"),
        };

        let first = transport.send_batch(&[payload.clone()]).await.unwrap();
        assert_eq!(first.fail_count, 1);
        let second = transport.send_batch(&[payload]).await.unwrap();
        assert_eq!(second.success_count, 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn events_compare_by_value() {
        let now = Utc::now();
        let message = Message::with_id("m1", "alice", MessageContent::text("hi"), now);
        assert_eq!(
            TransportEvent::MessageNew(message.clone()),
            TransportEvent::MessageNew(message)
        );
        assert_ne!(
            TransportEvent::ConnectionStatus { connected: true },
            TransportEvent::ConnectionStatus { connected: false }
        );
    }

    #[tokio::test]
    async fn send_without_connection_is_transient() {
        let transport = MockTransport::new();
        let result = transport.send_batch(&[]).await;
        assert!(matches!(result, Err(SendError::Transient(_))));
    }
}
