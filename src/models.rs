use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Payload of an outbound message: either free text or a reference to a
/// server-side template with variable substitutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Text(String),
    Template {
        template_id: String,
        variables: HashMap<String, String>,
    },
}

impl MessageContent {
    pub fn text(s: impl Into<String>) -> Self {
        MessageContent::Text(s.into())
    }
}

/// Delivery lifecycle of a message. Transitions only move forward along
/// the graph checked by `can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending = 0,   // Created, awaiting transmission
    Scheduled = 1, // Awaiting its dispatch time
    Sent = 2,      // Accepted by the server
    Delivered = 3, // Delivered to the recipient
    Read = 4,      // Read by the recipient
    Failed = 5,    // Terminally failed
    Cancelled = 6, // Cancelled by the caller before transmission
}

impl MessageStatus {
    /// True once no further transition is permitted. `Delivered` may still
    /// advance to `Read`, so it does not count as terminal here.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Read | MessageStatus::Failed | MessageStatus::Cancelled
        )
    }

    /// Whether the status graph permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Pending)
                | (Scheduled, Cancelled)
                | (Sent, Delivered)
                | (Delivered, Read)
        )
    }
}

/// A message as tracked by the store. Mutated only through the store's
/// transition operations; `updated_at` is monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub recipient: String,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Dispatch time for scheduled sends.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub error_details: Option<String>,
}

impl Message {
    /// Create a new pending message with a generated id.
    pub fn new(recipient: impl Into<String>, content: MessageContent, now: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), recipient, content, now)
    }

    /// Create a new pending message with a caller-assigned id.
    pub fn with_id(
        id: impl Into<String>,
        recipient: impl Into<String>,
        content: MessageContent,
        now: DateTime<Utc>,
    ) -> Self {
        Message {
            id: id.into(),
            recipient: recipient.into(),
            content,
            status: MessageStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            scheduled_for: None,
            error_details: None,
        }
    }
}

/// Filter for `MessageStore::list`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub recipient: Option<String>,
}

impl MessageFilter {
    pub fn with_status(status: MessageStatus) -> Self {
        MessageFilter {
            status: Some(status),
            recipient: None,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(status) = self.status {
            if message.status != status {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if &message.recipient != recipient {
                return false;
            }
        }
        true
    }
}
