// Courier: client-side message delivery synchronization core.
// Keeps outbound message state consistent with an unreliable transport:
// connection lifecycle, status reconciliation, retry/backoff, offline
// queuing and replay, and notification aggregation.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod sync;
pub mod utils;

// Re-export the main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{SendError, StoreError};
pub use models::{Message, MessageContent, MessageFilter, MessageStatus};
pub use sync::{ClientEvent, ConnectionState, Event, SyncClient, SyncHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_message_creation() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::new("alice@example.com", MessageContent::text("Hello!"), now);

        assert!(!msg.id.is_empty());
        assert_eq!(msg.recipient, "alice@example.com");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.created_at, now);
        assert_eq!(msg.updated_at, now);
        assert!(msg.sent_at.is_none());
        assert!(msg.error_details.is_none());
    }

    #[test]
    fn test_status_graph_is_forward_only() {
        use MessageStatus::*;

        // The happy path
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));

        // Failure and cancellation
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Scheduled.can_transition_to(Cancelled));

        // Scheduled sends come back to pending at dispatch time
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Pending));

        // No going backwards
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Failed.can_transition_to(Pending));

        // No skipping ahead
        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Pending.can_transition_to(Read));

        // Terminal states
        assert!(Read.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Delivered.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn test_template_content() {
        let content = MessageContent::Template {
            template_id: "welcome".to_string(),
            variables: [("name".to_string(), "Alice".to_string())]
                .into_iter()
                .collect(),
        };
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::new("alice@example.com", content.clone(), now);
        assert_eq!(msg.content, content);
    }

    #[test]
    fn test_message_filter() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::new("alice@example.com", MessageContent::text("hi"), now);

        assert!(MessageFilter::default().matches(&msg));
        assert!(MessageFilter::with_status(MessageStatus::Pending).matches(&msg));
        assert!(!MessageFilter::with_status(MessageStatus::Sent).matches(&msg));

        let by_recipient = MessageFilter {
            status: None,
            recipient: Some("bob@example.com".to_string()),
        };
        assert!(!by_recipient.matches(&msg));
    }
}
