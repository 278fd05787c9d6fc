// Error taxonomy for the delivery core.
// Message-level errors are carried in outcome values, never panics; only
// `Auth` halts the connection loop.

use crate::models::MessageStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed send or connection attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    /// Network timeout, 5xx-equivalent, or an explicit recoverable error
    /// from the transport. Routed to the retry scheduler.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Server told us to slow down. Retryable, but the server-specified
    /// delay replaces the default backoff curve.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Malformed recipient, missing template variable, etc. Terminal for
    /// the message and does not consume a retry attempt.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid or expired credential. Session-level: halts reconnection
    /// and requires caller intervention.
    #[error("authentication failure: {0}")]
    Auth(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::Transient(_) | SendError::RateLimited { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::Auth(_))
    }

    /// Server-mandated delay, if any, overriding the backoff curve.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Rejections from the message store's transition operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("unknown message id: {0}")]
    UnknownMessage(String),

    #[error("message id already exists: {0}")]
    DuplicateMessage(String),

    #[error("illegal status transition {from:?} -> {to:?} for message {id}")]
    IllegalTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// The event carries a timestamp older than the message's current
    /// `updated_at`: an out-of-order event, rejected without mutation.
    #[error("stale status event for message {id}: {event_at} precedes {current}")]
    StaleTimestamp {
        id: String,
        event_at: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(SendError::Transient("timeout".into()).is_retryable());
        assert!(SendError::RateLimited {
            retry_after: Duration::from_secs(2)
        }
        .is_retryable());
        assert!(!SendError::Validation("bad recipient".into()).is_retryable());
        assert!(!SendError::Auth("expired token".into()).is_retryable());
        assert!(SendError::Auth("expired token".into()).is_fatal());
        assert!(!SendError::Transient("timeout".into()).is_fatal());
    }

    #[test]
    fn rate_limit_carries_server_delay() {
        let err = SendError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(SendError::Transient("x".into()).retry_after(), None);
    }
}
