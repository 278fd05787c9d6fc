// MessageStore: the single source of truth for every message the client
// knows about. All status changes flow through `apply_status`, which
// enforces the forward-only transition graph and rejects out-of-order
// events instead of mutating state.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{Message, MessageFilter, MessageStatus};

pub struct MessageStore {
    messages: HashMap<String, Message>,
    /// Terminal messages the caller has acknowledged; eligible for GC.
    acknowledged: HashSet<String>,
    terminal_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    pub fn new(terminal_ttl_secs: i64, clock: Arc<dyn Clock>) -> Self {
        MessageStore {
            messages: HashMap::new(),
            acknowledged: HashSet::new(),
            terminal_ttl: Duration::seconds(terminal_ttl_secs),
            clock,
        }
    }

    /// Register a new message record. The id must be unused.
    pub fn create(&mut self, message: Message) -> Result<(), StoreError> {
        if self.messages.contains_key(&message.id) {
            return Err(StoreError::DuplicateMessage(message.id));
        }
        debug!(
            "Tracking message {} to {} ({:?})",
            message.id, message.recipient, message.status
        );
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    /// Apply a status event. Returns `Ok(Some(message))` when state changed,
    /// `Ok(None)` for an idempotent re-apply of the current status with an
    /// equal-or-later timestamp, and an error for unknown ids, stale
    /// timestamps, or transitions the graph forbids.
    pub fn apply_status(
        &mut self,
        id: &str,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;

        if timestamp < message.updated_at {
            return Err(StoreError::StaleTimestamp {
                id: id.to_string(),
                event_at: timestamp,
                current: message.updated_at,
            });
        }

        if message.status == status {
            // Duplicate event; no state change, no emission.
            return Ok(None);
        }

        if !message.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: message.status,
                to: status,
            });
        }

        info!(
            "Message {} status {:?} -> {:?}",
            id, message.status, status
        );
        message.status = status;
        message.updated_at = timestamp;
        match status {
            MessageStatus::Sent => message.sent_at = Some(timestamp),
            MessageStatus::Delivered => message.delivered_at = Some(timestamp),
            MessageStatus::Failed => message.failed_at = Some(timestamp),
            _ => {}
        }
        Ok(Some(message.clone()))
    }

    /// Terminally fail a message, recording the error detail. Wraps
    /// `apply_status` so the transition graph still applies.
    pub fn mark_failed(
        &mut self,
        id: &str,
        timestamp: DateTime<Utc>,
        details: impl Into<String>,
    ) -> Result<Option<Message>, StoreError> {
        let changed = self.apply_status(id, MessageStatus::Failed, timestamp)?;
        if changed.is_some() {
            if let Some(message) = self.messages.get_mut(id) {
                message.error_details = Some(details.into());
                return Ok(Some(message.clone()));
            }
        }
        Ok(changed)
    }

    /// Count a consumed retry attempt. `updated_at` stays monotonic.
    pub fn record_attempt(&mut self, id: &str) -> Result<u32, StoreError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;
        message.retry_count += 1;
        let now = self.clock.now();
        if now > message.updated_at {
            message.updated_at = now;
        }
        Ok(message.retry_count)
    }

    /// Record the dispatch time for a scheduled send.
    pub fn set_schedule(
        &mut self,
        id: &str,
        dispatch_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;
        message.scheduled_for = Some(dispatch_at);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn list(&self, filter: &MessageFilter) -> Vec<&Message> {
        let mut matches: Vec<&Message> =
            self.messages.values().filter(|m| filter.matches(m)).collect();
        matches.sort_by_key(|m| m.created_at);
        matches
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Mark a terminal message as acknowledged by the caller, making it
    /// eligible for collection. Returns false for unknown or non-terminal
    /// messages.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.messages.get(id) {
            Some(message) if message.status.is_terminal() => {
                self.acknowledged.insert(id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop terminal messages that were acknowledged or whose TTL expired.
    /// Messages in non-terminal states are never collected. Returns the
    /// number of records removed.
    pub fn collect_garbage(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = self.terminal_ttl;
        let acknowledged = &self.acknowledged;
        let before = self.messages.len();
        self.messages.retain(|id, message| {
            if !message.status.is_terminal() {
                return true;
            }
            let expired = now - message.updated_at > ttl;
            !(acknowledged.contains(id) || expired)
        });
        let removed = before - self.messages.len();
        if removed > 0 {
            debug!("Garbage-collected {} terminal messages", removed);
            let live: HashSet<String> = self.messages.keys().cloned().collect();
            self.acknowledged.retain(|id| live.contains(id));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::MessageContent;
    use chrono::TimeZone;

    fn setup() -> (MessageStore, Arc<ManualClock>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = MessageStore::new(3600, clock.clone());
        (store, clock, start)
    }

    fn pending(id: &str, at: DateTime<Utc>) -> Message {
        Message::with_id(id, "alice@example.com", MessageContent::text("hi"), at)
    }

    #[test]
    fn forward_transitions_accepted() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();

        let t1 = t0 + Duration::seconds(1);
        let updated = store.apply_status("m1", MessageStatus::Sent, t1).unwrap();
        assert_eq!(updated.unwrap().sent_at, Some(t1));

        let t2 = t0 + Duration::seconds(2);
        store
            .apply_status("m1", MessageStatus::Delivered, t2)
            .unwrap();
        let t3 = t0 + Duration::seconds(3);
        store.apply_status("m1", MessageStatus::Read, t3).unwrap();
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn backward_and_skipping_transitions_rejected() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();

        // pending cannot jump straight to delivered
        let err = store
            .apply_status("m1", MessageStatus::Delivered, t0 + Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store
            .apply_status("m1", MessageStatus::Sent, t0 + Duration::seconds(2))
            .unwrap();
        // no way back to pending
        let err = store
            .apply_status("m1", MessageStatus::Pending, t0 + Duration::seconds(3))
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn apply_status_is_idempotent() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        let t1 = t0 + Duration::seconds(1);
        store.apply_status("m1", MessageStatus::Sent, t1).unwrap();

        // Same status, same timestamp: no-op, no emission
        assert_eq!(store.apply_status("m1", MessageStatus::Sent, t1).unwrap(), None);
        // Same status, later timestamp: still a no-op
        let later = t1 + Duration::seconds(5);
        assert_eq!(
            store.apply_status("m1", MessageStatus::Sent, later).unwrap(),
            None
        );
        assert_eq!(store.get("m1").unwrap().updated_at, t1);
    }

    #[test]
    fn stale_timestamp_rejected_without_mutation() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        let t1 = t0 + Duration::seconds(10);
        store.apply_status("m1", MessageStatus::Sent, t1).unwrap();

        let err = store
            .apply_status("m1", MessageStatus::Delivered, t0 + Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTimestamp { .. }));
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Sent);
        assert_eq!(store.get("m1").unwrap().updated_at, t1);
    }

    #[test]
    fn cancelled_only_from_pending_or_scheduled() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        store.create(pending("m2", t0)).unwrap();

        store
            .apply_status("m1", MessageStatus::Cancelled, t0 + Duration::seconds(1))
            .unwrap();
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Cancelled);

        store
            .apply_status("m2", MessageStatus::Sent, t0 + Duration::seconds(1))
            .unwrap();
        let err = store
            .apply_status("m2", MessageStatus::Cancelled, t0 + Duration::seconds(2))
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn scheduled_round_trip() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        store
            .apply_status("m1", MessageStatus::Scheduled, t0 + Duration::seconds(1))
            .unwrap();
        store
            .apply_status("m1", MessageStatus::Pending, t0 + Duration::seconds(60))
            .unwrap();
        store
            .apply_status("m1", MessageStatus::Sent, t0 + Duration::seconds(61))
            .unwrap();
    }

    #[test]
    fn gc_requires_ack_or_ttl() {
        let (mut store, clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        store.create(pending("m2", t0)).unwrap();
        store
            .mark_failed("m1", t0 + Duration::seconds(1), "boom")
            .unwrap();
        store
            .mark_failed("m2", t0 + Duration::seconds(1), "boom")
            .unwrap();

        // Terminal but neither acked nor expired: kept
        assert_eq!(store.collect_garbage(), 0);

        assert!(store.acknowledge("m1"));
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.get("m1").is_none());

        // TTL expiry collects the unacked one
        clock.advance(Duration::seconds(3700));
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.get("m2").is_none());
    }

    #[test]
    fn acknowledge_rejects_non_terminal() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m1", t0)).unwrap();
        assert!(!store.acknowledge("m1"));
        assert!(!store.acknowledge("nope"));
    }

    #[test]
    fn list_filters_and_orders_by_creation() {
        let (mut store, _clock, t0) = setup();
        store.create(pending("m2", t0 + Duration::seconds(2))).unwrap();
        store.create(pending("m1", t0)).unwrap();
        store
            .apply_status("m2", MessageStatus::Sent, t0 + Duration::seconds(3))
            .unwrap();

        let pending_only = store.list(&MessageFilter::with_status(MessageStatus::Pending));
        assert_eq!(pending_only.len(), 1);
        assert_eq!(pending_only[0].id, "m1");

        let all = store.list(&MessageFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "m1");
    }
}
