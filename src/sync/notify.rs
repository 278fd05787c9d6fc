// NotificationAggregator: turns the firehose of status/connection/error
// events into a bounded, de-duplicated stream of user-facing
// notifications. Events sharing a group key within the debounce window
// collapse into one notification with an occurrence count.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::sync::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotificationPriority {
    Low,
    Normal,
    /// Bypasses debouncing; surfaced immediately.
    High,
}

/// Host-granted permission for system-level notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    Granted,
    Denied,
    Default,
}

/// Where a notification may be presented. Without system permission the
/// core degrades to in-app delivery; it never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    System,
    InApp,
}

/// Capability the host environment exposes for requesting notification
/// permission.
pub trait NotificationCapability: Send + Sync {
    fn permission(&self) -> NotificationPermission;
}

/// Absent capability: permission stays at its default.
pub struct NoCapability;

impl NotificationCapability for NoCapability {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Default
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub group_key: String,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub occurrence_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub delivery: DeliveryMode,
}

pub struct NotificationAggregator {
    /// Open debounce groups, keyed by group key.
    pending: HashMap<String, Notification>,
    /// Bounded queue of recently emitted notifications.
    recent: VecDeque<Notification>,
    capacity: usize,
    debounce_window: Duration,
    capability: Arc<dyn NotificationCapability>,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<Event>,
}

impl NotificationAggregator {
    pub fn new(
        capacity: usize,
        debounce_window_ms: u64,
        capability: Arc<dyn NotificationCapability>,
        clock: Arc<dyn Clock>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        NotificationAggregator {
            pending: HashMap::new(),
            recent: VecDeque::new(),
            capacity: capacity.max(1),
            debounce_window: Duration::milliseconds(debounce_window_ms as i64),
            capability,
            clock,
            events_tx,
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self.capability.permission() {
            NotificationPermission::Granted => DeliveryMode::System,
            NotificationPermission::Denied | NotificationPermission::Default => DeliveryMode::InApp,
        }
    }

    /// Record an event. High priority bypasses the debounce window and the
    /// notification is returned immediately; otherwise the event either
    /// opens a new group (arming a flush timer) or increments an open one,
    /// and `None` is returned until the group flushes.
    pub fn notify(
        &mut self,
        group_key: &str,
        title: &str,
        body: &str,
        priority: NotificationPriority,
    ) -> Option<Notification> {
        let now = self.clock.now();

        if priority == NotificationPriority::High {
            let notification = Notification {
                group_key: group_key.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                priority,
                occurrence_count: 1,
                first_seen_at: now,
                last_seen_at: now,
                delivery: self.delivery_mode(),
            };
            self.push_recent(notification.clone());
            return Some(notification);
        }

        if let Some(group) = self.pending.get_mut(group_key) {
            group.occurrence_count += 1;
            group.last_seen_at = now;
            // The latest representative wins
            group.body = body.to_string();
            debug!(
                "Grouped event into {} (count {})",
                group_key, group.occurrence_count
            );
            return None;
        }

        self.pending.insert(
            group_key.to_string(),
            Notification {
                group_key: group_key.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                priority,
                occurrence_count: 1,
                first_seen_at: now,
                last_seen_at: now,
                delivery: self.delivery_mode(),
            },
        );

        // Arm the flush timer for this group
        let events_tx = self.events_tx.clone();
        let window = std::time::Duration::from_millis(
            self.debounce_window.num_milliseconds().max(0) as u64,
        );
        let key = group_key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = events_tx
                .send(Event::FlushNotifications { group_key: key })
                .await;
        });
        None
    }

    /// Close a debounce group, emitting its aggregated notification.
    pub fn flush(&mut self, group_key: &str) -> Option<Notification> {
        let notification = self.pending.remove(group_key)?;
        self.push_recent(notification.clone());
        Some(notification)
    }

    /// Groups still within their debounce window.
    pub fn open_groups(&self) -> usize {
        self.pending.len()
    }

    /// Recently emitted notifications, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Notification> {
        self.recent.iter()
    }

    fn push_recent(&mut self, notification: Notification) {
        self.recent.push_back(notification);
        while self.recent.len() > self.capacity {
            self.evict_one();
        }
    }

    /// Over capacity: drop the oldest entry of the lowest priority present.
    fn evict_one(&mut self) {
        for priority in [NotificationPriority::Low, NotificationPriority::Normal] {
            if let Some(index) = self.recent.iter().position(|n| n.priority == priority) {
                if let Some(dropped) = self.recent.remove(index) {
                    warn!(
                        "Notification queue full, dropping {:?} entry {}",
                        dropped.priority, dropped.group_key
                    );
                }
                return;
            }
        }
        self.recent.pop_front();
    }
}
