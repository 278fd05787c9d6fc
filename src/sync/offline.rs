// OfflineQueue: ordered buffer for operations accepted while disconnected,
// drained strictly in enqueue order on reconnection. Optionally persisted
// to a JSON file so a restart replays in the original order.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::Clock;
use crate::sync::transport::SendPayload;

/// An operation buffered for replay. Only sends are buffered today;
/// caller-initiated cancellation removes entries instead of queuing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueuedOperation {
    Send(SendPayload),
}

impl QueuedOperation {
    /// Message id this operation refers to.
    pub fn message_id(&self) -> &str {
        match self {
            QueuedOperation::Send(payload) => &payload.message_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub sequence_number: u64,
    pub operation: QueuedOperation,
    pub enqueued_at: DateTime<Utc>,
    /// Critical entries are never chosen for overflow eviction.
    pub critical: bool,
}

/// Result of an enqueue, including any entry evicted to make room.
#[derive(Debug)]
pub struct Enqueued {
    pub sequence_number: u64,
    pub evicted: Option<OfflineQueueEntry>,
}

pub struct OfflineQueue {
    entries: VecDeque<OfflineQueueEntry>,
    next_sequence: u64,
    capacity: usize,
    replaying: bool,
    persist_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl OfflineQueue {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        OfflineQueue {
            entries: VecDeque::new(),
            next_sequence: 1,
            capacity,
            replaying: false,
            persist_path: None,
            clock,
        }
    }

    /// Enable persistence, restoring any previously saved entries in
    /// sequence order.
    pub fn with_persistence(
        capacity: usize,
        clock: Arc<dyn Clock>,
        path: PathBuf,
    ) -> Result<Self> {
        let mut queue = Self::new(capacity, clock);
        if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("opening offline queue at {:?}", path))?;
            let mut saved: Vec<OfflineQueueEntry> = serde_json::from_reader(file)
                .with_context(|| format!("parsing offline queue at {:?}", path))?;
            saved.sort_by_key(|entry| entry.sequence_number);
            queue.next_sequence = saved
                .last()
                .map(|entry| entry.sequence_number + 1)
                .unwrap_or(1);
            info!("Restored {} offline queue entries from {:?}", saved.len(), path);
            queue.entries = saved.into();
        }
        queue.persist_path = Some(path);
        Ok(queue)
    }

    /// Buffer an operation. Always succeeds; past capacity the oldest
    /// non-critical entry is evicted and returned so the caller can report
    /// the overflow rather than dropping it silently.
    pub fn enqueue(&mut self, operation: QueuedOperation, critical: bool) -> Enqueued {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(OfflineQueueEntry {
            sequence_number,
            operation,
            enqueued_at: self.clock.now(),
            critical,
        });
        debug!("Queued offline operation #{}", sequence_number);

        let evicted = if self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .position(|entry| !entry.critical)
                // Every entry is critical: the oldest one goes regardless.
                .unwrap_or(0);
            let entry = self.entries.remove(victim);
            if let Some(entry) = &entry {
                warn!(
                    "Offline queue over capacity {}, evicting entry #{}",
                    self.capacity, entry.sequence_number
                );
            }
            entry
        } else {
            None
        };

        self.persist();
        Enqueued {
            sequence_number,
            evicted,
        }
    }

    /// Remove buffered operations for a message the caller cancelled.
    /// Returns how many entries were removed.
    pub fn cancel(&mut self, message_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.operation.message_id() != message_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Removed {} queued operations for message {}", removed, message_id);
            self.persist();
        }
        removed
    }

    /// Take the whole queue for replay, in order. Returns `None` while a
    /// replay is already in flight (the single in-flight guard) or when
    /// there is nothing to drain.
    pub fn begin_replay(&mut self) -> Option<Vec<OfflineQueueEntry>> {
        if self.replaying || self.entries.is_empty() {
            return None;
        }
        self.replaying = true;
        let drained: Vec<OfflineQueueEntry> = self.entries.drain(..).collect();
        info!("Replaying {} offline operations", drained.len());
        self.persist();
        Some(drained)
    }

    /// Put back entries that could not be replayed because the connection
    /// dropped mid-replay. Order is preserved; they drain first next time.
    pub fn requeue_front(&mut self, remaining: Vec<OfflineQueueEntry>) {
        if remaining.is_empty() {
            return;
        }
        warn!(
            "Connection dropped mid-replay, requeuing {} operations",
            remaining.len()
        );
        for entry in remaining.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.persist();
    }

    pub fn end_replay(&mut self) {
        self.replaying = false;
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            let entries: Vec<&OfflineQueueEntry> = self.entries.iter().collect();
            serde_json::to_writer_pretty(file, &entries)?;
            Ok(())
        })();
        if let Err(e) = result {
            // Persistence is best-effort; the in-memory queue stays correct.
            warn!("Failed to persist offline queue to {:?}: {}", path, e);
        }
    }
}
