// RetryScheduler: one outstanding timer per message, replaced on
// re-schedule, cancelled on success or disconnect. The backoff curve is a
// pure function of the attempt number and an injected rng so tests can
// assert exact bounds.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::sync::store::MessageStore;
use crate::sync::Event;

/// A scheduled retry for one message. At most one exists per message id.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTask {
    pub message_id: String,
    pub attempt_number: u32,
    pub next_attempt_at: DateTime<Utc>,
    /// Connection generation the task was scheduled under; a stale
    /// generation's firing is discarded.
    pub generation: u64,
}

#[derive(Debug, PartialEq)]
pub enum ScheduleOutcome {
    /// A task was created (or replaced) and a timer armed.
    Scheduled(RetryTask),
    /// The attempt budget is spent; the message was terminally failed.
    Exhausted,
}

/// Capped exponential backoff with additive jitter:
/// `min(cap, base * 2^attempt) + jitter`, jitter uniform in `[0, base]`.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64, rng: &mut impl Rng) -> Duration {
    let exp = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(cap_ms);
    let jitter = rng.gen_range(0..=base_ms.max(1));
    Duration::from_millis(exp + jitter)
}

pub struct RetryScheduler {
    tasks: HashMap<String, RetryTask>,
    base_ms: u64,
    cap_ms: u64,
    max_attempts: u32,
    rng: StdRng,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<Event>,
}

impl RetryScheduler {
    pub fn new(
        base_ms: u64,
        cap_ms: u64,
        max_attempts: u32,
        rng: StdRng,
        clock: Arc<dyn Clock>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        RetryScheduler {
            tasks: HashMap::new(),
            base_ms,
            cap_ms,
            max_attempts,
            rng,
            clock,
            events_tx,
        }
    }

    /// Schedule a retry for `message_id` after its `attempt_number`-th
    /// failure (zero-based). Past the attempt budget the message is marked
    /// failed in the store instead and nothing is armed. A server-mandated
    /// delay (rate limiting) replaces the backoff curve when given.
    pub fn schedule(
        &mut self,
        store: &mut MessageStore,
        message_id: &str,
        attempt_number: u32,
        generation: u64,
        override_delay: Option<Duration>,
    ) -> Result<ScheduleOutcome, StoreError> {
        if attempt_number >= self.max_attempts {
            info!(
                "Message {} exhausted {} attempts, failing terminally",
                message_id, self.max_attempts
            );
            store.mark_failed(
                message_id,
                self.clock.now(),
                format!("gave up after {} attempts", self.max_attempts),
            )?;
            self.tasks.remove(message_id);
            return Ok(ScheduleOutcome::Exhausted);
        }

        let delay = override_delay
            .unwrap_or_else(|| backoff_delay(attempt_number, self.base_ms, self.cap_ms, &mut self.rng));
        let task = RetryTask {
            message_id: message_id.to_string(),
            attempt_number,
            next_attempt_at: self.clock.now()
                + chrono::Duration::milliseconds(delay.as_millis() as i64),
            generation,
        };
        debug!(
            "Scheduling retry {} for message {} in {:?}",
            attempt_number, message_id, delay
        );

        // A newer schedule replaces any outstanding timer for the message;
        // the stale timer's firing is rejected by take_due.
        if self.tasks.insert(message_id.to_string(), task.clone()).is_some() {
            warn!("Replaced outstanding retry timer for message {}", message_id);
        }

        let events_tx = self.events_tx.clone();
        let fired = Event::RetryDue {
            message_id: message_id.to_string(),
            attempt_number,
            generation,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(fired).await;
        });

        Ok(ScheduleOutcome::Scheduled(task))
    }

    /// Claim a fired timer. Returns true only when the firing matches the
    /// live task for the message and the current connection generation;
    /// each task fires at most once.
    pub fn take_due(&mut self, message_id: &str, attempt_number: u32, generation: u64) -> bool {
        match self.tasks.get(message_id) {
            Some(task)
                if task.attempt_number == attempt_number && task.generation == generation =>
            {
                self.tasks.remove(message_id);
                true
            }
            Some(_) => {
                debug!(
                    "Discarding stale retry firing for message {} (attempt {})",
                    message_id, attempt_number
                );
                false
            }
            None => false,
        }
    }

    /// Drop any pending timer for the message. No side effects.
    pub fn cancel(&mut self, message_id: &str) {
        if self.tasks.remove(message_id).is_some() {
            debug!("Cancelled retry timer for message {}", message_id);
        }
    }

    /// Drop every task scheduled under a generation older than `current`.
    /// Used on disconnect so stale timers cannot fire against a newer
    /// connection. Returns the cancelled tasks so their sends can be
    /// re-buffered instead of stranded.
    pub fn cancel_stale(&mut self, current_generation: u64) -> Vec<RetryTask> {
        let stale: Vec<String> = self
            .tasks
            .values()
            .filter(|task| task.generation < current_generation)
            .map(|task| task.message_id.clone())
            .collect();
        let cancelled: Vec<RetryTask> = stale
            .iter()
            .filter_map(|id| self.tasks.remove(id))
            .collect();
        if !cancelled.is_empty() {
            debug!(
                "Cancelled {} retry timers from prior connections",
                cancelled.len()
            );
        }
        cancelled
    }

    pub fn task(&self, message_id: &str) -> Option<&RetryTask> {
        self.tasks.get(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }
}
