// BatchDispatcher: splits outbound messages into bounded batches, paces
// them against the server's rate limit, and reports a per-message outcome.
// One failing message never sinks its batch unless fail-fast is requested.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SendError;
use crate::sync::transport::{SendPayload, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Skip remaining batches after the first failure; the skipped
    /// messages are reported as `NotAttempted`.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent,
    Failed(SendError),
    NotAttempted,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// One outcome per input message, in input order.
    pub outcomes: Vec<(String, DispatchOutcome)>,
    pub success_count: usize,
    pub fail_count: usize,
}

impl DispatchReport {
    pub fn outcome_for(&self, message_id: &str) -> Option<&DispatchOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == message_id)
            .map(|(_, outcome)| outcome)
    }
}

pub struct BatchDispatcher {
    transport: Arc<dyn Transport>,
    batch_size: usize,
    rate_limit_per_minute: u32,
}

impl BatchDispatcher {
    pub fn new(transport: Arc<dyn Transport>, batch_size: usize, rate_limit_per_minute: u32) -> Self {
        BatchDispatcher {
            transport,
            batch_size: batch_size.max(1),
            rate_limit_per_minute: rate_limit_per_minute.max(1),
        }
    }

    /// Minimum delay between consecutive batches under the current rate
    /// limit.
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.rate_limit_per_minute))
    }

    /// Adopt a server-communicated rate limit.
    pub fn set_rate_limit(&mut self, per_minute: u32) {
        if per_minute > 0 && per_minute != self.rate_limit_per_minute {
            info!("Adopting server rate limit of {} req/min", per_minute);
            self.rate_limit_per_minute = per_minute;
        }
    }

    /// Send `payloads` in batches of at most `batch_size`, sequentially,
    /// honoring the inter-batch delay. Every input message gets exactly one
    /// outcome.
    pub async fn send(
        &mut self,
        payloads: Vec<SendPayload>,
        options: DispatchOptions,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if payloads.is_empty() {
            return report;
        }

        let batches: Vec<&[SendPayload]> = payloads.chunks(self.batch_size).collect();
        debug!(
            "Dispatching {} messages in {} batches of up to {}",
            payloads.len(),
            batches.len(),
            self.batch_size
        );

        let mut abort = false;
        for (index, batch) in batches.iter().enumerate() {
            if abort {
                for payload in batch.iter() {
                    report
                        .outcomes
                        .push((payload.message_id.clone(), DispatchOutcome::NotAttempted));
                }
                continue;
            }

            if index > 0 {
                tokio::time::sleep(self.inter_batch_delay()).await;
            }

            match self.transport.send_batch(batch).await {
                Ok(response) => {
                    if let Some(limit) = response.rate_limit_per_minute {
                        self.set_rate_limit(limit);
                    }
                    let mut batch_failed = false;
                    for item in response.results {
                        if item.success {
                            report.outcomes.push((item.id, DispatchOutcome::Sent));
                        } else {
                            batch_failed = true;
                            let error = item.error.unwrap_or_else(|| {
                                SendError::Transient("send rejected".to_string())
                            });
                            report
                                .outcomes
                                .push((item.id, DispatchOutcome::Failed(error)));
                        }
                    }
                    if batch_failed && options.fail_fast {
                        warn!("Batch {} had failures, fail-fast skips the rest", index + 1);
                        abort = true;
                    }
                }
                Err(error) => {
                    warn!("Batch {} failed wholesale: {}", index + 1, error);
                    for payload in batch.iter() {
                        report.outcomes.push((
                            payload.message_id.clone(),
                            DispatchOutcome::Failed(error.clone()),
                        ));
                    }
                    if options.fail_fast {
                        abort = true;
                    }
                }
            }
        }

        report.success_count = report
            .outcomes
            .iter()
            .filter(|(_, o)| *o == DispatchOutcome::Sent)
            .count();
        report.fail_count = report.outcomes.len() - report.success_count;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageContent;
    use crate::sync::transport::MockTransport;
    use tokio::sync::mpsc;

    fn payloads(n: usize) -> Vec<SendPayload> {
        (0..n)
            .map(|i| SendPayload {
                message_id: format!("m{}", i),
                recipient: "alice@example.com".to_string(),
                content: MessageContent::text("hi"),
            })
            .collect()
    }

    async fn connected_mock() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        let (tx, _rx) = mpsc::channel(8);
        transport.open(tx).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn splits_into_bounded_batches_with_delay() {
        let transport = connected_mock().await;
        // 6000 req/min keeps the test fast: 10ms between batches
        let mut dispatcher = BatchDispatcher::new(transport.clone(), 50, 6000);

        let started = tokio::time::Instant::now();
        let report = dispatcher.send(payloads(120), DispatchOptions::default()).await;

        assert_eq!(transport.batch_sizes(), vec![50, 50, 20]);
        assert_eq!(report.outcomes.len(), 120);
        assert_eq!(report.success_count, 120);
        // Two inter-batch gaps of 10ms each
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn partial_failure_does_not_fail_the_batch() {
        let transport = connected_mock().await;
        transport.script_send_failure("m1", SendError::Validation("bad recipient".into()));
        let mut dispatcher = BatchDispatcher::new(transport, 50, 6000);

        let report = dispatcher.send(payloads(3), DispatchOptions::default()).await;
        assert_eq!(report.success_count, 2);
        assert_eq!(report.fail_count, 1);
        assert!(matches!(
            report.outcome_for("m1"),
            Some(DispatchOutcome::Failed(SendError::Validation(_)))
        ));
        assert_eq!(report.outcome_for("m0"), Some(&DispatchOutcome::Sent));
    }

    #[tokio::test]
    async fn fail_fast_skips_remaining_batches() {
        let transport = connected_mock().await;
        transport.script_send_failure("m0", SendError::Transient("timeout".into()));
        let mut dispatcher = BatchDispatcher::new(transport.clone(), 2, 6000);

        let report = dispatcher
            .send(payloads(5), DispatchOptions { fail_fast: true })
            .await;

        // First batch attempted; the remaining two batches skipped
        assert_eq!(transport.batch_sizes(), vec![2]);
        let not_attempted = report
            .outcomes
            .iter()
            .filter(|(_, o)| *o == DispatchOutcome::NotAttempted)
            .count();
        assert_eq!(not_attempted, 3);
        assert_eq!(report.outcomes.len(), 5);
    }

    #[tokio::test]
    async fn server_rate_limit_hint_is_adopted() {
        let transport = connected_mock().await;
        transport.set_rate_limit_hint(120);
        let mut dispatcher = BatchDispatcher::new(transport, 50, 60);
        assert_eq!(dispatcher.inter_batch_delay(), Duration::from_millis(1000));

        dispatcher.send(payloads(1), DispatchOptions::default()).await;
        assert_eq!(dispatcher.inter_batch_delay(), Duration::from_millis(500));
    }
}
