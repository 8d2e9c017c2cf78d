//! The relay: drains `pending` outbox rows into the stream transport.
//!
//! One logical loop, safely replicable for high availability — multiple relay instances
//! coordinate purely through `ClaimForPublish`'s row lock, with no leader election needed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use substrate_core::event::{EventKind, OutboxStatus};
use substrate_core::ids::{EventId, TenantId};
use substrate_core::outbox::{OutboxError, OutboxStore};
use substrate_core::transport::StreamTransport;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;

/// Errors surfaced at the relay's binary edge. Per-iteration failures are logged and
/// retried internally; this type exists for failures that should stop the loop entirely.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The outbox store failed in a way the relay cannot route around.
    #[error("outbox store error: {0}")]
    Outbox(#[from] OutboxError),
}

/// Runs the poll-claim-publish-mark loop until `shutdown` fires.
pub struct Relay {
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn StreamTransport>,
    batch_size: u32,
    poll_interval: Duration,
    max_retries: u32,
    reclaim_timeout: Duration,
    backoff: RetryPolicy,
}

impl Relay {
    /// Build a relay over `outbox` and `transport`, configured from `config`.
    #[must_use]
    pub fn new(outbox: Arc<dyn OutboxStore>, transport: Arc<dyn StreamTransport>, config: &Config) -> Self {
        let backoff = RetryPolicy::builder()
            .initial_delay(config.relay_poll_interval)
            .max_delay(Duration::from_secs(30))
            .multiplier(2.0)
            .max_retries(usize::try_from(config.relay_max_retries).unwrap_or(usize::MAX))
            .build();

        Self {
            outbox,
            transport,
            batch_size: config.outbox_batch_size,
            poll_interval: config.relay_poll_interval,
            max_retries: config.relay_max_retries,
            reclaim_timeout: config.relay_reclaim_timeout,
            backoff,
        }
    }

    /// Run the relay loop until `shutdown` receives a signal.
    ///
    /// On startup, and once per iteration, reclaims rows stuck in `publishing` longer than
    /// `relay_reclaim_timeout` before reading the next batch.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] only if the outbox itself becomes unusable; transport
    /// failures on individual rows are handled per-row via `MarkFailed` and do not stop the
    /// loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        self.reclaim_stuck().await?;

        let mut consecutive_failure_batches: usize = 0;

        loop {
            if *shutdown.borrow() {
                tracing::info!("relay received shutdown signal, exiting");
                return Ok(());
            }

            let started = Instant::now();
            let outcome = self.run_iteration().await?;
            RelayMetrics::record_batch(started.elapsed());

            if outcome.had_failures {
                consecutive_failure_batches += 1;
            } else {
                consecutive_failure_batches = 0;
            }

            if outcome.processed == 0 || outcome.had_failures {
                let delay = if outcome.had_failures {
                    self.backoff.delay_for_attempt(consecutive_failure_batches)
                } else {
                    self.poll_interval
                };
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn reclaim_stuck(&self) -> Result<(), RelayError> {
        let secs = i64::try_from(self.reclaim_timeout.as_secs()).unwrap_or(i64::MAX);
        let reclaimed = self.outbox.reclaim_stuck(secs).await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "relay reclaimed stuck publishing rows on startup");
        }
        Ok(())
    }

    /// One pass: read a batch of pending rows and publish each, in FIFO order.
    async fn run_iteration(&self) -> Result<IterationOutcome, RelayError> {
        let batch = self.outbox.read_pending(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(IterationOutcome::default());
        }

        tracing::debug!(batch_size = batch.len(), "relay read pending batch");
        let mut outcome = IterationOutcome::default();
        let mut stalled_partitions: HashSet<(TenantId, EventKind)> = HashSet::new();

        for record in &batch {
            let partition = (record.tenant_id, record.kind);
            if stalled_partitions.contains(&partition) {
                // A prior row in this (tenant, kind) stream already failed this iteration;
                // this row must not publish ahead of it.
                continue;
            }

            let Some(claimed) = self.outbox.claim_for_publish(record.event_id).await? else {
                // Another relay instance already took this row.
                continue;
            };
            debug_assert_eq!(claimed.status, OutboxStatus::Publishing);

            outcome.processed += 1;
            if !self.publish_one(claimed.event_id, &claimed).await? {
                outcome.had_failures = true;
                // Ordering contract: a failure on one entry stalls its own (tenant, kind)
                // stream but must not block the rest of the batch.
                stalled_partitions.insert(partition);
            }
        }

        Ok(outcome)
    }

    /// Publish one claimed record. Returns `Ok(true)` on success, `Ok(false)` if the row
    /// was routed to `MarkFailed` (retry or terminal).
    async fn publish_one(
        &self,
        event_id: EventId,
        record: &substrate_core::event::EventRecord,
    ) -> Result<bool, RelayError> {
        let wire = match record.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                // Can never succeed; route through MarkFailed with max_retries=0 so it
                // terminates as `failed` immediately instead of retrying forever.
                self.outbox.mark_failed(event_id, &e.to_string(), 0).await?;
                return Ok(false);
            }
        };

        match self.transport.publish(record.kind.stream_name(), &wire).await {
            Ok(_entry_id) => {
                self.outbox.mark_published(event_id).await?;
                Ok(true)
            }
            Err(other) => {
                self.outbox
                    .mark_failed(event_id, &other.to_string(), self.max_retries)
                    .await?;
                Ok(false)
            }
        }
    }
}

/// Summary of one [`Relay::run_iteration`] pass, used to drive the caller's sleep/backoff
/// decision.
#[derive(Default)]
struct IterationOutcome {
    processed: usize,
    had_failures: bool,
}
