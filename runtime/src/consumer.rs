//! The consumer/dispatcher: drains one stream's consumer group and applies registered
//! handlers inside a single transaction per entry.
//!
//! State machine for an in-flight entry:
//!
//! ```text
//! received -> inspecting ledger -> { ack-duplicate | dispatching }
//! dispatching -> { commit-and-ack | abort-and-retry | abort-and-park }
//! ```
//!
//! `commit-and-ack` and `abort-and-park` are terminal for that entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use sqlx::PgPool;
use substrate_core::dead_letter::{DeadLetterEntry, DeadLetterStatus, DeadLetterStore};
use substrate_core::event::EventKind;
use substrate_core::ids::EventId;
use substrate_core::ledger::{IdempotencyLedger, LedgerError};
use substrate_core::transport::{StreamTransport, TransportError};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::handler::HandlerError;
use crate::metrics::DispatcherMetrics;
use crate::registry::HandlerRegistry;

/// A [`IdempotencyLedger`]'s `RecordProcessed` counterpart, exposed as a free function
/// pointer so this crate doesn't have to depend on `substrate-postgres` just to call a
/// method that — like `PostgresOutboxStore::append` — is concrete rather than part of the
/// dyn-compatible trait.
pub type RecordProcessedFn = Arc<
    dyn Fn(
            &mut sqlx::Transaction<'_, sqlx::Postgres>,
            EventId,
            substrate_core::ids::TenantId,
            EventKind,
            Option<serde_json::Value>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), LedgerError>> + Send + '_>,
        > + Send
        + Sync,
>;

/// Errors surfaced at the consumer's binary edge.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The transport could not be subscribed to.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The database pool could not begin a transaction.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Maximum in-process delivery attempts for one entry before it is parked to the
/// dead-letter table. Not persisted; a process restart resets the counter, an accepted
/// relaxation since the dead-letter threshold is a liveness bound, not a correctness one.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Drains `kind`'s stream for `registry`'s handlers.
pub struct Consumer {
    kind: EventKind,
    group: String,
    consumer_name: String,
    transport: Arc<dyn StreamTransport>,
    ledger: Arc<dyn IdempotencyLedger>,
    record_processed: RecordProcessedFn,
    dead_letters: Arc<dyn DeadLetterStore>,
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    block_timeout: Duration,
    handler_deadline: Duration,
}

impl Consumer {
    /// Build a consumer for `kind`, configured from `config`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: EventKind,
        consumer_name: impl Into<String>,
        transport: Arc<dyn StreamTransport>,
        ledger: Arc<dyn IdempotencyLedger>,
        record_processed: RecordProcessedFn,
        dead_letters: Arc<dyn DeadLetterStore>,
        pool: PgPool,
        registry: Arc<HandlerRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            kind,
            group: config.consumer_group_name.clone(),
            consumer_name: consumer_name.into(),
            transport,
            ledger,
            record_processed,
            dead_letters,
            pool,
            registry,
            block_timeout: config.consumer_block_timeout,
            handler_deadline: config.handler_deadline,
        }
    }

    /// Run the per-entry loop until `shutdown` fires. Finishes the in-flight entry (commit
    /// or abort) before exiting.
    ///
    /// Alongside new entries, reclaims stale pending ones (left unacked by a crashed or
    /// hung peer, or deliberately left unacked here for in-process retry) on a timer, so a
    /// `HandlerError::Transient` entry actually gets redelivered instead of only ever
    /// being retried across a process restart.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] if the stream cannot be subscribed to at all.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let stream_name = self.kind.stream_name();
        let mut entries = self
            .transport
            .subscribe(stream_name, &self.group, &self.consumer_name)
            .await?;

        // Recover anything left pending by a crashed peer before serving new entries.
        let stale = self
            .transport
            .claim_stale(stream_name, &self.group, &self.consumer_name, self.handler_deadline)
            .await?;
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), stream = stream_name, "reclaimed stale pending entries on startup");
        }

        let mut delivery_attempts: HashMap<String, u32> = HashMap::new();
        let mut reclaim_tick = tokio::time::interval(self.handler_deadline);
        reclaim_tick.tick().await; // first tick fires immediately; the startup claim above covers it

        for entry in stale {
            self.handle_entry(stream_name, &entry, &mut delivery_attempts).await;
        }

        loop {
            if *shutdown.borrow() {
                tracing::info!(stream = stream_name, "consumer received shutdown signal, exiting");
                return Ok(());
            }

            enum Event {
                Next(Option<Result<substrate_core::transport::StreamEntry, TransportError>>),
                Reclaim,
            }

            let event = tokio::select! {
                item = entries.next() => Event::Next(item),
                _ = reclaim_tick.tick() => Event::Reclaim,
                _ = shutdown.changed() => {
                    tracing::info!(stream = stream_name, "consumer received shutdown signal mid-wait, exiting");
                    return Ok(());
                }
            };

            let next = match event {
                Event::Next(item) => item,
                Event::Reclaim => {
                    match self
                        .transport
                        .claim_stale(stream_name, &self.group, &self.consumer_name, self.handler_deadline)
                        .await
                    {
                        Ok(reclaimed) => {
                            if !reclaimed.is_empty() {
                                tracing::warn!(
                                    count = reclaimed.len(),
                                    stream = stream_name,
                                    "reclaimed stale pending entries"
                                );
                            }
                            for entry in reclaimed {
                                self.handle_entry(stream_name, &entry, &mut delivery_attempts).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(stream = stream_name, error = %e, "failed to reclaim stale entries");
                        }
                    }
                    continue;
                }
            };

            let Some(result) = next else {
                tracing::debug!(stream = stream_name, "subscription stream ended");
                return Ok(());
            };

            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(stream = stream_name, error = %e, "error reading stream entry");
                    continue;
                }
            };

            self.handle_entry(stream_name, &entry, &mut delivery_attempts).await;
        }
    }

    async fn handle_entry(
        &self,
        stream_name: &str,
        entry: &substrate_core::transport::StreamEntry,
        delivery_attempts: &mut HashMap<String, u32>,
    ) {
        let event_id = entry.event.event_id;
        let started = Instant::now();

        match self.ledger.was_processed(event_id).await {
            Ok(true) => {
                self.ack(stream_name, &entry.entry_id).await;
                DispatcherMetrics::record_duplicate_ack();
                delivery_attempts.remove(&entry.entry_id);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%event_id, error = %e, "ledger lookup failed, leaving entry pending");
                return;
            }
        }

        let handlers = self.registry.handlers_for(entry.event.kind);
        if handlers.is_empty() {
            tracing::debug!(%event_id, kind = %entry.event.kind, "no handlers registered, acking unknown-to-us event");
            self.ack(stream_name, &entry.entry_id).await;
            delivery_attempts.remove(&entry.entry_id);
            return;
        }

        let payload = match entry.event.typed_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(%event_id, error = %e, "entry payload failed to decode, parking");
                self.park(stream_name, entry, &e.to_string()).await;
                delivery_attempts.remove(&entry.entry_id);
                return;
            }
        };

        let deadline = tokio::time::sleep(self.handler_deadline);
        let dispatch = self.dispatch(entry.event.tenant_id, &payload, handlers, event_id, entry.event.kind);

        let outcome = tokio::select! {
            result = dispatch => result,
            () = deadline => Err(HandlerError::Transient("handler deadline exceeded".to_string())),
        };

        match outcome {
            Ok(()) => {
                self.ack(stream_name, &entry.entry_id).await;
                DispatcherMetrics::record_commit(started.elapsed());
                delivery_attempts.remove(&entry.entry_id);
            }
            Err(HandlerError::Permanent(reason)) => {
                tracing::error!(%event_id, reason = %reason, "permanent handler failure, parking");
                self.park(stream_name, entry, &reason).await;
                delivery_attempts.remove(&entry.entry_id);
            }
            Err(HandlerError::Transient(reason)) => {
                let attempts = delivery_attempts.entry(entry.entry_id.clone()).or_insert(0);
                *attempts += 1;
                if *attempts >= MAX_DELIVERY_ATTEMPTS {
                    tracing::error!(%event_id, reason = %reason, attempts = *attempts, "exhausted delivery attempts, parking");
                    self.park(stream_name, entry, &reason).await;
                    delivery_attempts.remove(&entry.entry_id);
                } else {
                    tracing::warn!(%event_id, reason = %reason, attempts = *attempts, "transient handler failure, leaving unacked for redelivery");
                    DispatcherMetrics::record_retry();
                }
            }
        }
    }

    async fn dispatch(
        &self,
        tenant_id: substrate_core::ids::TenantId,
        payload: &substrate_core::event::Payload,
        handlers: &[Arc<dyn crate::handler::Handler>],
        event_id: EventId,
        kind: EventKind,
    ) -> Result<(), HandlerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        for handler in handlers {
            handler.apply(tenant_id, payload, &mut tx).await?;
        }

        match (self.record_processed)(&mut tx, event_id, tenant_id, kind, None).await {
            Ok(()) => {
                tx.commit().await.map_err(|e| HandlerError::Transient(e.to_string()))?;
                Ok(())
            }
            Err(LedgerError::AlreadyProcessed(_)) => {
                // Another consumer instance raced us to this event; our effects are
                // redundant. Abort and treat as success so the caller acks.
                tx.rollback().await.map_err(|e| HandlerError::Transient(e.to_string()))?;
                Ok(())
            }
            Err(LedgerError::Transient(reason)) => {
                tx.rollback().await.map_err(|e| HandlerError::Transient(e.to_string()))?;
                Err(HandlerError::Transient(reason))
            }
        }
    }

    async fn ack(&self, stream_name: &str, entry_id: &str) {
        if let Err(e) = self.transport.ack(stream_name, &self.group, entry_id).await {
            tracing::warn!(stream = stream_name, entry_id, error = %e, "ack failed");
        }
    }

    async fn park(&self, stream_name: &str, entry: &substrate_core::transport::StreamEntry, reason: &str) {
        let dead_letter = DeadLetterEntry {
            event_id: entry.event.event_id,
            tenant_id: entry.event.tenant_id,
            kind: entry.event.kind,
            payload: entry.event.payload.clone(),
            error_message: reason.to_string(),
            retry_count: MAX_DELIVERY_ATTEMPTS,
            parked_at: chrono::Utc::now(),
            status: DeadLetterStatus::Pending,
        };
        if let Err(e) = self.dead_letters.park(dead_letter).await {
            tracing::error!(event_id = %entry.event.event_id, error = %e, "failed to park entry to dead-letter table");
        }
        DispatcherMetrics::record_parked();
        self.ack(stream_name, &entry.entry_id).await;
    }
}
