//! `PostgreSQL`-backed idempotency ledger.
//!
//! [`PostgresLedger::record_processed`] is a concrete method taking `&mut Transaction<'_,
//! Postgres>` by value, the same pattern used by `PostgresOutboxStore::append`: it must
//! commit inside the same transaction as the handler's own business effects, so it cannot
//! be a method on the dyn-compatible [`IdempotencyLedger`] trait used for the read-only
//! duplicate check.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use substrate_core::event::EventKind;
use substrate_core::ids::{EventId, TenantId};
use substrate_core::ledger::{IdempotencyLedger, LedgerError};

/// `PostgreSQL` implementation of the idempotency ledger.
///
/// Expects a `processed_events` table:
///
/// ```sql
/// CREATE TABLE processed_events (
///     event_id     UUID PRIMARY KEY,
///     tenant_id    UUID NOT NULL,
///     kind         TEXT NOT NULL,
///     processed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     result       JSONB
/// );
/// CREATE INDEX processed_events_tenant_idx ON processed_events (tenant_id, processed_at);
/// ```
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record that `event_id` has been fully processed, inside `tx`. `tx` must be the same
    /// transaction that commits the handlers' business effects.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyProcessed`] if `event_id` is already present — the
    /// dispatcher treats this as "another consumer raced us and already finished this
    /// event" and aborts `tx`, acking without re-applying effects.
    pub async fn record_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        tenant_id: TenantId,
        kind: EventKind,
        result: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let outcome = sqlx::query(
            r"
            INSERT INTO processed_events (event_id, tenant_id, kind, processed_at, result)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(event_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(kind.as_str())
        .bind(Utc::now())
        .bind(result)
        .execute(&mut **tx)
        .await;

        match outcome {
            Ok(_) => {
                metrics::counter!("ledger_recorded_total", "kind" => kind.as_str()).increment(1);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                metrics::counter!("ledger_duplicate_detected_total").increment(1);
                Err(LedgerError::AlreadyProcessed(event_id))
            }
            Err(e) => Err(LedgerError::Transient(e.to_string())),
        }
    }

    /// The timestamp `event_id` was processed at, if it was.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Transient`] if the query fails.
    pub async fn processed_at(
        &self,
        event_id: EventId,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let row = sqlx::query("SELECT processed_at FROM processed_events WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::Transient(e.to_string()))?;

        Ok(row.map(|r| r.get("processed_at")))
    }
}

impl IdempotencyLedger for PostgresLedger {
    fn was_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT 1 FROM processed_events WHERE event_id = $1")
                .bind(event_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| LedgerError::Transient(e.to_string()))?;
            Ok(row.is_some())
        })
    }
}
