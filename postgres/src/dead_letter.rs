//! `PostgreSQL`-backed dead-letter store for entries that exhausted the handler retry
//! budget. See `substrate_core::dead_letter` for the operator-driven lifecycle.

use std::future::Future;
use std::pin::Pin;

use sqlx::{PgPool, Row};
use substrate_core::dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterStatus};
use substrate_core::event::EventKind;
use substrate_core::ids::{EventId, TenantId};
use substrate_core::DeadLetterStore;

impl DeadLetterStatus {
    const fn as_str(self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Discarded => "discarded",
        }
    }

    fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "discarded" => Ok(DeadLetterStatus::Discarded),
            other => Err(DeadLetterError::Transient(format!(
                "invalid dead_letter_entries.status: {other}"
            ))),
        }
    }
}

/// `PostgreSQL` implementation of [`DeadLetterStore`].
///
/// Expects a `dead_letter_entries` table:
///
/// ```sql
/// CREATE TABLE dead_letter_entries (
///     event_id      UUID PRIMARY KEY,
///     tenant_id     UUID NOT NULL,
///     kind          TEXT NOT NULL,
///     payload       JSONB NOT NULL,
///     error_message TEXT NOT NULL,
///     retry_count   INTEGER NOT NULL,
///     parked_at     TIMESTAMPTZ NOT NULL,
///     status        TEXT NOT NULL DEFAULT 'pending'
/// );
/// CREATE INDEX ON dead_letter_entries (status);
/// ```
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, DeadLetterError> {
        let kind_str: String = row.get("kind");
        let kind = EventKind::parse(&kind_str)
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;
        let status_str: String = row.get("status");
        let status = DeadLetterStatus::parse(&status_str)?;

        let tenant_id = TenantId::from_uuid(row.get("tenant_id"))
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;

        Ok(DeadLetterEntry {
            event_id: EventId::from_uuid(row.get("event_id")),
            tenant_id,
            kind,
            payload: row.get("payload"),
            error_message: row.get("error_message"),
            retry_count: u32::try_from(row.get::<i32, _>("retry_count")).unwrap_or(0),
            parked_at: row.get("parked_at"),
            status,
        })
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn park(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let retry_count = i32::try_from(entry.retry_count).unwrap_or(i32::MAX);
            sqlx::query(
                r"
                INSERT INTO dead_letter_entries
                    (event_id, tenant_id, kind, payload, error_message, retry_count, parked_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (event_id) DO UPDATE SET
                    error_message = EXCLUDED.error_message,
                    retry_count = EXCLUDED.retry_count,
                    parked_at = EXCLUDED.parked_at
                ",
            )
            .bind(entry.event_id.as_uuid())
            .bind(entry.tenant_id.as_uuid())
            .bind(entry.kind.as_str())
            .bind(&entry.payload)
            .bind(&entry.error_message)
            .bind(retry_count)
            .bind(entry.parked_at)
            .bind(DeadLetterStatus::Pending.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;

            tracing::warn!(
                event_id = %entry.event_id,
                tenant_id = %entry.tenant_id,
                kind = %entry.kind,
                error = %entry.error_message,
                retry_count,
                "event parked to dead-letter store"
            );
            metrics::counter!("dead_letter_parked_total", "kind" => entry.kind.as_str())
                .increment(1);

            Ok(())
        })
    }

    fn list_pending(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT event_id, tenant_id, kind, payload, error_message, retry_count, parked_at, status
                FROM dead_letter_entries
                WHERE status = 'pending'
                ORDER BY parked_at DESC
                LIMIT $1
                ",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn mark_resolved(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE dead_letter_entries SET status = 'resolved' WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(DeadLetterError::NotFound(event_id));
            }
            tracing::info!(%event_id, "dead-letter entry resolved");
            metrics::counter!("dead_letter_resolved_total").increment(1);
            Ok(())
        })
    }

    fn mark_discarded(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE dead_letter_entries SET status = 'discarded' WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Transient(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(DeadLetterError::NotFound(event_id));
            }
            tracing::warn!(%event_id, "dead-letter entry discarded");
            metrics::counter!("dead_letter_discarded_total").increment(1);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()).expect("valid"), status);
        }
    }

    #[test]
    fn status_rejects_unknown() {
        assert!(DeadLetterStatus::parse("not-a-status").is_err());
    }
}
