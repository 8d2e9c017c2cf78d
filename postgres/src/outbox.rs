//! `PostgreSQL`-backed transactional outbox.
//!
//! [`PostgresOutboxStore::append`] is the producer-facing half and is a concrete, ordinary
//! method rather than a trait implementation: it takes `&mut Transaction<'_, Postgres>` by
//! value, so a caller with no open transaction cannot construct the argument at all. The
//! relay-facing half (read/claim/mark) implements [`OutboxStore`] and manages its own
//! connections out of a pool, since the relay never needs to share a transaction with the
//! producer.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use substrate_core::event::{EventRecord, OutboxStatus, Payload};
use substrate_core::ids::{EventId, TenantId};
use substrate_core::outbox::{OutboxError, OutboxStore};

/// `PostgreSQL` implementation of the outbox.
///
/// Expects an `event_outbox` table:
///
/// ```sql
/// CREATE TABLE event_outbox (
///     event_id      UUID PRIMARY KEY,
///     tenant_id     UUID NOT NULL,
///     kind          TEXT NOT NULL,
///     version       TEXT NOT NULL,
///     payload       JSONB NOT NULL,
///     status        TEXT NOT NULL DEFAULT 'pending',
///     retry_count   INTEGER NOT NULL DEFAULT 0,
///     error_message TEXT,
///     created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
///     claimed_at    TIMESTAMPTZ,
///     published_at  TIMESTAMPTZ,
///     failed_at     TIMESTAMPTZ
/// );
/// CREATE INDEX event_outbox_pending_idx ON event_outbox (created_at, event_id)
///     WHERE status = 'pending';
/// CREATE INDEX event_outbox_tenant_status_idx ON event_outbox (tenant_id, status);
/// ```
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stage `record` inside `tx`. `tx` must be the same transaction performing the
    /// business write this event describes; the row becomes visible to the relay only
    /// once `tx` commits.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DuplicateEventId`] if `record.event_id` already exists in the
    /// outbox, or [`OutboxError::Transient`] if the insert otherwise fails.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> Result<(), OutboxError> {
        let payload = serde_json::to_value(&record.payload)
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

        let result = sqlx::query(
            r"
            INSERT INTO event_outbox
                (event_id, tenant_id, kind, version, payload, status, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6)
            ",
        )
        .bind(record.event_id.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(record.kind.as_str())
        .bind(&record.version)
        .bind(&payload)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(
                    event_id = %record.event_id,
                    tenant_id = %record.tenant_id,
                    kind = %record.kind,
                    "event appended to outbox"
                );
                metrics::counter!("outbox_appended_total", "kind" => record.kind.as_str())
                    .increment(1);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(OutboxError::DuplicateEventId(record.event_id))
            }
            Err(e) => Err(OutboxError::Transient(e.to_string())),
        }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<EventRecord, OutboxError> {
        let kind_str: String = row.get("kind");
        let kind = substrate_core::event::EventKind::parse(&kind_str)
            .map_err(|e| OutboxError::Transient(e.to_string()))?;
        let status_str: String = row.get("status");
        let status =
            OutboxStatus::parse(&status_str).map_err(|e| OutboxError::Transient(e.to_string()))?;
        let payload_json: serde_json::Value = row.get("payload");
        let payload: Payload =
            serde_json::from_value(payload_json).map_err(|e| OutboxError::Transient(e.to_string()))?;
        let retry_count: i32 = row.get("retry_count");

        let tenant_id = TenantId::from_uuid(row.get("tenant_id"))
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

        Ok(EventRecord {
            event_id: EventId::from_uuid(row.get("event_id")),
            tenant_id,
            kind,
            version: row.get("version"),
            payload,
            status,
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            published_at: row.get("published_at"),
            failed_at: row.get("failed_at"),
        })
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn read_pending(
        &self,
        batch_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT event_id, tenant_id, kind, version, payload, status,
                       retry_count, error_message, created_at, published_at, failed_at
                FROM event_outbox
                WHERE status = 'pending'
                ORDER BY created_at ASC, event_id ASC
                LIMIT $1
                ",
            )
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            rows.iter().map(Self::row_to_record).collect()
        })
    }

    fn claim_for_publish(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| OutboxError::Transient(e.to_string()))?;

            let row = sqlx::query(
                r"
                SELECT event_id, tenant_id, kind, version, payload, status,
                       retry_count, error_message, created_at, published_at, failed_at
                FROM event_outbox
                WHERE event_id = $1 AND status = 'pending'
                FOR UPDATE
                ",
            )
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            let Some(row) = row else {
                tx.rollback().await.map_err(|e| OutboxError::Transient(e.to_string()))?;
                return Ok(None);
            };

            let record = Self::row_to_record(&row)?;

            sqlx::query(
                "UPDATE event_outbox SET status = 'publishing', claimed_at = $2 WHERE event_id = $1",
            )
            .bind(event_id.as_uuid())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            tx.commit().await.map_err(|e| OutboxError::Transient(e.to_string()))?;

            Ok(Some(EventRecord {
                status: OutboxStatus::Publishing,
                ..record
            }))
        })
    }

    fn mark_published(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE event_outbox
                SET status = 'published', published_at = $2
                WHERE event_id = $1 AND status = 'publishing'
                ",
            )
            .bind(event_id.as_uuid())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row is not in publishing status".to_string(),
                });
            }

            tracing::debug!(%event_id, "outbox row marked published");
            metrics::counter!("outbox_published_total").increment(1);
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        max_retries: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let error = error.to_string();
        Box::pin(async move {
            let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);
            let row = sqlx::query(
                r"
                UPDATE event_outbox
                SET retry_count = retry_count + 1,
                    error_message = $2,
                    status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END,
                    failed_at = CASE WHEN retry_count + 1 >= $3 THEN $4 ELSE failed_at END
                WHERE event_id = $1 AND status = 'publishing'
                RETURNING status
                ",
            )
            .bind(event_id.as_uuid())
            .bind(&error)
            .bind(max_retries)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            let Some(row) = row else {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row is not in publishing status".to_string(),
                });
            };

            let status: String = row.get("status");
            if status == "failed" {
                tracing::error!(%event_id, error = %error, "outbox row exhausted retries, marked failed");
                metrics::counter!("outbox_failed_total").increment(1);
            } else {
                tracing::warn!(%event_id, error = %error, "outbox publish failed, retrying");
                metrics::counter!("outbox_retry_total").increment(1);
            }
            Ok(())
        })
    }

    fn reclaim_stuck(
        &self,
        reclaim_timeout_secs: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE event_outbox
                SET status = 'pending', claimed_at = NULL
                WHERE status = 'publishing'
                  AND claimed_at < NOW() - make_interval(secs => $1)
                ",
            )
            .bind(reclaim_timeout_secs as f64)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Transient(e.to_string()))?;

            let reclaimed = result.rows_affected();
            if reclaimed > 0 {
                tracing::warn!(reclaimed, "reclaimed stuck publishing rows");
                metrics::counter!("outbox_reclaimed_total").increment(reclaimed);
            }
            Ok(reclaimed)
        })
    }
}
