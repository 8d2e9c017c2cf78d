//! Outbox store abstraction: the relay's view of the transactional outbox.
//!
//! `Append` — the producer-facing half of the outbox — deliberately has no trait here.
//! Its contract ("fails to compile, not fails at runtime, if called without an open
//! transaction") is enforced by the concrete store type taking a borrowed transaction
//! handle as an ordinary parameter, not by an abstraction over it; see
//! `substrate_postgres::outbox::PostgresOutboxStore::append` and
//! `substrate_testing::mocks::InMemoryOutboxStore::append`. Reintroducing that behind a
//! trait (via an associated type or a second type parameter) would either break dyn
//! compatibility for the relay-facing half below, or let a caller satisfy the bound with a
//! type that isn't actually an open transaction. Only the relay's read/claim/mark
//! operations — which never need a caller-supplied transaction — are abstracted here.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::event::EventRecord;
use crate::ids::EventId;

/// Errors raised by an [`OutboxStore`] implementation.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// `Append` was attempted with no open transaction. Structurally unreachable through
    /// this trait (see the module docs); retained so the producer-facing concrete types
    /// share one error enum with the relay-facing trait.
    #[error("Append requires an open transaction")]
    TransactionRequired,

    /// `Append` was attempted with an `event_id` that already exists in the outbox.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(EventId),

    /// A row was asked to make a transition that is not valid from its current status,
    /// e.g. `MarkPublished` on a row that is not `publishing`.
    #[error("invalid status transition for event {event_id}: {reason}")]
    InvalidTransition {
        /// The row whose transition was rejected.
        event_id: EventId,
        /// Human-readable reason.
        reason: String,
    },

    /// The database or connection could not be reached; callers should treat this as
    /// transient and retry with backoff.
    #[error("transient outbox error: {0}")]
    Transient(String),
}

/// The relay's view of the outbox: read pending rows, claim one for publishing, and record
/// the outcome. See the module docs for why `Append` is not part of this trait.
///
/// # Dyn compatibility
///
/// Uses `Pin<Box<dyn Future>>` returns so the relay can hold this as `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Return up to `batch_size` rows with `status = pending`, ordered by `created_at`
    /// then `event_id` for a stable FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Transient`] if the store could not be reached.
    fn read_pending(
        &self,
        batch_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventRecord>, OutboxError>> + Send + '_>>;

    /// Atomically transition `event_id` from `pending` to `publishing`, taking an
    /// exclusive lock on the row for the duration of the relay's work. Returns `None` if
    /// the row is no longer pending — another relay instance won the race.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Transient`] if the store could not be reached.
    fn claim_for_publish(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>, OutboxError>> + Send + '_>>;

    /// Transition `event_id` from `publishing` to `published`, stamping `published_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] if the row is not currently `publishing`,
    /// or [`OutboxError::Transient`] if the store could not be reached.
    fn mark_published(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Record a publish failure for `event_id`. Increments `retry_count`; if it remains
    /// below `max_retries`, transitions back to `pending`, otherwise to `failed` and
    /// stamps `failed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] if the row is not currently `publishing`,
    /// or [`OutboxError::Transient`] if the store could not be reached.
    fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        max_retries: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Reclaim rows stuck in `publishing` for longer than `reclaim_timeout_secs`, reverting
    /// them to `pending` so they become publishable again. Called by the relay on startup
    /// and periodically, to recover from a relay instance that crashed mid-publish.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Transient`] if the store could not be reached.
    fn reclaim_stuck(
        &self,
        reclaim_timeout_secs: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;
}
