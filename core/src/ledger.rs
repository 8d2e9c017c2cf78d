//! Idempotency ledger abstraction: the record of which events have already been fully
//! processed by the consumer.
//!
//! As with the outbox's `Append`, `RecordProcessed` must commit inside the same
//! transaction as the handler's own business effects, so it is a concrete method on the
//! backend-specific store (taking a borrowed transaction) rather than a trait method here.
//! Only the read-only duplicate check is abstracted, since the dispatcher needs it before
//! it has opened a handler transaction at all.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::ids::EventId;

/// Errors raised by an [`IdempotencyLedger`] implementation.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// `RecordProcessed` was attempted with an `event_id` already present in the ledger.
    /// The dispatcher treats this as "another consumer already finished this event" and
    /// acks without retrying.
    #[error("event already processed: {0}")]
    AlreadyProcessed(EventId),

    /// The database or connection could not be reached; callers should treat this as
    /// transient.
    #[error("transient ledger error: {0}")]
    Transient(String),
}

/// Read-only half of the idempotency ledger, used by the dispatcher to short-circuit
/// redelivered entries before opening a handler transaction.
///
/// # Dyn compatibility
///
/// Uses a `Pin<Box<dyn Future>>` return so the dispatcher can hold this as
/// `Arc<dyn IdempotencyLedger>`.
pub trait IdempotencyLedger: Send + Sync {
    /// Has `event_id` already been fully processed?
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Transient`] if the store could not be reached.
    fn was_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;
}
