//! Dead-letter store: where entries land once the dispatcher exhausts the handler retry
//! budget for them.
//!
//! Distinct from the outbox's own `failed` status (which records *relay* publish
//! failures): this table records *handler* failures discovered downstream, after the
//! event was already published successfully. An operator drives the lifecycle manually;
//! nothing in this crate automatically reprocesses a parked entry.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::EventKind;
use crate::ids::{EventId, TenantId};

/// Errors raised by a [`DeadLetterStore`] implementation.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// The database or connection could not be reached.
    #[error("transient dead-letter store error: {0}")]
    Transient(String),

    /// No dead-letter entry exists for the given id.
    #[error("no dead-letter entry for event {0}")]
    NotFound(EventId),
}

/// Operator-driven lifecycle of a parked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Awaiting operator attention.
    Pending,
    /// An operator has manually reprocessed the event; no further action needed.
    Resolved,
    /// An operator has determined the event is permanently unactionable.
    Discarded,
}

/// One parked entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The event that was parked.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The event's kind.
    pub kind: EventKind,
    /// The raw payload, preserved verbatim for operator inspection/replay.
    pub payload: Value,
    /// The last handler error observed before parking.
    pub error_message: String,
    /// How many delivery attempts had been made when this entry was parked.
    pub retry_count: u32,
    /// When the entry was parked.
    pub parked_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: DeadLetterStatus,
}

/// Abstraction over the dead-letter table.
///
/// # Dyn compatibility
///
/// Uses `Pin<Box<dyn Future>>` returns so the dispatcher can hold this as
/// `Arc<dyn DeadLetterStore>`.
pub trait DeadLetterStore: Send + Sync {
    /// Park `entry`. Idempotent on `event_id`: parking the same event twice updates the
    /// existing row rather than erroring, since a redelivered poison event may be parked
    /// more than once before an operator resolves it.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Transient`] if the store could not be reached.
    fn park(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// List entries awaiting operator attention, most recently parked first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Transient`] if the store could not be reached.
    fn list_pending(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>;

    /// Mark `event_id` resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if no entry exists, or
    /// [`DeadLetterError::Transient`] if the store could not be reached.
    fn mark_resolved(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Mark `event_id` discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if no entry exists, or
    /// [`DeadLetterError::Transient`] if the store could not be reached.
    fn mark_discarded(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
