//! The handler contract engines implement to react to events.
//!
//! A [`Handler`] is deliberately narrow: one operation, no lifecycle hooks, no access to
//! anything but the tenant, the decoded payload, and the transaction it must not commit or
//! roll back itself. It lives here rather than in `substrate-core` because its signature is
//! pinned to `sqlx::Transaction<'_, Postgres>` — the same concrete type
//! `PostgresLedger::record_processed` takes — and `substrate-core` has no `sqlx` dependency.

use std::future::Future;
use std::pin::Pin;

use sqlx::{Postgres, Transaction};
use substrate_core::event::Payload;
use substrate_core::ids::TenantId;
use thiserror::Error;

/// Errors a [`Handler`] may return.
///
/// A handler never commits or rolls back its own transaction; returning an error is the
/// only signal it gives the dispatcher that the transaction must abort.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not apply the event because of a transient condition (the
    /// dispatcher will retry by letting the entry fall back to the stream's pending list).
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// The event is malformed or otherwise can never be applied; retrying will not help.
    /// The dispatcher parks entries that fail this way to the dead-letter table sooner.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

/// A single reaction to one kind of event.
///
/// Implementations must not call `tx.commit()` or `tx.rollback()`; the dispatcher owns the
/// transaction's lifecycle and commits it only after every registered handler for the
/// entry's kind has returned `Ok`.
pub trait Handler: Send + Sync {
    /// Apply `payload` for `tenant_id`, using `tx` for any database effects.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the event cannot be applied.
    fn apply<'a>(
        &'a self,
        tenant_id: TenantId,
        payload: &'a Payload,
        tx: &'a mut Transaction<'_, Postgres>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}
