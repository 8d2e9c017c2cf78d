//! # Substrate Core
//!
//! Core traits and types for the transactional event delivery substrate: the pipeline
//! that carries business facts from a vertical's transactional database, through a
//! Redis Streams transport, to idempotent consumer handlers.
//!
//! ## Core concepts
//!
//! - [`event`]: event kinds, typed payloads, and the outbox row shape (`EventRecord`).
//! - [`outbox`]: the relay's view of the transactional outbox (read/claim/mark).
//! - [`transport`]: the append-only, consumer-grouped stream abstraction.
//! - [`ledger`]: the idempotency check used by the dispatcher.
//! - [`dead_letter`]: where entries land once handler retries are exhausted.
//! - [`ids`]: `TenantId` and `EventId`, the two identifiers threaded through everything.
//!
//! ## Architecture
//!
//! ```text
//! vertical tx ──Append──▶ outbox (pending) ──Relay──▶ transport stream ──Consumer──▶ handlers
//!                                                                           │
//!                                                                           ▼
//!                                                                     idempotency ledger
//! ```
//!
//! Each store abstraction here is deliberately narrow: `Append` and `RecordProcessed`,
//! which must commit inside a caller-supplied transaction, are concrete methods on the
//! backend-specific types in `substrate-postgres` rather than trait methods — see the
//! module docs on [`outbox`] and [`ledger`] for why.

pub use chrono::{DateTime, Utc};

pub mod dead_letter;
pub mod event;
pub mod ids;
pub mod ledger;
pub mod outbox;
pub mod transport;

pub use dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterStatus, DeadLetterStore};
pub use event::{EventError, EventKind, EventRecord, LineItem, OutboxStatus, Payload, WireEvent};
pub use ids::{EventId, ParseIdError, TenantId};
pub use ledger::{IdempotencyLedger, LedgerError};
pub use outbox::{OutboxError, OutboxStore};
pub use transport::{EntryStream, StreamEntry, StreamTransport, TransportError};
