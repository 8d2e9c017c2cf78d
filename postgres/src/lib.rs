//! `PostgreSQL`-backed implementations of the outbox store, the idempotency ledger, and
//! the dead-letter store from `substrate-core`.
//!
//! Uses `sqlx` with manually bound queries (not the compile-time-checked `query!` macro
//! family), so this crate builds without a live database connection — the same choice this
//! codebase makes everywhere it touches `sqlx` outside of its own integration test setup.
//!
//! # Example
//!
//! ```ignore
//! use substrate_postgres::{PostgresOutboxStore, PostgresLedger, PostgresDeadLetterStore};
//!
//! async fn example(pool: sqlx::PgPool) {
//!     let outbox = PostgresOutboxStore::new(pool.clone());
//!     let ledger = PostgresLedger::new(pool.clone());
//!     let dead_letters = PostgresDeadLetterStore::new(pool);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter;
pub mod ledger;
pub mod outbox;

pub use dead_letter::PostgresDeadLetterStore;
pub use ledger::PostgresLedger;
pub use outbox::PostgresOutboxStore;
