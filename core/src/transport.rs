//! Stream transport abstraction: a set of named append-only logs with consumer-group
//! semantics, one log per [`EventKind`](crate::event::EventKind).
//!
//! # Key principles
//!
//! - One stream per event kind, shared by all tenants; isolation is by the `tenant_id`
//!   field on every entry, never by stream partitioning.
//! - Per-stream append order is preserved; there is no ordering guarantee across streams.
//! - Delivery is at-least-once: a consumer must ack an entry explicitly, and an unacked
//!   entry becomes eligible for reclaim by [`StreamTransport::claim_stale`] once it has
//!   been pending longer than the caller's idle threshold.
//!
//! # Implementations
//!
//! - `RedisStreamTransport` (in `substrate-redis-streams`): production implementation over
//!   Redis Streams (`XADD`/`XREADGROUP`/`XACK`/`XCLAIM`).
//! - `InMemoryStreamTransport` (in `substrate-testing`): fast, deterministic test double.
//!
//! # Dyn compatibility
//!
//! Like the rest of this crate's trait abstractions, this trait returns
//! `Pin<Box<dyn Future>>` instead of using `async fn`, so that the relay and the consumer
//! can hold it as `Arc<dyn StreamTransport>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use thiserror::Error;

use crate::event::WireEvent;

/// Errors raised by a [`StreamTransport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport could not be reached at all (connection refused, DNS failure, …).
    #[error("transport connection failed: {0}")]
    ConnectionFailed(String),

    /// Appending an entry to a stream failed.
    #[error("publish to stream {stream} failed: {reason}")]
    PublishFailed {
        /// The stream that was being written to.
        stream: String,
        /// Underlying reason.
        reason: String,
    },

    /// Creating or joining a consumer group failed.
    #[error("consumer group error on stream {stream}, group {group}: {reason}")]
    ConsumerGroupError {
        /// The stream the group lives on.
        stream: String,
        /// The group name.
        group: String,
        /// Underlying reason.
        reason: String,
    },

    /// Acknowledging an entry failed.
    #[error("ack failed for entry {entry_id} on stream {stream}: {reason}")]
    AckFailed {
        /// The stream the entry lives on.
        stream: String,
        /// The opaque entry id.
        entry_id: String,
        /// Underlying reason.
        reason: String,
    },

    /// An entry on the wire could not be decoded as a [`WireEvent`].
    #[error("failed to decode stream entry: {0}")]
    DecodeFailed(String),

    /// Any other transport-level failure not covered above.
    #[error("transport error: {0}")]
    Other(String),
}

/// An entry read back off a stream: the transport-assigned id plus the decoded event.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Opaque, monotonically increasing identifier assigned by the transport.
    pub entry_id: String,
    /// The decoded event envelope.
    pub event: WireEvent,
}

/// A fallible stream of [`StreamEntry`] results, as returned by
/// [`StreamTransport::subscribe`].
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<StreamEntry, TransportError>> + Send>>;

/// Abstraction over an append-only, consumer-grouped event log.
///
/// See the module docs for the operation set and delivery semantics.
pub trait StreamTransport: Send + Sync {
    /// Append `event` to the stream named after `kind`. Returns the transport-assigned
    /// entry id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the append could not be durably
    /// committed to the transport.
    fn publish(
        &self,
        stream: &str,
        event: &WireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send + '_>>;

    /// Join `consumer` to `group` on `stream` and return an iterator of entries either
    /// never delivered to this group, or previously delivered and not yet acked.
    ///
    /// Creates the consumer group on demand if it does not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConsumerGroupError`] if the group cannot be created or
    /// joined.
    fn subscribe(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EntryStream, TransportError>> + Send + '_>>;

    /// Acknowledge `entry_id` on `stream` for `group`, removing it from the group's
    /// pending-entries list. Idempotent: acking an already-acked entry is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AckFailed`] if the transport could not be reached.
    fn ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Re-deliver to the calling consumer any entries in `group`'s pending list that have
    /// been idle longer than `idle_threshold` — i.e., claimed by some other consumer that
    /// crashed or hung before acking. Returns the reclaimed entries' ids.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] if the transport could not be reached.
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        idle_threshold: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>>;
}
