//! Redis Streams transport implementation for the event delivery substrate.
//!
//! This crate provides a production-ready [`RedisStreamTransport`] that implements the
//! [`StreamTransport`] trait from `substrate-core`, using Redis Streams consumer groups
//! (`XADD`/`XGROUP`/`XREADGROUP`/`XACK`/`XPENDING`/`XCLAIM`) for at-least-once delivery.
//!
//! # Why Redis Streams?
//!
//! - **Consumer groups built in**: `XREADGROUP` gives load-balanced delivery and a
//!   per-group pending-entries list for free, without a separate offset-tracking table.
//! - **Simple operations**: a single Redis deployment serves both the stream transport and
//!   (optionally) caching, with no separate broker cluster to run.
//! - **Explicit reclaim**: `XPENDING` + `XCLAIM` make "this consumer died mid-processing"
//!   an ordinary, queryable state rather than a session timeout the client can't see.
//!
//! # Delivery semantics
//!
//! **At-least-once delivery** with explicit acknowledgement:
//! - Entries are forwarded to the subscriber's channel as soon as they're read.
//! - The entry remains in the consumer group's pending-entries list until the caller
//!   explicitly calls [`StreamTransport::ack`].
//! - If the consumer crashes before acking, [`StreamTransport::claim_stale`] lets another
//!   consumer (or the same one, restarted) reclaim and reprocess the entry.
//! - Subscribers MUST be idempotent; the idempotency ledger in `substrate-core` exists for
//!   exactly this reason.
//!
//! # Example
//!
//! ```no_run
//! use substrate_redis_streams::RedisStreamTransport;
//! use substrate_core::transport::StreamTransport;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedisStreamTransport::new("redis://localhost:6379").await?;
//!
//! let mut entries = transport.subscribe("sale_recorded", "billing-worker", "worker-1").await?;
//! while let Some(result) = entries.next().await {
//!     match result {
//!         Ok(entry) => println!("received {}", entry.entry_id),
//!         Err(e) => eprintln!("error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, Value};
use substrate_core::event::WireEvent;
use substrate_core::transport::{EntryStream, StreamEntry, StreamTransport, TransportError};

/// Redis Streams implementation of [`StreamTransport`].
///
/// # Configuration
///
/// - **Connection URL**: a `redis://` or `rediss://` URL (required)
/// - **Buffer size**: channel capacity between the background reader task and the
///   subscriber's stream (default: 1000)
/// - **Block timeout**: how long a single `XREADGROUP` call blocks waiting for new entries
///   before looping again to check for shutdown (default: 5 seconds)
///
/// # Example
///
/// ```no_run
/// use substrate_redis_streams::RedisStreamTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RedisStreamTransport::builder()
///     .url("redis://localhost:6379")
///     .buffer_size(500)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisStreamTransport {
    manager: ConnectionManager,
    buffer_size: usize,
    block_timeout: Duration,
}

impl RedisStreamTransport {
    /// Connect to Redis at `url` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the URL is invalid or the connection
    /// cannot be established.
    pub async fn new(url: &str) -> Result<Self, TransportError> {
        Self::builder().url(url).build().await
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedisStreamTransportBuilder {
        RedisStreamTransportBuilder::default()
    }
}

/// Builder for [`RedisStreamTransport`].
#[derive(Default)]
pub struct RedisStreamTransportBuilder {
    url: Option<String>,
    buffer_size: Option<usize>,
    block_timeout: Option<Duration>,
}

impl RedisStreamTransportBuilder {
    /// Set the Redis connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the channel buffer size between the reader task and the subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set how long a single blocking read waits for new entries before looping again.
    #[must_use]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    /// Connect and build the [`RedisStreamTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the URL is missing, invalid, or the
    /// connection cannot be established.
    pub async fn build(self) -> Result<RedisStreamTransport, TransportError> {
        let url = self
            .url
            .ok_or_else(|| TransportError::ConnectionFailed("redis url not configured".into()))?;

        let client = Client::open(url.as_str())
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid redis url: {e}")))?;

        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let buffer_size = self.buffer_size.unwrap_or(1000);
        let block_timeout = self.block_timeout.unwrap_or(Duration::from_secs(5));

        tracing::info!(
            buffer_size,
            block_timeout_ms = block_timeout.as_millis(),
            "RedisStreamTransport connected"
        );

        Ok(RedisStreamTransport {
            manager,
            buffer_size,
            block_timeout,
        })
    }
}

/// Decode one stream entry's flat `[field, value, field, value, ...]` array, pulling out
/// the `event` field's raw bytes.
fn extract_event_field(fields: &Value) -> Result<Vec<u8>, TransportError> {
    let Value::Array(items) = fields else {
        return Err(TransportError::DecodeFailed(
            "stream entry fields are not an array".to_string(),
        ));
    };

    let mut iter = items.iter();
    while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
        let Value::BulkString(key_bytes) = key else {
            continue;
        };
        if key_bytes == b"event" {
            return match val {
                Value::BulkString(bytes) => Ok(bytes.clone()),
                other => Err(TransportError::DecodeFailed(format!(
                    "event field is not a bulk string: {other:?}"
                ))),
            };
        }
    }

    Err(TransportError::DecodeFailed(
        "stream entry has no event field".to_string(),
    ))
}

/// Parse an `XREADGROUP`-shaped reply (`[[stream, [[id, fields], ...]], ...]`) for a single
/// stream into `(entry_id, raw_event_bytes)` pairs.
fn parse_read_reply(reply: Value) -> Result<Vec<(String, Vec<u8>)>, TransportError> {
    let Value::Array(streams) = reply else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for stream_entry in streams {
        let Value::Array(pair) = stream_entry else {
            continue;
        };
        let Some(Value::Array(entries)) = pair.into_iter().nth(1) else {
            continue;
        };
        for entry in entries {
            let Value::Array(entry_parts) = entry else {
                continue;
            };
            let mut parts = entry_parts.into_iter();
            let Some(Value::BulkString(id_bytes)) = parts.next() else {
                continue;
            };
            let Some(fields) = parts.next() else {
                continue;
            };
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            let bytes = extract_event_field(&fields)?;
            out.push((id, bytes));
        }
    }
    Ok(out)
}

/// Parse the entry ids returned by `XPENDING stream group IDLE ms - + count`.
fn parse_pending_summary(reply: Value) -> Vec<String> {
    let Value::Array(rows) = reply else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| {
            let Value::Array(fields) = row else {
                return None;
            };
            match fields.into_iter().next() {
                Some(Value::BulkString(id)) => Some(String::from_utf8_lossy(&id).to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Parse an `XCLAIM` reply (`[[id, fields], ...]`) into decoded `(id, bytes)` pairs.
fn parse_claim_reply(reply: Value) -> Result<Vec<(String, Vec<u8>)>, TransportError> {
    let Value::Array(entries) = reply else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in entries {
        let Value::Array(entry_parts) = entry else {
            continue;
        };
        let mut parts = entry_parts.into_iter();
        let Some(Value::BulkString(id_bytes)) = parts.next() else {
            continue;
        };
        let Some(fields) = parts.next() else {
            continue;
        };
        let id = String::from_utf8_lossy(&id_bytes).to_string();
        let bytes = extract_event_field(&fields)?;
        out.push((id, bytes));
    }
    Ok(out)
}

fn decode_entry(entry_id: String, bytes: Vec<u8>) -> Result<StreamEntry, TransportError> {
    let event =
        WireEvent::from_bytes(&bytes).map_err(|e| TransportError::DecodeFailed(e.to_string()))?;
    Ok(StreamEntry { entry_id, event })
}

/// `BUSYGROUP` is Redis's way of saying "the consumer group already exists" — not an error
/// for our purposes, since [`StreamTransport::subscribe`] is meant to be idempotent.
fn is_busygroup(err: &redis::RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

impl StreamTransport for RedisStreamTransport {
    fn publish(
        &self,
        stream: &str,
        event: &WireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send + '_>> {
        let stream = stream.to_string();
        let event = event.clone();
        Box::pin(async move {
            let bytes = event.to_bytes().map_err(|e| TransportError::PublishFailed {
                stream: stream.clone(),
                reason: e.to_string(),
            })?;

            let mut conn = self.manager.clone();
            let entry_id: String = redis::cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg("event")
                .arg(bytes)
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::PublishFailed {
                    stream: stream.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(stream = %stream, entry_id = %entry_id, event_id = %event.event_id, "event published");
            metrics::counter!("transport_published_total", "stream" => stream.clone())
                .increment(1);
            Ok(entry_id)
        })
    }

    fn subscribe(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EntryStream, TransportError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let buffer_size = self.buffer_size;
        let block_timeout = self.block_timeout;
        let manager = self.manager.clone();

        Box::pin(async move {
            let mut conn = manager.clone();
            let create_result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            if let Err(e) = create_result {
                if !is_busygroup(&e) {
                    return Err(TransportError::ConsumerGroupError {
                        stream: stream.clone(),
                        group: group.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            tracing::info!(stream = %stream, group = %group, consumer = %consumer, "subscribed to stream");

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            tokio::spawn(async move {
                let mut conn = manager;
                let mut draining_pending = true;

                loop {
                    let read_id = if draining_pending { "0" } else { ">" };
                    let mut cmd = redis::cmd("XREADGROUP");
                    cmd.arg("GROUP")
                        .arg(&group)
                        .arg(&consumer)
                        .arg("COUNT")
                        .arg(100);
                    if !draining_pending {
                        cmd.arg("BLOCK").arg(block_timeout.as_millis() as i64);
                    }
                    cmd.arg("STREAMS").arg(&stream).arg(read_id);

                    let reply: redis::RedisResult<Value> = cmd.query_async(&mut conn).await;

                    let reply = match reply {
                        Ok(Value::Nil) => {
                            if draining_pending {
                                draining_pending = false;
                            }
                            continue;
                        }
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(stream = %stream, error = %e, "XREADGROUP failed");
                            if tx
                                .send(Err(TransportError::Other(e.to_string())))
                                .await
                                .is_err()
                            {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            continue;
                        }
                    };

                    let entries = match parse_read_reply(reply) {
                        Ok(e) => e,
                        Err(decode_err) => {
                            if tx.send(Err(decode_err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    if draining_pending && entries.is_empty() {
                        draining_pending = false;
                        continue;
                    }

                    let mut disconnected = false;
                    for (entry_id, bytes) in entries {
                        let decoded = decode_entry(entry_id, bytes);
                        if tx.send(decoded).await.is_err() {
                            disconnected = true;
                            break;
                        }
                    }
                    if disconnected {
                        tracing::debug!(stream = %stream, "subscriber dropped, stopping reader task");
                        break;
                    }
                }
            });

            let out_stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(out_stream) as EntryStream)
        })
    }

    fn ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let entry_id = entry_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("XACK")
                .arg(&stream)
                .arg(&group)
                .arg(&entry_id)
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::AckFailed {
                    stream: stream.clone(),
                    entry_id: entry_id.clone(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        idle_threshold: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let idle_ms = i64::try_from(idle_threshold.as_millis()).unwrap_or(i64::MAX);

            let pending_reply: Value = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&group)
                .arg("IDLE")
                .arg(idle_ms)
                .arg("-")
                .arg("+")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;

            let ids = parse_pending_summary(pending_reply);
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut cmd = redis::cmd("XCLAIM");
            cmd.arg(&stream).arg(&group).arg(&consumer).arg(idle_ms);
            for id in &ids {
                cmd.arg(id);
            }
            let claim_reply: Value = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;

            let claimed = parse_claim_reply(claim_reply)?;
            if !claimed.is_empty() {
                tracing::warn!(
                    stream = %stream,
                    group = %group,
                    consumer = %consumer,
                    count = claimed.len(),
                    "claimed stale pending entries"
                );
                metrics::counter!("transport_claimed_stale_total", "stream" => stream.clone())
                    .increment(claimed.len() as u64);
            }

            claimed
                .into_iter()
                .map(|(id, bytes)| decode_entry(id, bytes))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_stream_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedisStreamTransport>();
        assert_sync::<RedisStreamTransport>();
    }

    #[test]
    fn builder_default_has_no_url() {
        let builder = RedisStreamTransport::builder();
        assert!(builder.url.is_none());
    }

    #[test]
    fn extract_event_field_finds_value_among_other_fields() {
        let fields = Value::Array(vec![
            Value::BulkString(b"tenant".to_vec()),
            Value::BulkString(b"ignored".to_vec()),
            Value::BulkString(b"event".to_vec()),
            Value::BulkString(b"payload-bytes".to_vec()),
        ]);
        let bytes = extract_event_field(&fields).expect("event field present");
        assert_eq!(bytes, b"payload-bytes");
    }

    #[test]
    fn extract_event_field_errors_when_missing() {
        let fields = Value::Array(vec![
            Value::BulkString(b"tenant".to_vec()),
            Value::BulkString(b"ignored".to_vec()),
        ]);
        assert!(extract_event_field(&fields).is_err());
    }
}
