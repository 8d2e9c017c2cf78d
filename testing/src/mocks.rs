//! In-memory test doubles for every trait in `substrate-core`.
//!
//! Mirrors this codebase's existing pattern of keeping a fast, deterministic double
//! alongside the real `sqlx`/Redis-backed implementation, so property and scenario tests
//! don't need Docker. Lock-sensitive behavior (row-level locking under `FOR UPDATE`,
//! crash-recovery races) is NOT faithfully represented here — those are covered by
//! `substrate-postgres`'s `testcontainers` integration tests instead.
//!
//! # The `InMemoryTx` marker
//!
//! `substrate-postgres` enforces "append/record-processed must run inside an open
//! transaction" structurally, by making those concrete methods take `&mut
//! sqlx::Transaction<'_, Postgres>`. This crate has no `sqlx` dependency, so it models the
//! same structural constraint with its own transaction marker, [`InMemoryTx`]: staged
//! writes only become visible to readers after [`InMemoryTx::commit`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use substrate_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterStatus, DeadLetterStore,
};
use substrate_core::event::{EventRecord, OutboxStatus};
use substrate_core::ids::{EventId, TenantId};
use substrate_core::ledger::{IdempotencyLedger, LedgerError};
use substrate_core::outbox::{OutboxError, OutboxStore};
use substrate_core::transport::{EntryStream, StreamEntry, StreamTransport, TransportError};

/// Lock `m`, recovering the guard even if a prior holder panicked while holding it. These
/// doubles have no invariant that a panic mid-mutation could violate beyond "the map has a
/// partial update", which is harmless for a test double.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transaction marker for the in-memory doubles, mirroring the role
/// `sqlx::Transaction<'_, Postgres>` plays for the real stores: operations staged against
/// it are invisible until [`InMemoryTx::commit`] runs them.
#[derive(Default)]
pub struct InMemoryTx {
    ops: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryTx {
    /// Begin a new transaction with nothing staged yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every staged operation, in staging order.
    pub fn commit(self) {
        for op in self.ops {
            op();
        }
    }

    /// Discard every staged operation.
    pub fn rollback(self) {
        drop(self);
    }
}

/// In-memory [`OutboxStore`] double.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    rows: Arc<Mutex<HashMap<EventId, EventRecord>>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `record` into `tx`. Mirrors `PostgresOutboxStore::append`: rejects a
    /// duplicate `event_id` immediately (as a real unique-constraint violation would),
    /// even though the insert itself is deferred to `tx.commit()`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DuplicateEventId`] if `record.event_id` is already present.
    pub fn append(&self, tx: &mut InMemoryTx, record: &EventRecord) -> Result<(), OutboxError> {
        if lock(&self.rows).contains_key(&record.event_id) {
            return Err(OutboxError::DuplicateEventId(record.event_id));
        }
        let rows = Arc::clone(&self.rows);
        let record = record.clone();
        tx.ops.push(Box::new(move || {
            lock(&rows).insert(record.event_id, record);
        }));
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn read_pending(
        &self,
        batch_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventRecord>, OutboxError>> + Send + '_>> {
        let batch_size = batch_size as usize;
        Box::pin(async move {
            let rows = lock(&self.rows);
            let mut pending: Vec<EventRecord> = rows
                .values()
                .filter(|r| r.status == OutboxStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.event_id.cmp(&b.event_id)));
            pending.truncate(batch_size);
            Ok(pending)
        })
    }

    fn claim_for_publish(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = lock(&self.rows);
            let Some(row) = rows.get_mut(&event_id) else {
                return Ok(None);
            };
            if row.status != OutboxStatus::Pending {
                return Ok(None);
            }
            row.status = OutboxStatus::Publishing;
            Ok(Some(row.clone()))
        })
    }

    fn mark_published(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = lock(&self.rows);
            let Some(row) = rows.get_mut(&event_id) else {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row does not exist".to_string(),
                });
            };
            if row.status != OutboxStatus::Publishing {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row is not in publishing status".to_string(),
                });
            }
            row.status = OutboxStatus::Published;
            row.published_at = Some(chrono::Utc::now());
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
            let mut rows = lock(&self.rows);
            let Some(row) = rows.get_mut(&event_id) else {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row does not exist".to_string(),
                });
            };
            if row.status != OutboxStatus::Publishing {
                return Err(OutboxError::InvalidTransition {
                    event_id,
                    reason: "row is not in publishing status".to_string(),
                });
            }
            row.retry_count += 1;
            row.error_message = Some(error);
            if row.retry_count >= max_retries {
                row.status = OutboxStatus::Failed;
                row.failed_at = Some(chrono::Utc::now());
            } else {
                row.status = OutboxStatus::Pending;
            }
            Ok(())
        })
    }

    fn reclaim_stuck(
        &self,
        _reclaim_timeout_secs: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        // The in-memory double has no `claimed_at` timestamp and no concurrent relay
        // instances racing for rows, so there is nothing to reclaim; crash-recovery
        // behavior is exercised against the real store in `substrate-postgres`'s
        // integration tests instead.
        Box::pin(async move { Ok(0) })
    }
}

/// In-memory [`IdempotencyLedger`] double.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    processed: Arc<Mutex<HashMap<EventId, chrono::DateTime<chrono::Utc>>>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event_id` as processed inside `tx`. Mirrors
    /// `PostgresLedger::record_processed`'s signature so a binary can swap one for the
    /// other behind the same [`crate::mocks`]-style function pointer.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyProcessed`] if `event_id` is already recorded.
    pub fn record_processed(
        &self,
        tx: &mut InMemoryTx,
        event_id: EventId,
        _tenant_id: TenantId,
        _kind: substrate_core::event::EventKind,
        _result: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        if lock(&self.processed).contains_key(&event_id) {
            return Err(LedgerError::AlreadyProcessed(event_id));
        }
        let processed = Arc::clone(&self.processed);
        tx.ops.push(Box::new(move || {
            lock(&processed).insert(event_id, chrono::Utc::now());
        }));
        Ok(())
    }
}

impl IdempotencyLedger for InMemoryLedger {
    fn was_processed(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move { Ok(lock(&self.processed).contains_key(&event_id)) })
    }
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    /// group -> entry_ids pending ack
    pending: HashMap<String, Vec<String>>,
    next_id: u64,
}

/// In-memory [`StreamTransport`] double. A `subscribe` call snapshots the stream and pending
/// list at call time and never receives entries published afterward — good enough for
/// scenario tests that publish before subscribing, which is how the relay and the consumer
/// are actually used in this substrate.
#[derive(Clone, Default)]
pub struct InMemoryStreamTransport {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
}

impl InMemoryStreamTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamTransport for InMemoryStreamTransport {
    fn publish(
        &self,
        stream: &str,
        event: &substrate_core::event::WireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send + '_>> {
        let stream = stream.to_string();
        let event = event.clone();
        Box::pin(async move {
            let mut streams = lock(&self.streams);
            let state = streams.entry(stream).or_default();
            state.next_id += 1;
            let entry_id = state.next_id.to_string();
            state.entries.push(StreamEntry {
                entry_id: entry_id.clone(),
                event,
            });
            Ok(entry_id)
        })
    }

    fn subscribe(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EntryStream, TransportError>> + Send + '_>> {
        let stream_name = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let entries = {
                let mut streams = lock(&self.streams);
                let state = streams.entry(stream_name.clone()).or_default();
                let pending = state.pending.entry(group.clone()).or_default();
                let to_deliver: Vec<StreamEntry> = state
                    .entries
                    .iter()
                    .filter(|e| !pending.contains(&e.entry_id))
                    .cloned()
                    .collect();
                pending.extend(to_deliver.iter().map(|e| e.entry_id.clone()));
                to_deliver
            };

            let out_stream = async_stream::stream! {
                for entry in entries {
                    yield Ok(entry);
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
            let mut streams = lock(&self.streams);
            if let Some(state) = streams.get_mut(&stream) {
                if let Some(pending) = state.pending.get_mut(&group) {
                    pending.retain(|id| id != &entry_id);
                }
            }
            Ok(())
        })
    }

    fn claim_stale(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _idle_threshold: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>> {
        // No idle tracking in the double; reclaim semantics are exercised against the real
        // Redis transport in `substrate-redis-streams`'s integration tests.
        Box::pin(async move { Ok(Vec::new()) })
    }
}

/// In-memory [`DeadLetterStore`] double.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<Mutex<HashMap<EventId, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn park(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.entries).insert(entry.event_id, entry);
            Ok(())
        })
    }

    fn list_pending(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>> {
        let limit = limit as usize;
        Box::pin(async move {
            let entries = lock(&self.entries);
            let mut pending: Vec<DeadLetterEntry> = entries
                .values()
                .filter(|e| e.status == DeadLetterStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by(|a, b| b.parked_at.cmp(&a.parked_at));
            pending.truncate(limit);
            Ok(pending)
        })
    }

    fn mark_resolved(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = lock(&self.entries);
            let entry = entries.get_mut(&event_id).ok_or(DeadLetterError::NotFound(event_id))?;
            entry.status = DeadLetterStatus::Resolved;
            Ok(())
        })
    }

    fn mark_discarded(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = lock(&self.entries);
            let entry = entries.get_mut(&event_id).ok_or(DeadLetterError::NotFound(event_id))?;
            entry.status = DeadLetterStatus::Discarded;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use substrate_core::event::{EventKind, Payload};

    fn sample_record() -> EventRecord {
        EventRecord::new(
            TenantId::new(),
            EventKind::QuoteCreated,
            Payload::QuoteCreated {
                quote_id: "q-1".to_string(),
                client_id: "c-1".to_string(),
                items: vec![],
                extra: Map::new(),
            },
            "1.0",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn append_is_invisible_until_commit() {
        let store = InMemoryOutboxStore::new();
        let record = sample_record();
        let event_id = record.event_id;

        let mut tx = InMemoryTx::new();
        store.append(&mut tx, &record).unwrap();

        assert!(store.read_pending(10).await.unwrap().is_empty());
        tx.commit();

        let pending = store.read_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, event_id);
    }

    #[tokio::test]
    async fn rollback_discards_staged_append() {
        let store = InMemoryOutboxStore::new();
        let mut tx = InMemoryTx::new();
        store.append(&mut tx, &sample_record()).unwrap();
        tx.rollback();

        assert!(store.read_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_for_publish_is_exclusive() {
        let store = InMemoryOutboxStore::new();
        let record = sample_record();
        let event_id = record.event_id;
        let mut tx = InMemoryTx::new();
        store.append(&mut tx, &record).unwrap();
        tx.commit();

        let first = store.claim_for_publish(event_id).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_for_publish(event_id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_the_entry() {
        use futures::StreamExt;

        let transport = InMemoryStreamTransport::new();
        let record = sample_record();
        let wire = record.to_wire().unwrap();
        transport.publish("quote_created", &wire).await.unwrap();

        let mut entries = transport.subscribe("quote_created", "billing", "w1").await.unwrap();
        let entry = entries.next().await.unwrap().unwrap();
        assert_eq!(entry.event.event_id, wire.event_id);
    }

    #[tokio::test]
    async fn ledger_rejects_duplicate_record_processed() {
        let ledger = InMemoryLedger::new();
        let event_id = EventId::new();
        let tenant_id = TenantId::new();

        let mut tx = InMemoryTx::new();
        ledger
            .record_processed(&mut tx, event_id, tenant_id, EventKind::QuoteCreated, None)
            .unwrap();
        tx.commit();

        assert!(ledger.was_processed(event_id).await.unwrap());

        let mut tx2 = InMemoryTx::new();
        let err = ledger
            .record_processed(&mut tx2, event_id, tenant_id, EventKind::QuoteCreated, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed(id) if id == event_id));
    }

    #[tokio::test]
    async fn dead_letter_lifecycle() {
        let store = InMemoryDeadLetterStore::new();
        let entry = DeadLetterEntry {
            event_id: EventId::new(),
            tenant_id: TenantId::new(),
            kind: EventKind::SaleRecorded,
            payload: serde_json::json!({}),
            error_message: "boom".to_string(),
            retry_count: 3,
            parked_at: chrono::Utc::now(),
            status: DeadLetterStatus::Pending,
        };
        store.park(entry.clone()).await.unwrap();

        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);
        store.mark_resolved(entry.event_id).await.unwrap();
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }
}
