//! Scenario tests for [`substrate_runtime::Relay`] against the in-memory doubles.
//!
//! The consumer/dispatcher loop needs a real `sqlx::PgPool` (handlers take a live
//! transaction), so its scenarios live in `substrate-postgres`'s `testcontainers` suite
//! instead; what's testable here without Docker is the relay's publish path end to end.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use substrate_core::event::{EventKind, OutboxStatus};
use substrate_core::ids::{EventId, TenantId};
use substrate_core::outbox::OutboxStore;
use substrate_core::transport::{EntryStream, StreamTransport, TransportError};
use substrate_runtime::{Config, Relay};
use substrate_testing::helpers::{sample_quote_created_for, sample_sale_recorded_for};
use substrate_testing::mocks::{InMemoryOutboxStore, InMemoryStreamTransport, InMemoryTx};
use tokio::sync::watch;

/// Wraps [`InMemoryStreamTransport`] and always fails `publish` for one specific event id,
/// delegating everything else to the inner transport. Used to drive the relay's
/// failure-ordering contract, which the in-memory transport alone cannot exercise since it
/// never fails on its own.
struct FlakyTransport {
    inner: InMemoryStreamTransport,
    poison_event_id: EventId,
}

impl FlakyTransport {
    fn new(poison_event_id: EventId) -> Self {
        Self {
            inner: InMemoryStreamTransport::new(),
            poison_event_id,
        }
    }
}

impl StreamTransport for FlakyTransport {
    fn publish(
        &self,
        stream: &str,
        event: &substrate_core::event::WireEvent,
    ) -> Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send + '_>> {
        if event.event_id == self.poison_event_id {
            let stream = stream.to_string();
            return Box::pin(async move {
                Err(TransportError::PublishFailed {
                    stream,
                    reason: "simulated failure".to_string(),
                })
            });
        }
        self.inner.publish(stream, event)
    }

    fn subscribe(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EntryStream, TransportError>> + Send + '_>> {
        self.inner.subscribe(stream, group, consumer)
    }

    fn ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        self.inner.ack(stream, group, entry_id)
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        idle_threshold: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<substrate_core::transport::StreamEntry>, TransportError>> + Send + '_>>
    {
        self.inner.claim_stale(stream, group, consumer, idle_threshold)
    }
}

fn test_config() -> Config {
    Config {
        database_url: "postgres://unused/test".to_string(),
        redis_url: "redis://unused".to_string(),
        outbox_batch_size: 50,
        relay_poll_interval: Duration::from_millis(5),
        relay_max_retries: 3,
        relay_reclaim_timeout: Duration::from_secs(30),
        consumer_block_timeout: Duration::from_secs(5),
        handler_deadline: Duration::from_secs(30),
        consumer_group_name: "default".to_string(),
        stream_maxlen: 1_000_000,
    }
}

/// Runs an `Arc<Relay>`'s loop for `budget`, then shuts it down and waits for exit. Tests
/// hold the relay behind an `Arc` so the spawned task can own a `'static` handle to it.
async fn run_relay_for_arc(relay: Arc<Relay>, budget: Duration) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(rx).await });
    tokio::time::sleep(budget).await;
    tx.send(true).expect("shutdown receiver still alive");
    handle.await.expect("relay task panicked").expect("relay returned an error");
}

#[tokio::test]
async fn published_row_is_invisible_on_the_transport_until_the_relay_runs() {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let transport = Arc::new(InMemoryStreamTransport::new());

    let record = sample_quote_created_for(TenantId::new());
    let event_id = record.event_id;
    let mut tx = InMemoryTx::new();
    outbox.append(&mut tx, &record).unwrap();
    tx.commit();

    let relay = Arc::new(Relay::new(outbox.clone(), transport.clone(), &test_config()));
    run_relay_for_arc(relay, Duration::from_millis(100)).await;

    let mut entries = transport.subscribe("quote_created", "g1", "w1").await.unwrap();
    use futures::StreamExt;
    let entry = entries.next().await.unwrap().unwrap();
    assert_eq!(entry.event.event_id, event_id);
}

#[tokio::test]
async fn relay_marks_published_rows_out_of_the_pending_read_set() {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let transport = Arc::new(InMemoryStreamTransport::new());

    let record = sample_sale_recorded_for(TenantId::new());
    let mut tx = InMemoryTx::new();
    outbox.append(&mut tx, &record).unwrap();
    tx.commit();

    let relay = Arc::new(Relay::new(outbox.clone(), transport, &test_config()));
    run_relay_for_arc(relay, Duration::from_millis(100)).await;

    assert!(outbox.read_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn fifo_within_a_tenant_and_kind_is_preserved_end_to_end() {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let transport = Arc::new(InMemoryStreamTransport::new());
    let tenant = TenantId::new();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let record = sample_quote_created_for(tenant);
        ids.push(record.event_id);
        let mut tx = InMemoryTx::new();
        outbox.append(&mut tx, &record).unwrap();
        tx.commit();
        // `created_at` has whole-microsecond resolution; a hair of spacing keeps the
        // ordering assertion meaningful instead of relying on HashMap iteration order.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let relay = Arc::new(Relay::new(outbox, transport.clone(), &test_config()));
    run_relay_for_arc(relay, Duration::from_millis(150)).await;

    use futures::StreamExt;
    let mut entries = transport.subscribe("quote_created", "g1", "w1").await.unwrap();
    let mut delivered = Vec::new();
    while let Some(Ok(entry)) = entries.next().await {
        delivered.push(entry.event.event_id);
    }
    assert_eq!(delivered, ids, "events for one (tenant, kind) must publish in staging order");
}

#[tokio::test]
async fn a_failed_publish_stalls_only_its_own_tenant_and_kind_partition() {
    // Two `quote_created` rows for the same tenant, oldest first. The transport always
    // fails the first row's publish; the second row, for the same (tenant, kind), must
    // never be attempted until the first one's failure resolves, even though the transport
    // would otherwise happily accept it.
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let tenant = TenantId::new();

    let first = sample_quote_created_for(tenant);
    let first_id = first.event_id;
    let second = sample_quote_created_for(tenant);
    let second_id = second.event_id;

    for record in [&first, &second] {
        let mut tx = InMemoryTx::new();
        outbox.append(&mut tx, record).unwrap();
        tx.commit();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let transport = Arc::new(FlakyTransport::new(first_id));
    // A high retry budget keeps the first row cycling back to `pending` instead of
    // terminating as `failed`, so it keeps blocking its partition for the whole test.
    let mut config = test_config();
    config.relay_max_retries = 1_000;
    let relay = Arc::new(Relay::new(outbox.clone(), transport, &config));
    run_relay_for_arc(relay, Duration::from_millis(100)).await;

    let pending = outbox.read_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2, "both rows remain pending: the poison row and its blocked sibling");
    let second_row = pending.iter().find(|r| r.event_id == second_id).expect("second row still pending");
    assert_eq!(
        second_row.retry_count, 0,
        "the second row must never have been attempted while the first was still failing"
    );
    let first_row = pending.iter().find(|r| r.event_id == first_id).expect("first row still pending");
    assert!(first_row.retry_count > 0, "the first row should have been retried repeatedly");
}

#[tokio::test]
async fn a_row_with_no_registered_stream_listener_does_not_block_the_rest_of_the_batch() {
    // Nothing subscribes to `sale_recorded` in this test; the relay still must publish it
    // (publishing does not require a subscriber) and must not let it stall other kinds.
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let transport = Arc::new(InMemoryStreamTransport::new());
    let tenant = TenantId::new();

    let unsubscribed = sample_sale_recorded_for(tenant);
    let watched = sample_quote_created_for(tenant);
    let watched_id = watched.event_id;

    for record in [&unsubscribed, &watched] {
        let mut tx = InMemoryTx::new();
        outbox.append(&mut tx, record).unwrap();
        tx.commit();
    }

    let relay = Arc::new(Relay::new(outbox, transport.clone(), &test_config()));
    run_relay_for_arc(relay, Duration::from_millis(100)).await;

    use futures::StreamExt;
    let mut entries = transport.subscribe("quote_created", "g1", "w1").await.unwrap();
    let entry = entries.next().await.unwrap().unwrap();
    assert_eq!(entry.event.event_id, watched_id);
}

#[tokio::test]
async fn claim_for_publish_prevents_a_second_relay_from_double_publishing() {
    // Simulates two relay instances racing the same row: the second claim attempt must see
    // nothing to do, which is the row-lock property `Relay::run_iteration` depends on for
    // horizontal scaling.
    let outbox = InMemoryOutboxStore::new();
    let record = sample_quote_created_for(TenantId::new());
    let event_id = record.event_id;
    let mut tx = InMemoryTx::new();
    outbox.append(&mut tx, &record).unwrap();
    tx.commit();

    let first = outbox.claim_for_publish(event_id).await.unwrap();
    assert_eq!(first.unwrap().status, OutboxStatus::Publishing);

    let second = outbox.claim_for_publish(event_id).await.unwrap();
    assert!(second.is_none(), "a row already being published must not be claimable again");
}

#[tokio::test]
async fn mark_failed_below_the_retry_budget_returns_the_row_to_pending() {
    let outbox = InMemoryOutboxStore::new();
    let record = sample_quote_created_for(TenantId::new());
    let event_id = record.event_id;
    let mut tx = InMemoryTx::new();
    outbox.append(&mut tx, &record).unwrap();
    tx.commit();

    outbox.claim_for_publish(event_id).await.unwrap();
    outbox.mark_failed(event_id, "transport unavailable", 5).await.unwrap();

    let pending = outbox.read_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[0].status, OutboxStatus::Pending);
}

#[tokio::test]
async fn mark_failed_at_the_retry_budget_terminates_as_failed() {
    let outbox = InMemoryOutboxStore::new();
    let record = sample_quote_created_for(TenantId::new());
    let event_id = record.event_id;
    let mut tx = InMemoryTx::new();
    outbox.append(&mut tx, &record).unwrap();
    tx.commit();

    outbox.claim_for_publish(event_id).await.unwrap();
    outbox.mark_failed(event_id, "permanently broken", 1).await.unwrap();

    assert!(outbox.read_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn two_different_event_kinds_use_two_different_stream_names() {
    assert_ne!(EventKind::QuoteCreated.stream_name(), EventKind::SaleRecorded.stream_name());
}
