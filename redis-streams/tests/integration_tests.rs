//! Integration tests for [`RedisStreamTransport`] against a real Redis instance via
//! testcontainers.
//!
//! # Requirements
//!
//! Docker must be running to execute these tests.

#![allow(clippy::expect_used)]

use std::time::Duration;

use futures::StreamExt;
use substrate_core::event::{EventKind, EventRecord, Payload};
use substrate_core::ids::TenantId;
use substrate_core::transport::StreamTransport;
use substrate_redis_streams::RedisStreamTransport;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

async fn setup() -> (ContainerAsync<Redis>, RedisStreamTransport) {
    let container = Redis::default().start().await.expect("start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("get redis port");
    let url = format!("redis://localhost:{port}");
    let transport = RedisStreamTransport::new(&url)
        .await
        .expect("connect to redis");
    (container, transport)
}

fn quote_created(quote_id: &str) -> Payload {
    Payload::QuoteCreated {
        quote_id: quote_id.to_string(),
        client_id: "client-1".to_string(),
        items: vec![],
        extra: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn publish_then_subscribe_delivers_the_event() {
    let (_container, transport) = setup().await;

    let record = EventRecord::new(TenantId::new(), EventKind::QuoteCreated, quote_created("q-1"), "1.0")
        .expect("valid record");
    let wire = record.to_wire().expect("wire encode");

    transport
        .publish("quote_created", &wire)
        .await
        .expect("publish");

    let mut entries = transport
        .subscribe("quote_created", "billing", "worker-1")
        .await
        .expect("subscribe");

    let entry = tokio::time::timeout(Duration::from_secs(5), entries.next())
        .await
        .expect("did not time out")
        .expect("stream yielded an item")
        .expect("entry decoded");

    assert_eq!(entry.event.event_id, wire.event_id);
}

#[tokio::test]
async fn unacked_entries_are_reclaimable_via_claim_stale() {
    let (_container, transport) = setup().await;

    let record = EventRecord::new(TenantId::new(), EventKind::QuoteCreated, quote_created("q-2"), "1.0")
        .expect("valid record");
    let wire = record.to_wire().expect("wire encode");

    transport
        .publish("quote_created", &wire)
        .await
        .expect("publish");

    // First consumer reads but never acks (simulates a crash mid-processing).
    let mut entries = transport
        .subscribe("quote_created", "billing", "worker-1")
        .await
        .expect("subscribe");
    let entry = tokio::time::timeout(Duration::from_secs(5), entries.next())
        .await
        .expect("did not time out")
        .expect("stream yielded an item")
        .expect("entry decoded");

    let claimed = transport
        .claim_stale("quote_created", "billing", "worker-2", Duration::from_millis(0))
        .await
        .expect("claim stale");

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].entry_id, entry.entry_id);

    transport
        .ack("quote_created", "billing", &claimed[0].entry_id)
        .await
        .expect("ack");
}

#[tokio::test]
async fn subscribe_is_idempotent_when_group_already_exists() {
    let (_container, transport) = setup().await;

    transport
        .subscribe("quote_created", "billing", "worker-1")
        .await
        .expect("first subscribe");

    transport
        .subscribe("quote_created", "billing", "worker-2")
        .await
        .expect("second subscribe should not fail on BUSYGROUP");
}
