//! In-memory test doubles and helpers for the event delivery substrate.
//!
//! This crate provides:
//! - [`mocks`]: in-memory implementations of every `substrate-core` store/transport trait
//! - A deterministic [`FixedClock`]/[`test_clock`] for reproducible timestamps in tests
//! - [`helpers`]: builders for sample events used across scenario and property tests
//!
//! ## Example
//!
//! ```
//! use substrate_testing::mocks::{InMemoryOutboxStore, InMemoryTx};
//! use substrate_testing::helpers::sample_quote_created;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryOutboxStore::new();
//! let record = sample_quote_created();
//!
//! let mut tx = InMemoryTx::new();
//! store.append(&mut tx, &record).unwrap();
//! tx.commit();
//! # });
//! ```

use chrono::{DateTime, Utc};

pub mod mocks;

/// Deterministic time for tests.
///
/// Unlike the rest of this substrate's types, `FixedClock` implements no shared trait —
/// nothing here needs to inject a clock behind a trait object, so it is just a plain value
/// callers can pass wherever a `DateTime<Utc>` is wanted.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock returning `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }

    /// The fixed time this clock always returns.
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Panics if the hardcoded timestamp fails to parse, which should never happen.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

/// Builders for sample events, shared across scenario and property tests so they don't each
/// reinvent a valid payload.
pub mod helpers {
    use serde_json::Map;
    use substrate_core::event::{EventRecord, LineItem, Payload};
    use substrate_core::ids::TenantId;

    /// A minimal, valid `quote_created` record for `tenant_id` (a fresh tenant if omitted).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn sample_quote_created() -> EventRecord {
        sample_quote_created_for(TenantId::new())
    }

    /// Same as [`sample_quote_created`], pinned to a caller-supplied tenant — useful for
    /// asserting per-tenant FIFO ordering.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn sample_quote_created_for(tenant_id: TenantId) -> EventRecord {
        EventRecord::new(
            tenant_id,
            substrate_core::event::EventKind::QuoteCreated,
            Payload::QuoteCreated {
                quote_id: uuid::Uuid::new_v4().to_string(),
                client_id: "client-1".to_string(),
                items: vec![LineItem {
                    product_id: "sku-1".to_string(),
                    quantity: "1.000".to_string(),
                    unit_price: "10.00".to_string(),
                    total: "10.00".to_string(),
                }],
                extra: Map::new(),
            },
            "1.0",
        )
        .expect("payload kind matches QuoteCreated")
    }

    /// A minimal, valid `sale_recorded` record for `tenant_id`.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn sample_sale_recorded_for(tenant_id: TenantId) -> EventRecord {
        EventRecord::new(
            tenant_id,
            substrate_core::event::EventKind::SaleRecorded,
            Payload::SaleRecorded {
                order_id: uuid::Uuid::new_v4().to_string(),
                quote_id: None,
                client_id: "client-1".to_string(),
                work_id: None,
                delivered_at: chrono::Utc::now(),
                total_value: "10.00".to_string(),
                items: vec![LineItem {
                    product_id: "sku-1".to_string(),
                    quantity: "1.000".to_string(),
                    unit_price: "10.00".to_string(),
                    total: "10.00".to_string(),
                }],
                extra: Map::new(),
            },
            "1.0",
        )
        .expect("payload kind matches SaleRecorded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_deterministic() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn sample_quote_created_has_the_declared_kind() {
        let record = helpers::sample_quote_created();
        assert_eq!(record.kind, substrate_core::event::EventKind::QuoteCreated);
    }
}
